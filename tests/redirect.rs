//! Runs a proxy in front of scripted backends and drives a client through it.

use bytes::Bytes;
use mt_multiproxy::{
    auth::{
        client::{login, Login},
        server::{accept_login, kick, ServerOptions},
        srp,
    },
    build_registry,
    content::{
        itemdefs::{self, ItemDef, ItemTable},
        nodedefs::{self, NodeDef},
    },
    credentials::{Credential, CredentialStore, MemoryStore},
    gateway,
    hooks::RedirectComplete,
    protocol::{
        packet::{
            to_clt::{AnnounceMedia, AoAdd, AoRmAdd, ItemDefs, Kick, NodeDefs},
            to_srv::{
                CltReady, FirstSrp, Init2, JoinModChan, LeaveModChan, SrpBytesA, SrpBytesM,
            },
            ToCltCmd, ToSrvCmd,
        },
        Encoder,
    },
    redirect::RedirectError,
    transport::{Listener, Peer},
    Config, Hooks, Proxy,
};
use std::{
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::timeout;

const FETCH_USER: &str = "fetcher";
const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Default)]
struct Script {
    nodes: Vec<(u16, &'static str)>,
    /// Kick everyone except the fetch user right after login.
    deny_players: bool,
    /// Sent to a player once it reports ready.
    on_ready: Vec<ToCltCmd>,
}

struct FakeBackend {
    addr: SocketAddr,
    /// Backend side of every player that finished joining.
    players: flume::Receiver<Peer>,
}

async fn spawn_backend(script: Script) -> FakeBackend {
    let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr();
    let (players_tx, players) = flume::unbounded();
    let script = Arc::new(script);
    tokio::spawn(async move {
        let store = Arc::new(MemoryStore::new());
        while let Ok(peer) = listener.accept().await {
            let (script, store, players_tx) =
                (Arc::clone(&script), Arc::clone(&store), players_tx.clone());
            tokio::spawn(async move {
                serve(peer, &script, &store, &players_tx).await;
            });
        }
    });
    FakeBackend { addr, players }
}

async fn serve(
    peer: Peer,
    script: &Script,
    store: &MemoryStore,
    players: &flume::Sender<Peer>,
) -> Option<()> {
    let player = accept_login(&peer, store, &ServerOptions::default())
        .await
        .ok()?;
    if script.deny_players && player.name != FETCH_USER {
        kick(&peer, Kick::custom("closed for maintenance")).await;
        return None;
    }

    loop {
        if let ToSrvCmd::Init2(_) = peer.recv_cmd().await.ok()? {
            break;
        }
    }
    let items = ItemTable {
        defs: vec![ItemDef {
            name: String::new(),
            def: itemdefs::simple_def("", &[]),
        }],
        aliases: Vec::new(),
    };
    let nodes: Vec<_> = script
        .nodes
        .iter()
        .map(|&(id, name)| NodeDef {
            id,
            name: name.to_owned(),
            def: nodedefs::simple_def(name, &[]),
        })
        .collect();
    for cmd in [
        ToCltCmd::ItemDefs(ItemDefs {
            defs: itemdefs::serialize(&items).unwrap(),
        }),
        ToCltCmd::NodeDefs(NodeDefs {
            defs: nodedefs::serialize(&nodes).unwrap(),
        }),
        ToCltCmd::AnnounceMedia(AnnounceMedia {
            files: Vec::new(),
            remote_servers: String::new(),
        }),
    ] {
        peer.send_cmd(&cmd).await.ok()?;
    }

    loop {
        if let ToSrvCmd::CltReady(_) = peer.recv_cmd().await.ok()? {
            break;
        }
    }
    for cmd in &script.on_ready {
        peer.send_cmd(cmd).await.ok()?;
    }
    players.send(peer).ok()
}

fn object(id: u16, name: &str, is_player: bool) -> AoAdd {
    let mut init_data = Vec::new();
    let mut encoder = Encoder::new(&mut init_data);
    encoder.write_u8(1);
    encoder.write_string(name);
    encoder.write_u8(is_player as u8);
    encoder.write_u16(0);
    AoAdd {
        id,
        kind: 101,
        init_data: init_data.into(),
    }
}

async fn start_proxy(backends: &[(&str, SocketAddr)], hooks: Hooks) -> (Proxy, SocketAddr) {
    start_proxy_with(backends, hooks, "").await
}

/// Like [`start_proxy`], with `extra` top-level configuration lines.
async fn start_proxy_with(
    backends: &[(&str, SocketAddr)],
    hooks: Hooks,
    extra: &str,
) -> (Proxy, SocketAddr) {
    let mut text = format!(
        "bind_addr = \"127.0.0.1:0\"\nfetch_user = \"{FETCH_USER}\"\nhandshake_timeout_secs = 5\n{extra}\n"
    );
    for (name, addr) in backends {
        text.push_str(&format!("[[servers]]\nname = \"{name}\"\naddr = \"{addr}\"\n"));
    }
    let config = Config::parse(&text).unwrap();
    let registry = build_registry(&config).await.unwrap();
    let listener = Listener::bind(config.bind_addr).await.unwrap();
    let addr = listener.local_addr();
    let proxy = Proxy::new(config, registry, Arc::new(MemoryStore::new()), hooks);
    tokio::spawn(gateway::run(proxy.clone(), listener));
    (proxy, addr)
}

async fn join(addr: SocketAddr, name: &str) -> Peer {
    let peer = Peer::connect(addr).await.unwrap();
    login(&peer, &Login::exact(name, "pw", 29, 42))
        .await
        .unwrap();
    peer.send_cmd(&ToSrvCmd::Init2(Init2 { lang: "en".into() }))
        .await
        .unwrap();
    next(&peer, |cmd| matches!(cmd, ToCltCmd::AnnounceMedia(_)).then_some(())).await;
    peer.send_cmd(&ToSrvCmd::CltReady(CltReady {
        major: 5,
        minor: 8,
        patch: 0,
        reserved: 0,
        version: "5.8.0".into(),
        rest: Bytes::new(),
    }))
    .await
    .unwrap();
    peer
}

/// Skips client messages until `f` picks one.
async fn next<T>(peer: &Peer, mut f: impl FnMut(ToCltCmd) -> Option<T>) -> T {
    timeout(WAIT, async {
        loop {
            let cmd = peer.recv_cmd::<ToCltCmd>().await.unwrap();
            if let Some(found) = f(cmd) {
                return found;
            }
        }
    })
    .await
    .expect("expected message did not arrive")
}

async fn within<F: Future>(f: F) -> F::Output {
    timeout(WAIT, f).await.expect("timed out")
}

fn recording_hooks() -> (Hooks, Arc<Mutex<Vec<RedirectComplete>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = Hooks::with_builtins();
    let recorded = Arc::clone(&events);
    hooks.on_redirect_complete(move |event| recorded.lock().unwrap().push(event.clone()));
    (hooks, events)
}

fn lobby() -> Script {
    Script {
        nodes: vec![(125, "unknown"), (126, "air"), (127, "ignore"), (5, "default:stone")],
        on_ready: vec![ToCltCmd::AoRmAdd(AoRmAdd {
            remove: Vec::new(),
            add: vec![
                object(1, "sam", true),
                object(3, "", false),
                object(9, "", false),
                object(12, "", false),
            ],
        })],
        ..Default::default()
    }
}

fn survival() -> Script {
    Script {
        nodes: vec![(126, "air"), (7, "default:stone"), (8, "survival:sand")],
        on_ready: vec![ToCltCmd::AoRmAdd(AoRmAdd {
            remove: Vec::new(),
            add: vec![object(40, "sam", true), object(41, "", false)],
        })],
        ..Default::default()
    }
}

#[tokio::test]
async fn redirect_clears_objects_and_closes_old_backend() {
    let a = spawn_backend(lobby()).await;
    let b = spawn_backend(survival()).await;
    let (hooks, events) = recording_hooks();
    let (proxy, addr) = start_proxy(&[("a", a.addr), ("b", b.addr)], hooks).await;

    let client = join(addr, "sam").await;
    let added = next(&client, |cmd| match cmd {
        ToCltCmd::AoRmAdd(msg) => Some(msg.add.iter().map(|a| a.id).collect::<Vec<_>>()),
        _ => None,
    })
    .await;
    assert_eq!(added, [1, 3, 9, 12]);
    let a_side = within(a.players.recv_async()).await.unwrap();
    assert_eq!(proxy.clients(), ["sam"]);
    assert_eq!(proxy.current_backend("sam").as_deref(), Some("a"));

    within(proxy.redirect("sam", "b")).await.unwrap();

    let removed = next(&client, |cmd| match cmd {
        ToCltCmd::AoRmAdd(msg) if !msg.remove.is_empty() => Some(msg),
        _ => None,
    })
    .await;
    assert_eq!(removed.remove, [3, 9, 12]);
    assert!(removed.add.is_empty());

    // The new backend's avatar is hidden; its other object comes through.
    let added = next(&client, |cmd| match cmd {
        ToCltCmd::AoRmAdd(msg) if !msg.add.is_empty() => Some(msg),
        _ => None,
    })
    .await;
    let ids: Vec<_> = added.add.iter().map(|a| a.id).collect();
    assert_eq!(ids, [41]);

    within(a_side.closed()).await;
    within(b.players.recv_async()).await.unwrap();
    assert_eq!(proxy.current_backend("sam").as_deref(), Some("b"));
    assert_eq!(
        *events.lock().unwrap(),
        [RedirectComplete {
            client: "sam".into(),
            target: "b".into(),
            success: true,
        }]
    );
}

#[tokio::test]
async fn failed_handshake_keeps_the_client_on_its_backend() {
    let a = spawn_backend(lobby()).await;
    let c = spawn_backend(Script {
        nodes: vec![(126, "air")],
        deny_players: true,
        ..Default::default()
    })
    .await;
    let (hooks, events) = recording_hooks();
    let (proxy, addr) = start_proxy(&[("a", a.addr), ("c", c.addr)], hooks).await;

    let client = join(addr, "sam").await;
    let a_side = within(a.players.recv_async()).await.unwrap();

    let result = within(proxy.redirect("sam", "c")).await;
    assert!(matches!(result, Err(RedirectError::Handshake(_))), "{result:?}");
    assert_eq!(proxy.current_backend("sam").as_deref(), Some("a"));
    assert!(!a_side.is_closed());

    a_side
        .send_cmd(&ToCltCmd::system_chat("still here"))
        .await
        .unwrap();
    let text = next(&client, |cmd| match cmd {
        ToCltCmd::ChatMsg(chat) => Some(chat.text.0),
        _ => None,
    })
    .await;
    assert_eq!(text, "still here");

    assert_eq!(
        *events.lock().unwrap(),
        [RedirectComplete {
            client: "sam".into(),
            target: "c".into(),
            success: false,
        }]
    );
}

#[tokio::test]
async fn refused_redirects_are_reported_without_side_effects() {
    let a = spawn_backend(lobby()).await;
    let (hooks, events) = recording_hooks();
    let (proxy, addr) = start_proxy(&[("a", a.addr)], hooks).await;

    let _client = join(addr, "sam").await;
    let a_side = within(a.players.recv_async()).await.unwrap();

    assert!(matches!(
        proxy.redirect("sam", "nowhere").await,
        Err(RedirectError::UnknownBackend(_))
    ));
    assert!(matches!(
        proxy.redirect("sam", "a").await,
        Err(RedirectError::AlreadyConnected(_))
    ));
    assert!(matches!(
        proxy.redirect("alex", "a").await,
        Err(RedirectError::NoSuchClient(_))
    ));
    let refused = |target: &str| RedirectComplete {
        client: "sam".into(),
        target: target.into(),
        success: false,
    };
    // An unknown client has no session to report on.
    assert_eq!(*events.lock().unwrap(), [refused("nowhere"), refused("a")]);
    assert!(!a_side.is_closed());
    assert_eq!(proxy.current_backend("sam").as_deref(), Some("a"));
}

#[tokio::test]
async fn chat_commands_are_answered_by_the_proxy() {
    let a = spawn_backend(lobby()).await;
    let (proxy, addr) = start_proxy(&[("a", a.addr)], Hooks::with_builtins()).await;

    let client = join(addr, "sam").await;
    let a_side = within(a.players.recv_async()).await.unwrap();

    client
        .send_cmd(&ToSrvCmd::ChatMsg(mt_multiproxy::protocol::packet::to_srv::ChatMsg {
            text: ">server".into(),
        }))
        .await
        .unwrap();
    let reply = next(&client, |cmd| match cmd {
        ToCltCmd::ChatMsg(chat) => Some(chat.text.0),
        _ => None,
    })
    .await;
    assert_eq!(reply, "Current server: a. Servers: a");

    client
        .send_cmd(&ToSrvCmd::ChatMsg(mt_multiproxy::protocol::packet::to_srv::ChatMsg {
            text: "hello".into(),
        }))
        .await
        .unwrap();
    let forwarded = within(async {
        loop {
            if let ToSrvCmd::ChatMsg(chat) = a_side.recv_cmd().await.unwrap() {
                break chat.text.0;
            }
        }
    })
    .await;
    assert_eq!(forwarded, "hello");
    assert_eq!(proxy.clients(), ["sam"]);
}

/// Reads backend messages until `f` picks one.
async fn next_srv<T>(peer: &Peer, mut f: impl FnMut(ToSrvCmd) -> Option<T>) -> T {
    within(async {
        loop {
            let cmd = peer.recv_cmd::<ToSrvCmd>().await.unwrap();
            if let Some(found) = f(cmd) {
                return found;
            }
        }
    })
    .await
}

#[tokio::test]
async fn mod_channels_are_rejoined_on_the_new_backend() {
    let a = spawn_backend(lobby()).await;
    let b = spawn_backend(survival()).await;
    let (proxy, addr) =
        start_proxy(&[("a", a.addr), ("b", b.addr)], Hooks::with_builtins()).await;

    let client = join(addr, "sam").await;
    let a_side = within(a.players.recv_async()).await.unwrap();

    for channel in ["news", "trade"] {
        client
            .send_cmd(&ToSrvCmd::JoinModChan(JoinModChan {
                channel: channel.into(),
            }))
            .await
            .unwrap();
    }
    client
        .send_cmd(&ToSrvCmd::LeaveModChan(LeaveModChan {
            channel: "trade".into(),
        }))
        .await
        .unwrap();
    // The leave reached a, so the proxy has seen all three.
    next_srv(&a_side, |cmd| match cmd {
        ToSrvCmd::LeaveModChan(leave) => Some(leave.channel),
        _ => None,
    })
    .await;

    within(proxy.redirect("sam", "b")).await.unwrap();
    let b_side = within(b.players.recv_async()).await.unwrap();
    let rejoined = next_srv(&b_side, |cmd| match cmd {
        ToSrvCmd::JoinModChan(join) => Some(join.channel),
        _ => None,
    })
    .await;
    assert_eq!(rejoined, "news");
}

#[tokio::test]
async fn kicked_clients_fall_back_to_another_backend() {
    let a = spawn_backend(lobby()).await;
    let b = spawn_backend(survival()).await;
    let (hooks, events) = recording_hooks();
    let (proxy, addr) = start_proxy_with(
        &[("a", a.addr), ("b", b.addr)],
        hooks,
        r#"fallback_servers = ["a", "b"]"#,
    )
    .await;

    let client = join(addr, "sam").await;
    let a_side = within(a.players.recv_async()).await.unwrap();

    kick(&a_side, Kick::custom("restarting")).await;

    let text = next(&client, |cmd| match cmd {
        ToCltCmd::ChatMsg(chat) => Some(chat.text.0),
        ToCltCmd::Kick(kick) => panic!("client was kicked: {}", kick.describe()),
        _ => None,
    })
    .await;
    assert_eq!(text, "Lost connection to a, moved to b.");
    within(b.players.recv_async()).await.unwrap();
    assert_eq!(proxy.current_backend("sam").as_deref(), Some("b"));
    assert_eq!(
        *events.lock().unwrap(),
        [RedirectComplete {
            client: "sam".into(),
            target: "b".into(),
            success: true,
        }]
    );
}

#[tokio::test]
async fn lost_backend_without_fallback_kicks_the_client() {
    let a = spawn_backend(lobby()).await;
    let (proxy, addr) = start_proxy(&[("a", a.addr)], Hooks::with_builtins()).await;

    let client = join(addr, "sam").await;
    let a_side = within(a.players.recv_async()).await.unwrap();

    a_side.disconnect().await;

    let kicked = next(&client, |cmd| match cmd {
        ToCltCmd::Kick(kick) => Some(kick),
        _ => None,
    })
    .await;
    assert_eq!(kicked.describe(), "Lost connection to server a.");
    within(async {
        while !proxy.clients().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
}

/// Runs the sudo handshake for sam with `password` and returns whether the
/// proxy accepted it.
async fn enter_sudo(client: &Peer, password: &str) -> bool {
    let handshake = srp::ClientHandshake::new("sam", password);
    client
        .send_cmd(&ToSrvCmd::SrpBytesA(SrpBytesA {
            a_pub: handshake.a_pub(),
            based_on: 1,
        }))
        .await
        .unwrap();
    let challenge = next(client, |cmd| match cmd {
        ToCltCmd::SrpBytesSaltB(challenge) => Some(challenge),
        _ => None,
    })
    .await;
    let m = handshake.respond(&challenge.salt, &challenge.b_pub).unwrap();
    client
        .send_cmd(&ToSrvCmd::SrpBytesM(SrpBytesM { m }))
        .await
        .unwrap();
    next(client, |cmd| match cmd {
        ToCltCmd::AcceptSudoMode(_) => Some(true),
        ToCltCmd::DenySudoMode(_) => Some(false),
        _ => None,
    })
    .await
}

#[tokio::test]
async fn passwords_change_only_in_sudo_mode() {
    let a = spawn_backend(lobby()).await;
    let (proxy, addr) = start_proxy(&[("a", a.addr)], Hooks::with_builtins()).await;

    let client = join(addr, "sam").await;
    within(a.players.recv_async()).await.unwrap();
    let enrolled = proxy.store().read_credential("sam").unwrap().unwrap();

    assert!(!enter_sudo(&client, "wrong").await);

    assert!(enter_sudo(&client, "pw").await);
    let (salt, verifier) = srp::create_verifier("sam", "secret");
    client
        .send_cmd(&ToSrvCmd::FirstSrp(FirstSrp {
            salt: salt.clone(),
            verifier: verifier.clone(),
            empty_passwd: false,
        }))
        .await
        .unwrap();
    let reply = next(&client, |cmd| match cmd {
        ToCltCmd::ChatMsg(chat) => Some(chat.text.0),
        _ => None,
    })
    .await;
    assert_eq!(reply, "Password changed.");
    let changed = Credential { salt, verifier };
    assert_ne!(changed, enrolled);
    assert_eq!(proxy.store().read_credential("sam").unwrap(), Some(changed));

    // Sudo mode ended with the change; the new password opens it again.
    assert!(enter_sudo(&client, "secret").await);
}
