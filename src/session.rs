//! A connected player and the backend it is currently attached to.
//!
//! Two tasks forward traffic: [`Session::run_client`] carries client
//! messages to whichever backend is current, and one
//! [`Session::run_backend`] task per backend link rewrites backend messages
//! for the client. Only the current link has its forwarding flag set.

use crate::{
    active_object::AoTracker,
    auth::{
        server::{self, ClientLogin},
        srp,
    },
    content::block::add_hand_list,
    protocol::{
        decode_message,
        packet::{
            to_clt::{AcceptSudoMode, DenySudoMode, DetachedInv, Inv, Kick, SrpBytesSaltB},
            to_srv::{CltReady, FirstSrp, JoinModChan, SrpBytesA, SrpBytesM},
            AuthMechs, KickReason, ToCltCmd, ToSrvCmd,
        },
        Encode,
    },
    credentials::Credential,
    proxy::Proxy,
    redirect,
    transport::{Peer, PeerError, Pkt},
};
use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use std::{
    collections::BTreeSet,
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::Mutex as AsyncMutex;

/// Malformed messages tolerated from one connection before it is dropped.
pub const MALFORMED_LIMIT: u32 = 8;

/// A logged-in connection to one backend on behalf of a client.
#[derive(Debug)]
pub struct BackendLink {
    name: String,
    peer: Peer,
    forwarding: AtomicBool,
    malformed: AtomicU32,
}

impl BackendLink {
    pub fn new(name: String, peer: Peer) -> Arc<Self> {
        Arc::new(Self {
            name,
            peer,
            forwarding: AtomicBool::new(true),
            malformed: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    fn is_forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Acquire)
    }

    fn stop_forwarding(&self) {
        self.forwarding.store(false, Ordering::Release);
    }
}

/// What the client sent while joining; replayed to every backend.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub lang: String,
    pub clt_ready: CltReady,
}

#[derive(Default)]
enum Sudo {
    #[default]
    Idle,
    Challenged(srp::ServerHandshake),
    Active,
}

#[derive(Default)]
struct State {
    backend: Option<Arc<BackendLink>>,
    join: Option<JoinInfo>,
    objects: AoTracker,
    mod_channels: BTreeSet<String>,
    /// Detached inventories the current backend created on the client.
    detached_invs: BTreeSet<String>,
    sudo: Sudo,
    malformed: u32,
}

enum Relay {
    Continue,
    Kicked(Kick),
}

pub struct Session {
    name: String,
    ser_ver: u8,
    proto_ver: u16,
    client: Peer,
    state: Mutex<State>,
    /// Held for a whole redirect; one redirect at a time per client.
    redirect_lock: AsyncMutex<()>,
    /// Held while a backend message is rewritten and sent to the client.
    relay_lock: AsyncMutex<()>,
}

impl Session {
    pub fn new(login: ClientLogin, client: Peer) -> Self {
        Self {
            name: login.name,
            ser_ver: login.ser_ver,
            proto_ver: login.proto_ver,
            client,
            state: Mutex::new(State::default()),
            redirect_lock: AsyncMutex::new(()),
            relay_lock: AsyncMutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ser_ver(&self) -> u8 {
        self.ser_ver
    }

    pub fn proto_ver(&self) -> u16 {
        self.proto_ver
    }

    pub fn client(&self) -> &Peer {
        &self.client
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn backend(&self) -> Option<Arc<BackendLink>> {
        self.state().backend.clone()
    }

    pub fn backend_name(&self) -> Option<String> {
        self.state().backend.as_ref().map(|b| b.name.clone())
    }

    pub(crate) fn redirect_lock(&self) -> &AsyncMutex<()> {
        &self.redirect_lock
    }

    pub(crate) fn set_join_info(&self, join: JoinInfo) {
        self.state().join = Some(join);
    }

    pub(crate) fn join_info(&self) -> Option<JoinInfo> {
        self.state().join.clone()
    }

    pub fn mod_channels(&self) -> Vec<String> {
        self.state().mod_channels.iter().cloned().collect()
    }

    /// Makes `link` the current backend and starts forwarding from it.
    ///
    /// The client first loses every object and detached inventory of the
    /// previous backend. `buffered` messages from the new backend's join go
    /// through the usual rewriting before anything else it sends. The
    /// previous link, if any, is disconnected.
    pub(crate) async fn attach(
        self: &Arc<Self>,
        proxy: &Proxy,
        link: Arc<BackendLink>,
        buffered: Vec<Pkt>,
    ) {
        let relay = self.relay_lock.lock().await;
        let (previous, removal, stale_invs) = {
            let mut state = self.state();
            let previous = state.backend.replace(Arc::clone(&link));
            if let Some(previous) = &previous {
                previous.stop_forwarding();
            }
            (
                previous,
                state.objects.take_removal(),
                mem::take(&mut state.detached_invs),
            )
        };

        if let Some(removal) = removal {
            tracing::debug!(client = %self.name, count = removal.remove.len(), "removing objects of the previous backend");
            self.send_client(removal).await;
        }
        for name in stale_invs {
            self.send_client(DetachedInv {
                name,
                keep: false,
                inv: Bytes::new(),
            })
            .await;
        }
        for pkt in buffered {
            if let Relay::Kicked(kick) = self.relay(proxy, &link, pkt).await {
                tracing::warn!(client = %self.name, backend = %link.name, "kicked while joining: {}", kick.describe());
            }
        }
        drop(relay);

        if let Some(previous) = previous {
            previous.peer.disconnect().await;
            tracing::info!(client = %self.name, backend = %previous.name, "left backend");
        }
        tokio::spawn(Arc::clone(self).run_backend(proxy.clone(), Arc::clone(&link)));

        for channel in self.mod_channels() {
            if let Err(e) = link
                .peer
                .send_cmd(&ToSrvCmd::JoinModChan(JoinModChan { channel }))
                .await
            {
                tracing::debug!(client = %self.name, backend = %link.name, "replaying mod channel join failed: {e}");
            }
        }
        tracing::info!(client = %self.name, backend = %link.name, "attached to backend");
    }

    /// Disconnects the current backend without a fallback.
    pub(crate) async fn shutdown(&self) {
        let backend = self.state().backend.take();
        if let Some(backend) = backend {
            backend.stop_forwarding();
            backend.peer.disconnect().await;
        }
        self.client.disconnect().await;
    }

    async fn send_client(&self, cmd: impl Into<ToCltCmd>) {
        let cmd = cmd.into();
        if let Err(e) = self.client.send_cmd(&cmd).await {
            tracing::debug!(client = %self.name, cmd = cmd.as_ref(), "sending to client failed: {e}");
        }
    }

    /// Forwards backend messages to the client until the link is replaced
    /// or lost.
    async fn run_backend(self: Arc<Self>, proxy: Proxy, link: Arc<BackendLink>) {
        let kick = loop {
            let result = tokio::select! {
                result = link.peer.recv() => result,
                _ = self.client.closed() => return,
            };
            match result {
                Ok(pkt) => {
                    let _relay = self.relay_lock.lock().await;
                    if !link.is_forwarding() {
                        return;
                    }
                    if let Relay::Kicked(kick) = self.relay(&proxy, &link, pkt).await {
                        break Some(kick);
                    }
                }
                Err(e) => {
                    tracing::info!(client = %self.name, backend = %link.name, "backend connection lost: {e}");
                    break None;
                }
            }
        };

        if link.is_forwarding() && !self.client.is_closed() {
            tokio::spawn(self.fallback(proxy, link, kick));
        }
    }

    /// Moves the client to the first fallback server that accepts it, or
    /// kicks it.
    fn fallback(
        self: Arc<Self>,
        proxy: Proxy,
        lost: Arc<BackendLink>,
        kick: Option<Kick>,
    ) -> BoxFuture<'static, ()> {
        async move {
            lost.peer.close();
            for target in &proxy.config().fallback_servers {
                if *target == lost.name {
                    continue;
                }
                if !self.backend().is_some_and(|b| Arc::ptr_eq(&b, &lost)) {
                    return;
                }
                match redirect::redirect(&proxy, &self, target).await {
                    Ok(()) => {
                        self.send_client(ToCltCmd::system_chat(format!(
                            "Lost connection to {}, moved to {target}.",
                            lost.name
                        )))
                        .await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(client = %self.name, backend = %target, "fallback failed: {e}");
                    }
                }
            }

            let text = match kick {
                Some(kick) => kick.describe(),
                None => format!("Lost connection to server {}.", lost.name),
            };
            tracing::warn!(client = %self.name, backend = %lost.name, "no fallback server available");
            server::kick(&self.client, Kick::custom(text)).await;
        }
        .boxed()
    }

    fn count_malformed(&self, link: &BackendLink, what: &dyn std::fmt::Display) {
        let count = link.malformed.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(client = %self.name, backend = %link.name, count, "dropping malformed backend message: {what}");
        if count >= MALFORMED_LIMIT {
            tracing::warn!(client = %self.name, backend = %link.name, "too many malformed messages, closing backend connection");
            link.peer.close();
        }
    }

    /// Rewrites one backend message and sends it to the client.
    async fn relay(&self, proxy: &Proxy, link: &BackendLink, pkt: Pkt) -> Relay {
        let cmd = match decode_message::<ToCltCmd>(&pkt.data) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.count_malformed(link, &e);
                return Relay::Continue;
            }
        };
        let registry = proxy.registry();

        let data: Bytes = match cmd {
            ToCltCmd::BlkData(mut blk) => {
                match registry.rewrite_block(&link.name, self.ser_ver, &blk.data) {
                    Ok(data) => {
                        blk.data = data;
                        ToCltCmd::BlkData(blk).encode_to_vec().into()
                    }
                    Err(e) => {
                        self.count_malformed(link, &e);
                        return Relay::Continue;
                    }
                }
            }
            ToCltCmd::AddNode(mut add) => match registry.rewrite_add_node(&link.name, &mut add) {
                Ok(()) => ToCltCmd::AddNode(add).encode_to_vec().into(),
                Err(e) => {
                    self.count_malformed(link, &e);
                    return Relay::Continue;
                }
            },
            ToCltCmd::AoRmAdd(mut msg) => {
                let observed = self.state().objects.observe_rm_add(&self.name, &mut msg);
                if let Err(e) = observed {
                    self.count_malformed(link, &e);
                    return Relay::Continue;
                }
                if msg.add.is_empty() && msg.remove.is_empty() {
                    return Relay::Continue;
                }
                ToCltCmd::AoRmAdd(msg).encode_to_vec().into()
            }
            ToCltCmd::AoMsgs(mut msgs) => {
                self.state().objects.observe_msgs(&mut msgs);
                ToCltCmd::AoMsgs(msgs).encode_to_vec().into()
            }
            ToCltCmd::Inv(inv) => {
                match registry
                    .hand_item(&link.name)
                    .and_then(|hand| add_hand_list(&inv.inv, hand))
                {
                    Some(inv) => ToCltCmd::Inv(Inv { inv }).encode_to_vec().into(),
                    None => pkt.data,
                }
            }
            ToCltCmd::DetachedInv(inv) => {
                let mut state = self.state();
                if inv.keep {
                    state.detached_invs.insert(inv.name);
                } else {
                    state.detached_invs.remove(&inv.name);
                }
                drop(state);
                pkt.data
            }
            ToCltCmd::Kick(kick) => return Relay::Kicked(kick),
            cmd @ (ToCltCmd::NodeDefs(_)
            | ToCltCmd::ItemDefs(_)
            | ToCltCmd::AnnounceMedia(_)
            | ToCltCmd::Media(_)
            | ToCltCmd::Hello(_)
            | ToCltCmd::AcceptAuth(_)
            | ToCltCmd::SrpBytesSaltB(_)
            | ToCltCmd::AcceptSudoMode(_)
            | ToCltCmd::DenySudoMode(_)) => {
                tracing::debug!(client = %self.name, backend = %link.name, cmd = cmd.as_ref(), "dropping backend message");
                return Relay::Continue;
            }
            _ => pkt.data,
        };

        let pkt = Pkt {
            data,
            channel: pkt.channel,
            unreliable: pkt.unreliable,
        };
        if let Err(e) = self.client.send(pkt).await {
            tracing::debug!(client = %self.name, "forwarding to client failed: {e}");
        }
        Relay::Continue
    }

    /// Forwards client messages until the client disconnects.
    pub(crate) async fn run_client(self: Arc<Self>, proxy: Proxy) {
        loop {
            let pkt = match self.client.recv().await {
                Ok(pkt) => pkt,
                Err(PeerError::Closed) => break,
                Err(e) => {
                    tracing::info!(client = %self.name, "client connection lost: {e}");
                    break;
                }
            };
            let cmd = match decode_message::<ToSrvCmd>(&pkt.data) {
                Ok(cmd) => cmd,
                Err(e) => {
                    let count = {
                        let mut state = self.state();
                        state.malformed += 1;
                        state.malformed
                    };
                    tracing::warn!(client = %self.name, count, "dropping malformed client message: {e}");
                    if count >= MALFORMED_LIMIT {
                        server::kick(&self.client, Kick::new(KickReason::UnexpectedData)).await;
                        break;
                    }
                    continue;
                }
            };

            match cmd {
                ToSrvCmd::Init(_) | ToSrvCmd::Init2(_) | ToSrvCmd::CltReady(_) | ToSrvCmd::ReqMedia(_) => {
                    tracing::debug!(client = %self.name, cmd = cmd.as_ref(), "dropping repeated join message");
                }
                ToSrvCmd::ChatMsg(chat) => {
                    if !self.handle_chat(&proxy, &chat.text.0).await {
                        self.forward(pkt).await;
                    }
                }
                ToSrvCmd::JoinModChan(join) => {
                    self.state().mod_channels.insert(join.channel);
                    self.forward(pkt).await;
                }
                ToSrvCmd::LeaveModChan(leave) => {
                    self.state().mod_channels.remove(&leave.channel);
                    self.forward(pkt).await;
                }
                ToSrvCmd::SrpBytesA(a) => self.sudo_challenge(&proxy, a).await,
                ToSrvCmd::SrpBytesM(m) => self.sudo_proof(m).await,
                ToSrvCmd::FirstSrp(first) => self.change_password(&proxy, first).await,
                _ => self.forward(pkt).await,
            }
        }
    }

    async fn forward(&self, pkt: Pkt) {
        let Some(backend) = self.backend() else {
            return;
        };
        if !backend.is_forwarding() {
            return;
        }
        if let Err(e) = backend.peer.send(pkt).await {
            tracing::debug!(client = %self.name, backend = %backend.name, "forwarding to backend failed: {e}");
        }
    }

    /// Returns whether the message was handled by the proxy.
    async fn handle_chat(&self, proxy: &Proxy, text: &str) -> bool {
        if let Some(line) = text.strip_prefix(proxy.config().command_prefix.as_str()) {
            return match proxy.hooks().dispatch_command(proxy, &self.name, line).await {
                Some(reply) => {
                    if let Some(reply) = reply {
                        self.send_client(ToCltCmd::system_chat(reply)).await;
                    }
                    true
                }
                None => false,
            };
        }
        proxy.hooks().chat_message(&self.name, text)
    }

    async fn sudo_challenge(&self, proxy: &Proxy, a: SrpBytesA) {
        let credential = match proxy.store().read_credential(&self.name) {
            Ok(Some(credential)) if a.based_on == 1 => credential,
            Ok(_) => return self.deny_sudo().await,
            Err(e) => {
                tracing::error!(client = %self.name, "reading credential failed: {e}");
                return self.deny_sudo().await;
            }
        };
        let handshake = match srp::ServerHandshake::new(
            &self.name,
            &credential.salt,
            &credential.verifier,
            &a.a_pub,
        ) {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!(client = %self.name, "bad sudo parameters: {e}");
                return self.deny_sudo().await;
            }
        };
        let b_pub = handshake.b_pub();
        self.state().sudo = Sudo::Challenged(handshake);
        self.send_client(SrpBytesSaltB {
            salt: credential.salt,
            b_pub,
        })
        .await;
    }

    async fn sudo_proof(&self, m: SrpBytesM) {
        let accepted = {
            let mut state = self.state();
            match mem::take(&mut state.sudo) {
                Sudo::Challenged(handshake) if handshake.verify(&m.m).is_ok() => {
                    state.sudo = Sudo::Active;
                    true
                }
                _ => false,
            }
        };
        if !accepted {
            tracing::warn!(client = %self.name, "sudo proof rejected");
            return self.deny_sudo().await;
        }
        tracing::info!(client = %self.name, "entered sudo mode");
        self.send_client(AcceptSudoMode {
            sudo_auth_mechs: AuthMechs::FIRST_SRP,
            rest: Bytes::new(),
        })
        .await;
    }

    async fn deny_sudo(&self) {
        self.send_client(DenySudoMode).await;
    }

    async fn change_password(&self, proxy: &Proxy, first: FirstSrp) {
        let active = matches!(mem::take(&mut self.state().sudo), Sudo::Active);
        if !active {
            tracing::warn!(client = %self.name, "password change outside sudo mode");
            return;
        }
        let credential = Credential {
            salt: first.salt,
            verifier: first.verifier,
        };
        let reply = match proxy.store().write_credential(&self.name, credential) {
            Ok(()) => {
                tracing::info!(client = %self.name, "password changed");
                "Password changed."
            }
            Err(e) => {
                tracing::error!(client = %self.name, "storing credential failed: {e}");
                "Password change failed."
            }
        };
        self.send_client(ToCltCmd::system_chat(reply)).await;
    }
}
