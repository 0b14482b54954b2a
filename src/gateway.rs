//! Accepts clients and walks them through the join sequence.
//!
//! A client authenticates against the proxy itself, receives the merged
//! definitions and media, and only then is attached to a backend.

use crate::{
    auth::server::{accept_login, deny, kick, ServerOptions},
    protocol::packet::{
        to_clt::{AnnounceMedia, ItemDefs, Kick, NodeDefs},
        ToCltCmd, ToSrvCmd,
    },
    proxy::Proxy,
    redirect::connect_backend,
    session::{JoinInfo, Session},
    transport::{Listener, Peer},
};
use anyhow::{bail, Context};
use std::sync::Arc;
use tokio::time::timeout;

/// Serves clients on `listener` until it closes.
pub async fn run(proxy: Proxy, listener: Listener) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr(), "accepting clients");
    loop {
        let peer = listener.accept().await.context("listener closed")?;
        tracing::info!(peer = %peer.addr(), "accepted connection");
        let proxy = proxy.clone();
        tokio::spawn(async move {
            if let Err(e) = drive_connection(&proxy, &peer).await {
                tracing::info!(peer = %peer.addr(), "connection ended: {e:#}");
            }
            peer.disconnect().await;
        });
    }
}

async fn drive_connection(proxy: &Proxy, peer: &Peer) -> anyhow::Result<()> {
    let options = ServerOptions {
        require_password: proxy.config().require_password,
    };
    let login = timeout(
        proxy.config().handshake_timeout(),
        accept_login(peer, proxy.store().as_ref(), &options),
    )
    .await
    .context("login timed out")??;

    let session = Arc::new(Session::new(login, peer.clone()));
    if let Err(reason) = proxy.claim(&session) {
        tracing::warn!(client = %session.name(), "refusing client: {}", reason.message());
        deny(peer, reason).await;
        bail!("refused {}", session.name());
    }

    let joined = join(proxy, &session).await;
    if joined.is_ok() {
        proxy.hooks().join(session.name());
        Arc::clone(&session).run_client(proxy.clone()).await;
        proxy.hooks().leave(session.name());
        tracing::info!(client = %session.name(), "client left");
    }
    proxy.release(&session);
    session.shutdown().await;
    joined
}

async fn join(proxy: &Proxy, session: &Arc<Session>) -> anyhow::Result<()> {
    let join = timeout(
        proxy.config().handshake_timeout(),
        serve_content(proxy, session.client()),
    )
    .await
    .context("client did not finish joining in time")??;
    session.set_join_info(join.clone());

    let _guard = session.redirect_lock().lock().await;
    let mut candidates: Vec<_> = proxy.config().default_server().into_iter().collect();
    for name in &proxy.config().fallback_servers {
        if let Some(server) = proxy.config().server(name) {
            if !candidates.iter().any(|c| c.name == server.name) {
                candidates.push(server);
            }
        }
    }

    for server in candidates {
        match connect_backend(session, server, &join, proxy.config().handshake_timeout()).await {
            Ok((link, buffered)) => {
                session.attach(proxy, link, buffered).await;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(client = %session.name(), backend = %server.name, "joining backend failed: {e}");
            }
        }
    }

    kick(session.client(), Kick::custom("No server is available.")).await;
    bail!("no backend accepted {}", session.name())
}

/// Sends the merged definitions and media, then waits for the client to
/// report ready.
async fn serve_content(proxy: &Proxy, client: &Peer) -> anyhow::Result<JoinInfo> {
    let lang = loop {
        match client.recv_cmd::<ToSrvCmd>().await? {
            ToSrvCmd::Init2(init2) => break init2.lang,
            cmd => tracing::debug!(peer = %client.addr(), cmd = cmd.as_ref(), "ignoring command before init2"),
        }
    };

    let registry = proxy.registry();
    let _ = client
        .send_cmd(&ToCltCmd::ItemDefs(ItemDefs {
            defs: registry.item_defs().clone(),
        }))
        .await?;
    let _ = client
        .send_cmd(&ToCltCmd::NodeDefs(NodeDefs {
            defs: registry.node_defs().clone(),
        }))
        .await?;
    let _ = client
        .send_cmd(&ToCltCmd::AnnounceMedia(AnnounceMedia {
            files: registry.media().announcements().to_vec(),
            remote_servers: String::new(),
        }))
        .await?;

    loop {
        match client.recv_cmd::<ToSrvCmd>().await? {
            ToSrvCmd::ReqMedia(req) => {
                for bunch in registry.media().bunches(&req.filenames) {
                    let _ = client.send_cmd(&ToCltCmd::Media(bunch)).await?;
                }
            }
            ToSrvCmd::CltReady(clt_ready) => return Ok(JoinInfo { lang, clt_ready }),
            cmd => tracing::debug!(peer = %client.addr(), cmd = cmd.as_ref(), "ignoring command while joining"),
        }
    }
}
