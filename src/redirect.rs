//! Moving a live session from one backend to another.

use crate::{
    auth::{
        client::{login, Login},
        AuthError,
    },
    config::ServerConfig,
    hooks::RedirectComplete,
    protocol::{
        decode_message,
        packet::{to_srv::Init2, ToCltCmd, ToSrvCmd},
    },
    proxy::Proxy,
    session::{BackendLink, JoinInfo, Session},
    transport::{Peer, PeerError, Pkt},
};
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    #[error("no backend named {0}")]
    UnknownBackend(String),
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("no client named {0}")]
    NoSuchClient(String),
    #[error("client has not finished joining")]
    NotJoined,
    #[error("connecting to backend failed: {0}")]
    Connect(#[source] PeerError),
    #[error("backend handshake failed: {0}")]
    Handshake(#[from] AuthError),
    #[error("backend handshake timed out")]
    TimedOut,
}

/// Logs in to a backend as the session's player and runs its join up to
/// the media announcement.
///
/// Returns the link together with the messages the backend sent meanwhile
/// that the client still needs.
pub(crate) async fn connect_backend(
    session: &Session,
    server: &ServerConfig,
    join: &JoinInfo,
    limit: Duration,
) -> Result<(Arc<BackendLink>, Vec<Pkt>), RedirectError> {
    let peer = Peer::connect(server.addr)
        .await
        .map_err(RedirectError::Connect)?;
    let result = match timeout(limit, handshake(&peer, session, join)).await {
        Ok(result) => result,
        Err(_) => Err(RedirectError::TimedOut),
    };
    match result {
        Ok(buffered) => {
            tracing::debug!(client = %session.name(), backend = %server.name, buffered = buffered.len(), "backend handshake done");
            Ok((BackendLink::new(server.name.clone(), peer), buffered))
        }
        Err(e) => {
            peer.disconnect().await;
            Err(e)
        }
    }
}

async fn handshake(
    peer: &Peer,
    session: &Session,
    join: &JoinInfo,
) -> Result<Vec<Pkt>, RedirectError> {
    login(
        peer,
        &Login::exact(session.name(), "", session.ser_ver(), session.proto_ver()),
    )
    .await?;
    let _ = peer
        .send_cmd(&ToSrvCmd::Init2(Init2 {
            lang: join.lang.clone(),
        }))
        .await
        .map_err(AuthError::from)?;

    let mut buffered = Vec::new();
    loop {
        let pkt = peer.recv().await.map_err(AuthError::from)?;
        match decode_message::<ToCltCmd>(&pkt.data) {
            Ok(ToCltCmd::AnnounceMedia(_)) => break,
            Ok(ToCltCmd::ItemDefs(_) | ToCltCmd::NodeDefs(_) | ToCltCmd::Media(_)) => {}
            Ok(ToCltCmd::Kick(kick)) => return Err(AuthError::Denied(kick.describe()).into()),
            Ok(_) => buffered.push(pkt),
            Err(e) => {
                tracing::warn!(client = %session.name(), "dropping malformed backend message during join: {e}");
            }
        }
    }

    let _ = peer
        .send_cmd(&ToSrvCmd::CltReady(join.clt_ready.clone()))
        .await
        .map_err(AuthError::from)?;
    Ok(buffered)
}

/// Redirects `session` to `target`.
///
/// On any failure the session stays on its current backend. Every attempt,
/// including one refused by its preconditions, is reported to redirect
/// hooks exactly once.
pub(crate) async fn redirect(
    proxy: &Proxy,
    session: &Arc<Session>,
    target: &str,
) -> Result<(), RedirectError> {
    let _guard = session.redirect_lock().lock().await;

    let result = attempt(proxy, session, target).await;
    match &result {
        Ok(()) => tracing::info!(client = %session.name(), backend = %target, "redirect complete"),
        Err(e) => tracing::warn!(client = %session.name(), backend = %target, "redirect failed: {e}"),
    }
    proxy.hooks().redirect_complete(&RedirectComplete {
        client: session.name().to_owned(),
        target: target.to_owned(),
        success: result.is_ok(),
    });
    result
}

async fn attempt(proxy: &Proxy, session: &Arc<Session>, target: &str) -> Result<(), RedirectError> {
    let server = proxy
        .config()
        .server(target)
        .ok_or_else(|| RedirectError::UnknownBackend(target.to_owned()))?;
    let current = session.backend_name();
    if current.as_deref() == Some(target) {
        return Err(RedirectError::AlreadyConnected(target.to_owned()));
    }
    let join = session.join_info().ok_or(RedirectError::NotJoined)?;

    tracing::info!(client = %session.name(), from = ?current, to = %target, "redirecting");
    let (link, buffered) =
        connect_backend(session, server, &join, proxy.config().handshake_timeout()).await?;
    session.attach(proxy, link, buffered).await;
    Ok(())
}
