//! Startup download of a backend's definitions and media.

use super::BackendDump;
use crate::{
    auth::client::{login, Login},
    protocol::{
        packet::{
            to_srv::{Init2, ReqMedia},
            ToCltCmd, ToSrvCmd,
        },
    },
    transport::Peer,
};
use anyhow::{bail, Context};
use std::{collections::BTreeSet, net::SocketAddr, time::Duration};
use tokio::time::timeout;

/// Logs in to `addr` as `user` and collects everything a joining client
/// would be sent before it reports ready.
pub async fn fetch(
    backend: &str,
    addr: SocketAddr,
    user: &str,
    limit: Duration,
) -> anyhow::Result<BackendDump> {
    let peer = Peer::connect(addr)
        .await
        .with_context(|| format!("connecting to backend {backend} at {addr}"))?;
    let result = timeout(limit, fetch_from(&peer, backend, user))
        .await
        .with_context(|| format!("fetching definitions from {backend} timed out"))
        .and_then(|r| r);
    peer.disconnect().await;
    result
}

async fn fetch_from(peer: &Peer, backend: &str, user: &str) -> anyhow::Result<BackendDump> {
    login(peer, &Login::supported(user, ""))
        .await
        .with_context(|| format!("logging in to backend {backend}"))?;
    let _ = peer
        .send_cmd(&ToSrvCmd::Init2(Init2 {
            lang: String::new(),
        }))
        .await?;

    let mut dump = BackendDump {
        backend: backend.to_owned(),
        ..Default::default()
    };
    let (mut have_items, mut have_nodes, mut have_announcement) = (false, false, false);
    let mut missing = BTreeSet::new();

    loop {
        match peer.recv_cmd::<ToCltCmd>().await? {
            ToCltCmd::ItemDefs(defs) => {
                dump.item_defs = defs.defs;
                have_items = true;
            }
            ToCltCmd::NodeDefs(defs) => {
                dump.node_defs = defs.defs;
                have_nodes = true;
            }
            ToCltCmd::AnnounceMedia(announce) => {
                missing = announce.files.iter().map(|f| f.name.clone()).collect();
                if !missing.is_empty() {
                    let _ = peer
                        .send_cmd(&ToSrvCmd::ReqMedia(ReqMedia {
                            filenames: missing.iter().cloned().collect(),
                        }))
                        .await?;
                }
                dump.announcements = announce.files;
                have_announcement = true;
            }
            ToCltCmd::Media(media) => {
                tracing::debug!(
                    backend,
                    bunch = media.bunch_index,
                    of = media.bunch_count,
                    "received media bunch"
                );
                for file in media.files {
                    missing.remove(&file.name);
                    dump.media.push(file);
                }
                if media.bunch_index.saturating_add(1) >= media.bunch_count && !missing.is_empty() {
                    tracing::warn!(backend, missing = missing.len(), "backend did not send every announced file");
                    missing.clear();
                }
            }
            ToCltCmd::Kick(kick) => bail!("backend {backend} kicked the fetch user: {}", kick.describe()),
            cmd => tracing::debug!(backend, cmd = cmd.as_ref(), "ignoring command during fetch"),
        }

        if have_items && have_nodes && have_announcement && missing.is_empty() {
            break;
        }
    }

    tracing::info!(
        backend,
        media = dump.media.len(),
        "fetched backend definitions"
    );
    Ok(dump)
}
