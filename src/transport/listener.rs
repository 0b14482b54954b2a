use super::{
    is_transient,
    peer::Role,
    wire::{Header, PROTOCOL_ID},
    Peer, PeerError, PEER_ID_FIRST_CLT, PEER_ID_NIL,
};
use crate::protocol::decode_message;
use ahash::AHashMap;
use bytes::Bytes;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Demultiplexes one UDP socket into a [`Peer`] per remote address.
pub struct Listener {
    local_addr: SocketAddr,
    incoming: flume::Receiver<Peer>,
    cancel: CancellationToken,
}

struct Connected {
    peer: Peer,
    raw: flume::Sender<Bytes>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (incoming_tx, incoming) = flume::unbounded();
        let cancel = CancellationToken::new();

        tokio::spawn(run_demux(socket, incoming_tx, cancel.clone()));
        tracing::info!(%local_addr, "listening");

        Ok(Self {
            local_addr,
            incoming,
            cancel,
        })
    }

    /// Waits for the next dialing peer.
    pub async fn accept(&self) -> Result<Peer, PeerError> {
        tokio::select! {
            peer = self.incoming.recv_async() => peer.map_err(|_| PeerError::Closed),
            _ = self.cancel.cancelled() => Err(PeerError::Closed),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes every peer of this listener.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_demux(
    socket: Arc<UdpSocket>,
    incoming: flume::Sender<Peer>,
    cancel: CancellationToken,
) {
    let mut peers: AHashMap<SocketAddr, Connected> = AHashMap::new();
    let mut next_id = PEER_ID_FIRST_CLT;
    let mut buf = vec![0; 0x10000];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, addr) = match received {
            Ok(received) => received,
            Err(e) if is_transient(&e) => continue,
            // ICMP errors from earlier sends show up here on some platforms.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                tracing::error!("listener socket failed: {e}");
                break;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        if peers.get(&addr).is_some_and(|c| c.peer.is_closed()) {
            peers.remove(&addr);
        }

        if let Some(connected) = peers.get(&addr) {
            if let Err(flume::TrySendError::Full(_)) = connected.raw.try_send(datagram) {
                tracing::debug!(%addr, "peer queue full, dropping datagram");
            }
            continue;
        }

        match decode_message::<Header>(&datagram) {
            Ok(header) if header.protocol_id == PROTOCOL_ID && header.sender == PEER_ID_NIL => {}
            _ => {
                tracing::debug!(%addr, "ignoring datagram from unknown address");
                continue;
            }
        }

        peers.retain(|_, c| !c.peer.is_closed());
        let Some(id) = allocate_id(&peers, &mut next_id) else {
            tracing::warn!(%addr, "no free peer ids");
            continue;
        };

        let (peer, raw) = Peer::new(Arc::clone(&socket), addr, Role::Server, id);
        tracing::debug!(%addr, id, "new peer");
        raw.try_send(datagram).ok();

        let announcer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = announcer.announce_id().await {
                tracing::debug!(peer = %announcer.addr(), "failed to assign peer id: {e}");
            }
        });

        if incoming.send(peer.clone()).is_err() {
            peer.close();
            break;
        }
        peers.insert(addr, Connected { peer, raw });
    }

    for connected in peers.into_values() {
        connected.peer.close();
    }
}

fn allocate_id(peers: &AHashMap<SocketAddr, Connected>, next_id: &mut u16) -> Option<u16> {
    let in_use = |id: u16| peers.values().any(|c| c.peer.id() == id);
    for _ in PEER_ID_FIRST_CLT..=u16::MAX {
        let id = *next_id;
        *next_id = if id == u16::MAX {
            PEER_ID_FIRST_CLT
        } else {
            id + 1
        };
        if !in_use(id) {
            return Some(id);
        }
    }
    None
}
