use super::{
    channel::{split_chunks, InboundChannel, OutboundChannel, WINDOW_SIZE},
    is_transient,
    wire::{Control, Datagram, Frame, Header, PROTOCOL_ID},
    Ack, PeerError, Pkt, CHANNEL_COUNT, CONN_TIMEOUT, MAX_MESSAGE_SIZE, MAX_NET_PKT_SIZE,
    PEER_ID_NIL, PEER_ID_SRV, PING_INTERVAL, RESEND_TIMEOUT,
};
use crate::protocol::{decode_message, packet::Command, Encode};
use bytes::Bytes;
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::{
    net::UdpSocket,
    sync::{oneshot, Mutex as AsyncMutex, Semaphore},
    time::{self, sleep_until},
};
use tokio_util::sync::CancellationToken;

/// How often the timer task looks for resends and pings.
const TICK: Duration = Duration::from_millis(100);

/// Attempts for one datagram write before the error counts as fatal.
const SEND_ATTEMPTS: usize = 3;

/// Raw datagrams queued for one peer before further ones are dropped.
const RAW_QUEUE: usize = 1024;

/// Which end of the connection this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Role {
    /// Accepted by a [`super::Listener`]; speaks as the server.
    Server,
    /// Dialed with [`Peer::connect`].
    Client,
}

/// One remote endpoint. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

struct Inner {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    role: Role,
    /// Id of the dialing side, assigned by the server.
    id: AtomicU16,
    outbound: [Mutex<OutboundChannel>; CHANNEL_COUNT as usize],
    windows: [Arc<Semaphore>; CHANNEL_COUNT as usize],
    delivered: flume::Receiver<Result<Pkt, PeerError>>,
    /// Serializes datagram emission so fragments of one message stay together.
    send_lock: AsyncMutex<()>,
    last_send: Mutex<Instant>,
    cancel: CancellationToken,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("remote", &self.inner.remote)
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Peer {
    /// Creates a peer fed with raw datagrams through the returned sender.
    ///
    /// Spawns the inbound and timer tasks, so it needs a Tokio runtime.
    pub(super) fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        role: Role,
        id: u16,
    ) -> (Self, flume::Sender<Bytes>) {
        let (raw_tx, raw_rx) = flume::bounded(RAW_QUEUE);
        let (delivered_tx, delivered_rx) = flume::unbounded();

        let peer = Self {
            inner: Arc::new(Inner {
                socket,
                remote,
                role,
                id: AtomicU16::new(id),
                outbound: Default::default(),
                windows: std::array::from_fn(|_| Arc::new(Semaphore::new(WINDOW_SIZE))),
                delivered: delivered_rx,
                send_lock: AsyncMutex::new(()),
                last_send: Mutex::new(Instant::now()),
                cancel: CancellationToken::new(),
            }),
        };

        tokio::spawn(peer.clone().run_inbound(raw_rx, delivered_tx));
        tokio::spawn(peer.clone().run_timers());
        (peer, raw_tx)
    }

    /// Dials a server.
    ///
    /// The handshake datagram is sent immediately; the server's id
    /// assignment arrives in the background.
    pub async fn connect(addr: SocketAddr) -> Result<Self, PeerError> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let (peer, raw_tx) = Self::new(Arc::clone(&socket), addr, Role::Client, PEER_ID_NIL);

        let reader = peer.clone();
        tokio::spawn(async move {
            let mut buf = vec![0; 0x10000];
            loop {
                let received = tokio::select! {
                    _ = reader.closed() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((n, from)) if from == addr => {
                        let datagram = Bytes::copy_from_slice(&buf[..n]);
                        if raw_tx.send_async(datagram).await.is_err() {
                            break;
                        }
                    }
                    Ok((_, from)) => {
                        tracing::debug!(peer = %addr, %from, "dropping datagram from unexpected address");
                    }
                    Err(e) if is_transient(&e) => continue,
                    Err(e) => {
                        tracing::debug!(peer = %addr, "socket read failed: {e}");
                        reader.inner.fail(PeerError::Transport(e));
                        break;
                    }
                }
            }
        });

        // An empty reliable original opens the connection.
        let _ = peer.send(Pkt::reliable(0, Bytes::new())).await?;
        Ok(peer)
    }

    /// Queues a message. Reliable messages resolve the returned [`Ack`]
    /// once acknowledged.
    pub async fn send(&self, pkt: Pkt) -> Result<Ack, PeerError> {
        if pkt.channel >= CHANNEL_COUNT {
            return Err(PeerError::InvalidChannel(pkt.channel));
        }
        if pkt.data.len() > MAX_MESSAGE_SIZE {
            return Err(PeerError::TooLarge(pkt.data.len()));
        }
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let channel = usize::from(pkt.channel);

        let _guard = self.inner.send_lock.lock().await;

        let frames = match split_chunks(&pkt.data) {
            None => vec![Frame::Original { data: pkt.data }],
            Some(chunks) => {
                let seqnum = self.inner.outbound[channel]
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .next_split_seqnum();
                let count = chunks.len() as u16;
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(index, chunk)| Frame::Split {
                        seqnum,
                        count,
                        index: index as u16,
                        chunk,
                    })
                    .collect()
            }
        };

        if pkt.unreliable {
            for frame in frames {
                self.inner.send_frame(pkt.channel, frame).await?;
            }
            return Ok(Ack::done());
        }

        let mut pending = Vec::with_capacity(frames.len());
        for frame in frames {
            pending.push(self.send_reliable_frame(pkt.channel, frame).await?);
        }
        Ok(Ack { pending })
    }

    /// Encodes and sends a command reliably on its channel.
    pub async fn send_cmd<C: Command>(&self, cmd: &C) -> Result<Ack, PeerError> {
        tracing::debug!(peer = %self.inner.remote, cmd = cmd.as_ref(), "sending");
        self.send(Pkt::reliable(cmd.channel(), cmd.encode_to_vec()))
            .await
    }

    /// Waits for the next message and decodes it.
    pub async fn recv_cmd<C: Command>(&self) -> Result<C, PeerError> {
        let pkt = self.recv().await?;
        Ok(decode_message(&pkt.data)?)
    }

    /// Tells a dialing peer which id the server gave it.
    pub(super) async fn announce_id(&self) -> Result<(), PeerError> {
        let _guard = self.inner.send_lock.lock().await;
        let peer_id = self.id();
        self.send_reliable_frame(0, Frame::Control(Control::SetPeerId { peer_id }))
            .await
            .map(drop)
    }

    /// Sends one frame wrapped in a reliable frame. Callers hold `send_lock`.
    async fn send_reliable_frame(
        &self,
        channel: u8,
        frame: Frame,
    ) -> Result<oneshot::Receiver<()>, PeerError> {
        let index = usize::from(channel);
        let permit = tokio::select! {
            permit = Arc::clone(&self.inner.windows[index]).acquire_owned() => {
                permit.map_err(|_| PeerError::Closed)?
            }
            _ = self.closed() => return Err(PeerError::Closed),
        };

        let (datagram, acked) = {
            let mut outbound = self.inner.outbound[index]
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let seqnum = outbound.next_reliable_seqnum();
            let datagram = self.inner.encode(
                channel,
                Frame::Reliable {
                    seqnum,
                    inner: Box::new(frame),
                },
            );
            let acked = outbound.track(seqnum, datagram.clone(), permit);
            (datagram, acked)
        };
        self.inner.send_datagram(&datagram).await?;
        Ok(acked)
    }

    /// Waits for the next complete message.
    ///
    /// Messages queued before the peer closed are still returned; after
    /// that every call fails with [`PeerError::Closed`].
    pub async fn recv(&self) -> Result<Pkt, PeerError> {
        tokio::select! {
            biased;
            result = self.inner.delivered.recv_async() => match result {
                Ok(result) => result,
                Err(_) => Err(PeerError::Closed),
            },
            _ = self.closed() => match self.inner.delivered.try_recv() {
                Ok(result) => result,
                Err(_) => Err(PeerError::Closed),
            },
        }
    }

    /// Stops the peer without notifying the remote. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Sends a disconnect notification, then closes.
    pub async fn disconnect(&self) {
        if !self.is_closed() {
            self.inner
                .send_frame(0, Frame::Control(Control::Disco))
                .await
                .ok();
        }
        self.close();
    }

    /// Resolves once the peer is closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// The id of the dialing side of this connection.
    pub fn id(&self) -> u16 {
        self.inner.id.load(Ordering::Acquire)
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.remote
    }

    async fn run_inbound(
        self,
        raw: flume::Receiver<Bytes>,
        delivered: flume::Sender<Result<Pkt, PeerError>>,
    ) {
        let mut channels: [InboundChannel; CHANNEL_COUNT as usize] = Default::default();
        let mut deadline = time::Instant::now() + CONN_TIMEOUT;

        loop {
            let datagram = tokio::select! {
                _ = self.closed() => break,
                _ = sleep_until(deadline) => {
                    tracing::info!(peer = %self.inner.remote, "peer timed out");
                    delivered.send(Err(PeerError::TimedOut)).ok();
                    self.disconnect().await;
                    break;
                }
                datagram = raw.recv_async() => match datagram {
                    Ok(datagram) => datagram,
                    Err(_) => break,
                },
            };
            deadline = time::Instant::now() + CONN_TIMEOUT;

            if let Err(e) = self
                .handle_datagram(&datagram, &mut channels, &delivered)
                .await
            {
                match e {
                    PeerError::Closed => break,
                    PeerError::Malformed(_) | PeerError::InvalidChannel(_) => {
                        tracing::debug!(peer = %self.inner.remote, "dropping datagram: {e}");
                    }
                    e => {
                        delivered.send(Err(e)).ok();
                        self.close();
                        break;
                    }
                }
            }
        }

        // Dropping `delivered` lets `recv` drain and then report closure.
        self.close();
    }

    async fn handle_datagram(
        &self,
        datagram: &[u8],
        channels: &mut [InboundChannel; CHANNEL_COUNT as usize],
        delivered: &flume::Sender<Result<Pkt, PeerError>>,
    ) -> Result<(), PeerError> {
        let Datagram { header, frame } = decode_message(datagram)?;
        if header.protocol_id != PROTOCOL_ID {
            tracing::debug!(peer = %self.inner.remote, "wrong protocol id {:#x}", header.protocol_id);
            return Ok(());
        }
        if header.channel >= CHANNEL_COUNT {
            return Err(PeerError::InvalidChannel(header.channel));
        }
        let channel = header.channel;
        let inbound = &mut channels[usize::from(channel)];

        let frames = match frame {
            Frame::Reliable { seqnum, inner } => match inbound.receive_reliable(seqnum, *inner) {
                Ok(frames) => {
                    self.inner
                        .send_frame(channel, Frame::Control(Control::Ack { seqnum }))
                        .await?;
                    frames.into_iter().map(|f| (f, false)).collect()
                }
                Err(e) => {
                    tracing::debug!(peer = %self.inner.remote, "dropping reliable frame: {e}");
                    return Ok(());
                }
            },
            frame => vec![(frame, true)],
        };

        for (frame, unreliable) in frames {
            let data = match frame {
                Frame::Control(control) => {
                    self.handle_control(channel, control);
                    continue;
                }
                Frame::Original { data } => Some(data),
                Frame::Split {
                    seqnum,
                    count,
                    index,
                    chunk,
                } => match inbound.receive_split(seqnum, count, index, chunk) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::debug!(peer = %self.inner.remote, "bad split fragment: {e}");
                        None
                    }
                },
                Frame::Reliable { .. } => None,
            };

            // Empty messages only open connections.
            if let Some(data) = data.filter(|data| !data.is_empty()) {
                let pkt = Pkt {
                    data,
                    channel,
                    unreliable,
                };
                if delivered.send(Ok(pkt)).is_err() {
                    return Err(PeerError::Closed);
                }
            }
        }
        Ok(())
    }

    fn handle_control(&self, channel: u8, control: Control) {
        match control {
            Control::Ack { seqnum } => {
                self.inner.outbound[usize::from(channel)]
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .ack(seqnum);
            }
            Control::SetPeerId { peer_id } => {
                if self.inner.role == Role::Client {
                    tracing::debug!(peer = %self.inner.remote, peer_id, "assigned peer id");
                    self.inner.id.store(peer_id, Ordering::Release);
                }
            }
            Control::Ping => {}
            Control::Disco => {
                tracing::debug!(peer = %self.inner.remote, "remote disconnected");
                self.close();
            }
        }
    }

    async fn run_timers(self) {
        let mut interval = time::interval(TICK);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.closed() => break,
                _ = interval.tick() => {}
            }

            let now = Instant::now();
            for channel in 0..CHANNEL_COUNT {
                let due = self.inner.outbound[usize::from(channel)]
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .due_for_resend(now, RESEND_TIMEOUT);
                for datagram in due {
                    if let Err(e) = self.inner.send_datagram(&datagram).await {
                        self.inner.fail(e);
                        return;
                    }
                }
            }

            let idle = now.duration_since(*self.inner.last_send.lock().unwrap_or_else(|e| e.into_inner()));
            if idle >= PING_INTERVAL {
                if let Err(e) = self.inner.send_frame(0, Frame::Control(Control::Ping)).await {
                    self.inner.fail(e);
                    return;
                }
            }
        }
    }
}

impl Inner {
    fn sender_id(&self) -> u16 {
        match self.role {
            Role::Server => PEER_ID_SRV,
            Role::Client => self.id.load(Ordering::Acquire),
        }
    }

    fn encode(&self, channel: u8, frame: Frame) -> Bytes {
        let datagram = Datagram {
            header: Header {
                protocol_id: PROTOCOL_ID,
                sender: self.sender_id(),
                channel,
            },
            frame,
        };
        let bytes = datagram.encode_to_vec();
        debug_assert!(bytes.len() <= MAX_NET_PKT_SIZE);
        bytes.into()
    }

    async fn send_frame(&self, channel: u8, frame: Frame) -> Result<(), PeerError> {
        let datagram = self.encode(channel, frame);
        self.send_datagram(&datagram).await
    }

    async fn send_datagram(&self, datagram: &[u8]) -> Result<(), PeerError> {
        let mut attempt = 0;
        loop {
            match self.socket.send_to(datagram, self.remote).await {
                Ok(_) => break,
                Err(e) if is_transient(&e) && attempt + 1 < SEND_ATTEMPTS => attempt += 1,
                Err(e) => return Err(PeerError::Transport(e)),
            }
        }
        *self.last_send.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        Ok(())
    }

    /// Closes after an unrecoverable error.
    fn fail(&self, error: PeerError) {
        tracing::debug!(peer = %self.remote, "closing peer: {error}");
        self.close();
    }

    fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        for (outbound, window) in self.outbound.iter().zip(&self.windows) {
            outbound.lock().unwrap_or_else(|e| e.into_inner()).clear();
            window.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Listener;

    async fn pair() -> (Listener, Peer, Peer) {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = Peer::connect(listener.local_addr()).await.unwrap();
        let server = listener.accept().await.unwrap();
        (listener, client, server)
    }

    #[tokio::test]
    async fn reliable_messages_arrive_in_order() {
        let (_listener, client, server) = pair().await;

        let mut acks = Vec::new();
        for i in 0..20u8 {
            acks.push(client.send(Pkt::reliable(1, vec![i; 3])).await.unwrap());
        }
        for i in 0..20u8 {
            let pkt = server.recv().await.unwrap();
            assert_eq!(pkt.channel, 1);
            assert!(!pkt.unreliable);
            assert_eq!(pkt.data.as_ref(), [i; 3]);
        }
        for ack in acks {
            ack.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn large_messages_are_split_and_rejoined() {
        let (_listener, client, server) = pair().await;
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        server
            .send(Pkt::reliable(2, data.clone()))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        let pkt = client.recv().await.unwrap();
        assert_eq!(pkt.data.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn listener_assigns_peer_ids() {
        let (_listener, client, server) = pair().await;
        server.send(Pkt::reliable(0, vec![1])).await.unwrap();
        client.recv().await.unwrap();
        assert_eq!(client.id(), server.id());
        assert!(client.id() >= 2);
    }

    #[tokio::test]
    async fn close_fails_receivers_and_pending_acks() {
        let (_listener, client, server) = pair().await;
        server.close();
        server.close();
        assert!(matches!(server.recv().await, Err(PeerError::Closed)));
        assert!(matches!(
            server.send(Pkt::reliable(0, vec![1])).await,
            Err(PeerError::Closed)
        ));
        assert!(matches!(
            client.send(Pkt::reliable(3, vec![1])).await,
            Err(PeerError::InvalidChannel(3))
        ));
        assert!(matches!(
            client.send(Pkt::reliable(0, vec![0; MAX_MESSAGE_SIZE + 1])).await,
            Err(PeerError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_closes_the_remote() {
        let (_listener, client, server) = pair().await;
        client.disconnect().await;
        time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert!(matches!(server.recv().await, Err(PeerError::Closed)));
    }
}
