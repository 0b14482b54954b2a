//! Reliable, ordered, channelized delivery over UDP datagrams.
//!
//! Every datagram starts with a [`wire::Header`]. Messages larger than one
//! datagram are split into numbered fragments. Reliable frames carry a
//! per-channel sequence number, are retransmitted until acknowledged and are
//! delivered in sequence order. Channels are independent; nothing is
//! ordered across them.

use crate::protocol::DecodeError;
use bytes::Bytes;
use std::{io, time::Duration};
use tokio::sync::oneshot;

mod channel;
mod listener;
mod peer;
pub mod wire;

pub use listener::Listener;
pub use peer::Peer;

/// Number of logical channels per peer.
pub const CHANNEL_COUNT: u8 = 3;

/// Largest datagram the transport emits.
pub const MAX_NET_PKT_SIZE: usize = 512;

/// Largest message sent or reassembled from split fragments.
pub const MAX_MESSAGE_SIZE: usize = 0x100_0000;

pub const PEER_ID_NIL: u16 = 0;
pub const PEER_ID_SRV: u16 = 1;
/// First id the listener hands out to dialing peers.
pub const PEER_ID_FIRST_CLT: u16 = 2;

/// A peer is dropped after this long without any inbound datagram.
pub const CONN_TIMEOUT: Duration = Duration::from_secs(30);
/// A keep-alive is sent when nothing else was sent for this long.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);
/// Unacknowledged reliable datagrams are resent after this long.
pub const RESEND_TIMEOUT: Duration = Duration::from_millis(500);
/// Incomplete split messages are forgotten after this long without a fragment.
pub const SPLIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One application message on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkt {
    pub data: Bytes,
    pub channel: u8,
    pub unreliable: bool,
}

impl Pkt {
    pub fn reliable(channel: u8, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            channel,
            unreliable: false,
        }
    }

    pub fn unreliable(channel: u8, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            channel,
            unreliable: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("malformed datagram: {0}")]
    Malformed(#[from] DecodeError),
    #[error("channel {0} out of range")]
    InvalidChannel(u8),
    #[error("message of {0} bytes is too large")]
    TooLarge(usize),
    #[error("peer timed out")]
    TimedOut,
}

/// Resolves once every datagram of a reliable send was acknowledged.
///
/// Unreliable sends yield an already complete handle. If the peer closes
/// before all acknowledgments arrive, [`Ack::wait`] fails with
/// [`PeerError::Closed`].
#[derive(Debug)]
#[must_use = "dropping an Ack does not cancel the send"]
pub struct Ack {
    pending: Vec<oneshot::Receiver<()>>,
}

impl Ack {
    fn done() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    pub async fn wait(self) -> Result<(), PeerError> {
        for rx in self.pending {
            rx.await.map_err(|_| PeerError::Closed)?;
        }
        Ok(())
    }
}

/// Errors after which retrying the same socket operation is sensible.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
