//! Datagram layout.

use bytes::Bytes;
use mt_multiproxy_macros::{Decode, Encode};

pub const PROTOCOL_ID: u32 = 0x4f45_7403;

/// Size of [`Header`] on the wire.
pub const HEADER_SIZE: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Header {
    pub protocol_id: u32,
    pub sender: u16,
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Datagram {
    pub header: Header,
    pub frame: Frame,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
#[encoding(discriminant = "u8")]
pub enum Frame {
    #[encoding(id = 0)]
    Control(Control),
    #[encoding(id = 1)]
    Original {
        #[encoding(bytes = "rest")]
        data: Bytes,
    },
    #[encoding(id = 2)]
    Split {
        seqnum: u16,
        count: u16,
        index: u16,
        #[encoding(bytes = "rest")]
        chunk: Bytes,
    },
    #[encoding(id = 3)]
    Reliable { seqnum: u16, inner: Box<Frame> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
#[encoding(discriminant = "u8")]
pub enum Control {
    #[encoding(id = 0)]
    Ack { seqnum: u16 },
    #[encoding(id = 1)]
    SetPeerId { peer_id: u16 },
    #[encoding(id = 2)]
    Ping,
    #[encoding(id = 3)]
    Disco,
}

/// Overhead of a reliable frame wrapper.
pub const RELIABLE_OVERHEAD: usize = 3;
/// Overhead of an original frame.
pub const ORIGINAL_OVERHEAD: usize = 1;
/// Overhead of a split frame.
pub const SPLIT_OVERHEAD: usize = 7;
