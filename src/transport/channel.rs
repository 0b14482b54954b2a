//! Per-channel sequencing state.
//!
//! The types here do no I/O. The peer tasks feed them decoded frames and
//! send whatever they return.

use super::{
    wire::{Frame, ORIGINAL_OVERHEAD, RELIABLE_OVERHEAD, SPLIT_OVERHEAD},
    MAX_MESSAGE_SIZE, MAX_NET_PKT_SIZE, SPLIT_TIMEOUT,
};
use crate::transport::wire::HEADER_SIZE;
use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use mini_moka::sync::Cache;
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::{oneshot, OwnedSemaphorePermit};

/// First sequence number used on every channel.
pub const SEQNUM_INIT: u16 = 65500;

/// Sequence numbers at or past this distance behind the cursor count as old.
const SEQNUM_HALF: u16 = 0x8000;

/// Upper bound on unacknowledged reliable datagrams per channel.
pub const WINDOW_SIZE: usize = 0x4000;

/// Largest payload of an unsplit message.
pub const MAX_ORIGINAL_PAYLOAD: usize =
    MAX_NET_PKT_SIZE - HEADER_SIZE - RELIABLE_OVERHEAD - ORIGINAL_OVERHEAD;

/// Largest payload carried by one split fragment.
pub const MAX_SPLIT_CHUNK: usize =
    MAX_NET_PKT_SIZE - HEADER_SIZE - RELIABLE_OVERHEAD - SPLIT_OVERHEAD;

/// Most fragments a message of [`MAX_MESSAGE_SIZE`] needs.
pub const MAX_SPLIT_COUNT: usize = MAX_MESSAGE_SIZE.div_ceil(MAX_SPLIT_CHUNK);

/// Split messages reassembled at once per channel.
const MAX_PENDING_SPLITS: u64 = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("split fragment {index} of {count} is out of range")]
    SplitIndex { index: u16, count: u16 },
    #[error("split of {count} fragments exceeds the message size limit")]
    SplitTooLarge { count: u16 },
    #[error("split {seqnum} changed its fragment count from {expected} to {got}")]
    SplitCount { seqnum: u16, expected: u16, got: u16 },
    #[error("reliable frame nested in a reliable frame")]
    NestedReliable,
    #[error("reliable frame {seqnum} is beyond the receive window")]
    BeyondWindow { seqnum: u16 },
}

/// Reassembly buffer of one split message.
#[derive(Debug)]
struct SplitBuffer {
    count: u16,
    chunks: AHashMap<u16, Bytes>,
}

impl SplitBuffer {
    fn new(count: u16) -> Self {
        Self {
            count,
            chunks: AHashMap::new(),
        }
    }

    fn insert(&mut self, index: u16, chunk: Bytes) -> Option<Bytes> {
        self.chunks.entry(index).or_insert(chunk);
        if self.chunks.len() < usize::from(self.count) {
            return None;
        }

        let total = self.chunks.values().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for index in 0..self.count {
            data.extend_from_slice(self.chunks.get(&index)?);
        }
        Some(data.freeze())
    }
}

/// Inbound state of one channel.
pub struct InboundChannel {
    next_reliable: u16,
    /// Reliable frames that arrived ahead of the cursor.
    pending: AHashMap<u16, Frame>,
    splits: Cache<u16, Arc<Mutex<SplitBuffer>>>,
}

impl Default for InboundChannel {
    fn default() -> Self {
        Self::new(SPLIT_TIMEOUT)
    }
}

impl InboundChannel {
    pub fn new(split_timeout: Duration) -> Self {
        Self {
            next_reliable: SEQNUM_INIT,
            pending: AHashMap::new(),
            splits: Cache::builder()
                .max_capacity(MAX_PENDING_SPLITS)
                .time_to_idle(split_timeout)
                .build(),
        }
    }

    /// Accepts a reliable frame and returns the frames now deliverable in
    /// sequence order.
    ///
    /// Old duplicates yield nothing. Frames more than [`WINDOW_SIZE`] ahead
    /// of the cursor are refused; the caller acknowledges only accepted
    /// sequence numbers.
    pub fn receive_reliable(
        &mut self,
        seqnum: u16,
        inner: Frame,
    ) -> Result<Vec<Frame>, ChannelError> {
        if matches!(inner, Frame::Reliable { .. }) {
            return Err(ChannelError::NestedReliable);
        }

        let offset = seqnum.wrapping_sub(self.next_reliable);
        if offset >= SEQNUM_HALF {
            return Ok(Vec::new());
        }
        if usize::from(offset) >= WINDOW_SIZE {
            return Err(ChannelError::BeyondWindow { seqnum });
        }
        self.pending.entry(seqnum).or_insert(inner);

        let mut ready = Vec::new();
        while let Some(frame) = self.pending.remove(&self.next_reliable) {
            ready.push(frame);
            self.next_reliable = self.next_reliable.wrapping_add(1);
        }
        Ok(ready)
    }

    /// Feeds one split fragment, returning the whole message once every
    /// fragment arrived.
    pub fn receive_split(
        &mut self,
        seqnum: u16,
        count: u16,
        index: u16,
        chunk: Bytes,
    ) -> Result<Option<Bytes>, ChannelError> {
        if index >= count {
            return Err(ChannelError::SplitIndex { index, count });
        }
        if usize::from(count) > MAX_SPLIT_COUNT {
            return Err(ChannelError::SplitTooLarge { count });
        }

        let buffer = match self.splits.get(&seqnum) {
            Some(buffer) => buffer,
            None => {
                let buffer = Arc::new(Mutex::new(SplitBuffer::new(count)));
                self.splits.insert(seqnum, Arc::clone(&buffer));
                buffer
            }
        };

        let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.count != count {
            return Err(ChannelError::SplitCount {
                seqnum,
                expected: buffer.count,
                got: count,
            });
        }
        let complete = buffer.insert(index, chunk);
        drop(buffer);
        if complete.is_some() {
            self.splits.invalidate(&seqnum);
        }
        Ok(complete)
    }
}

/// A reliable datagram waiting for its acknowledgment.
struct Unacked {
    datagram: Bytes,
    sent_at: Instant,
    acked: oneshot::Sender<()>,
    _permit: OwnedSemaphorePermit,
}

/// Outbound state of one channel.
pub struct OutboundChannel {
    next_reliable: u16,
    next_split: u16,
    unacked: AHashMap<u16, Unacked>,
}

impl Default for OutboundChannel {
    fn default() -> Self {
        Self {
            next_reliable: SEQNUM_INIT,
            next_split: SEQNUM_INIT,
            unacked: AHashMap::new(),
        }
    }
}

impl OutboundChannel {
    pub fn next_reliable_seqnum(&mut self) -> u16 {
        let seqnum = self.next_reliable;
        self.next_reliable = self.next_reliable.wrapping_add(1);
        seqnum
    }

    pub fn next_split_seqnum(&mut self) -> u16 {
        let seqnum = self.next_split;
        self.next_split = self.next_split.wrapping_add(1);
        seqnum
    }

    /// Remembers a sent reliable datagram until it is acknowledged.
    pub fn track(
        &mut self,
        seqnum: u16,
        datagram: Bytes,
        permit: OwnedSemaphorePermit,
    ) -> oneshot::Receiver<()> {
        let (acked, rx) = oneshot::channel();
        self.unacked.insert(
            seqnum,
            Unacked {
                datagram,
                sent_at: Instant::now(),
                acked,
                _permit: permit,
            },
        );
        rx
    }

    /// Returns whether `seqnum` was outstanding.
    pub fn ack(&mut self, seqnum: u16) -> bool {
        match self.unacked.remove(&seqnum) {
            Some(unacked) => {
                unacked.acked.send(()).ok();
                true
            }
            None => false,
        }
    }

    /// Datagrams unacknowledged for at least `timeout`, oldest sequence first.
    pub fn due_for_resend(&mut self, now: Instant, timeout: Duration) -> Vec<Bytes> {
        let mut due: Vec<_> = self
            .unacked
            .iter_mut()
            .filter(|(_, unacked)| now.duration_since(unacked.sent_at) >= timeout)
            .map(|(seqnum, unacked)| {
                unacked.sent_at = now;
                (*seqnum, unacked.datagram.clone())
            })
            .collect();
        // Order by distance from the oldest possible outstanding number.
        let base = self.next_reliable.wrapping_sub(WINDOW_SIZE as u16);
        due.sort_by_key(|(seqnum, _)| seqnum.wrapping_sub(base));
        due.into_iter().map(|(_, datagram)| datagram).collect()
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    /// Drops every outstanding datagram, failing their waiters.
    pub fn clear(&mut self) {
        self.unacked.clear();
    }
}

/// Cuts a message into the payloads of split fragments, or returns `None`
/// if it fits one original frame.
pub fn split_chunks(data: &Bytes) -> Option<Vec<Bytes>> {
    if data.len() <= MAX_ORIGINAL_PAYLOAD {
        return None;
    }
    let mut chunks = Vec::with_capacity(data.len().div_ceil(MAX_SPLIT_CHUNK));
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + MAX_SPLIT_CHUNK).min(data.len());
        chunks.push(data.slice(offset..end));
        offset = end;
    }
    Some(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn original(data: &'static [u8]) -> Frame {
        Frame::Original {
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn reliable_frames_come_out_in_order() {
        let mut channel = InboundChannel::default();
        assert!(channel
            .receive_reliable(SEQNUM_INIT + 1, original(b"b"))
            .unwrap()
            .is_empty());
        // Duplicate of a buffered frame.
        assert!(channel
            .receive_reliable(SEQNUM_INIT + 1, original(b"b"))
            .unwrap()
            .is_empty());

        let ready = channel.receive_reliable(SEQNUM_INIT, original(b"a")).unwrap();
        assert_eq!(ready, vec![original(b"a"), original(b"b")]);

        // Old duplicate after delivery.
        assert!(channel
            .receive_reliable(SEQNUM_INIT, original(b"a"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut channel = InboundChannel::default();
        let mut delivered = Vec::new();
        let mut seqnum = SEQNUM_INIT;
        for _ in 0..100 {
            delivered.extend(channel.receive_reliable(seqnum, original(b"x")).unwrap());
            seqnum = seqnum.wrapping_add(1);
        }
        assert_eq!(delivered.len(), 100);
        assert_eq!(channel.next_reliable, SEQNUM_INIT.wrapping_add(100));
    }

    #[test]
    fn nested_reliable_is_rejected() {
        let mut channel = InboundChannel::default();
        let nested = Frame::Reliable {
            seqnum: 1,
            inner: Box::new(original(b"x")),
        };
        assert_eq!(
            channel.receive_reliable(SEQNUM_INIT, nested),
            Err(ChannelError::NestedReliable)
        );
    }

    #[test]
    fn splits_reassemble_in_any_order() {
        let data: Bytes = (0..2000u32).map(|i| i as u8).collect::<Vec<_>>().into();
        let chunks = split_chunks(&data).unwrap();
        let count = chunks.len() as u16;
        assert!(count > 1);

        let mut channel = InboundChannel::default();
        let mut order: Vec<u16> = (0..count).collect();
        order.reverse();
        order.swap(0, 1);

        let mut result = None;
        for index in order {
            let chunk = chunks[usize::from(index)].clone();
            if let Some(data) = channel.receive_split(9, count, index, chunk).unwrap() {
                result = Some(data);
            }
        }
        assert_eq!(result.unwrap(), data);
    }

    #[test]
    fn split_errors() {
        let mut channel = InboundChannel::default();
        assert!(channel
            .receive_split(1, 2, 2, Bytes::new())
            .is_err());
        channel.receive_split(1, 2, 0, Bytes::new()).unwrap();
        assert_eq!(
            channel.receive_split(1, 3, 1, Bytes::new()),
            Err(ChannelError::SplitCount {
                seqnum: 1,
                expected: 2,
                got: 3
            })
        );
    }

    #[test]
    fn oversized_splits_are_refused() {
        let mut channel = InboundChannel::default();
        let count = u16::MAX;
        assert_eq!(
            channel.receive_split(1, count, 0, Bytes::new()),
            Err(ChannelError::SplitTooLarge { count })
        );

        let largest = MAX_SPLIT_COUNT as u16;
        assert_eq!(
            channel.receive_split(2, largest, largest - 1, Bytes::from_static(b"x")),
            Ok(None)
        );
    }

    #[test]
    fn reliable_frames_beyond_the_window_are_refused() {
        let mut channel = InboundChannel::default();
        let far = SEQNUM_INIT.wrapping_add(WINDOW_SIZE as u16);
        assert_eq!(
            channel.receive_reliable(far, original(b"x")),
            Err(ChannelError::BeyondWindow { seqnum: far })
        );
        assert!(channel.pending.is_empty());

        let edge = far.wrapping_sub(1);
        assert!(channel
            .receive_reliable(edge, original(b"y"))
            .unwrap()
            .is_empty());
        assert_eq!(channel.pending.len(), 1);
    }

    #[test]
    fn small_messages_are_not_split() {
        assert!(split_chunks(&Bytes::from(vec![0; MAX_ORIGINAL_PAYLOAD])).is_none());
        let chunks = split_chunks(&Bytes::from(vec![0; MAX_ORIGINAL_PAYLOAD + 1])).unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn acks_resolve_waiters_and_release_the_window() {
        let window = Arc::new(Semaphore::new(2));
        let mut channel = OutboundChannel::default();

        let seqnum = channel.next_reliable_seqnum();
        assert_eq!(seqnum, SEQNUM_INIT);
        let permit = Arc::clone(&window).acquire_owned().await.unwrap();
        let rx = channel.track(seqnum, Bytes::from_static(b"d"), permit);
        assert_eq!(window.available_permits(), 1);

        assert!(channel.ack(seqnum));
        assert!(!channel.ack(seqnum));
        rx.await.unwrap();
        assert_eq!(window.available_permits(), 2);
    }

    #[tokio::test]
    async fn resend_after_timeout_and_fail_on_clear() {
        let window = Arc::new(Semaphore::new(4));
        let mut channel = OutboundChannel::default();
        let seqnum = channel.next_reliable_seqnum();
        let permit = Arc::clone(&window).acquire_owned().await.unwrap();
        let rx = channel.track(seqnum, Bytes::from_static(b"d"), permit);

        let now = Instant::now();
        assert!(channel
            .due_for_resend(now, Duration::from_secs(60))
            .is_empty());
        let later = now + Duration::from_secs(1);
        assert_eq!(
            channel.due_for_resend(later, Duration::from_millis(500)),
            vec![Bytes::from_static(b"d")]
        );

        channel.clear();
        assert!(rx.await.is_err());
        assert_eq!(channel.unacked_count(), 0);
    }
}
