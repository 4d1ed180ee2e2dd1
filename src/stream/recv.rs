//! Inbound half of a multiplexed stream.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Lifecycle of a [`RecvStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Still receiving; final size unknown.
    Recv,
    /// The `FIN` fragment has arrived, so total size is known, but gaps remain.
    SizeKnown,
    /// Every byte up to `size` has arrived.
    AllRecv,
    /// The application has read every byte.
    Read,
}

/// Receive-side state machine for a single stream.
#[derive(Debug)]
pub struct RecvStream {
    stream_id: u16,
    state: RecvState,
    size: Option<u64>,
    /// Out-of-order fragments keyed by their starting offset.
    recv_packets: BTreeMap<u64, Bytes>,
    read_offset: u64,
    wait_flush: bool,
}

impl RecvStream {
    /// Create a fresh receive stream.
    #[must_use]
    pub fn new(stream_id: u16) -> Self {
        Self {
            stream_id,
            state: RecvState::Recv,
            size: None,
            recv_packets: BTreeMap::new(),
            read_offset: 0,
            wait_flush: false,
        }
    }

    /// The stream id this state machine belongs to.
    #[must_use]
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RecvState {
        self.state
    }

    /// Whether a SKIPSTREAM is outstanding, awaiting FLUSHCONF.
    #[must_use]
    pub fn waiting_on_flush(&self) -> bool {
        self.wait_flush
    }

    /// Record that a SKIPSTREAM has been sent for this stream.
    pub fn mark_waiting_on_flush(&mut self) {
        self.wait_flush = true;
    }

    /// Record that the matching FLUSHCONF has arrived.
    pub fn clear_wait_flush(&mut self) {
        self.wait_flush = false;
    }

    /// Application read cursor.
    #[must_use]
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// The largest offset covered by any buffered fragment, or `read_offset`
    /// if nothing is buffered. Used to pick the flush point for a
    /// sender-initiated skip: everything already buffered is still
    /// deliverable, so the flush must not discard it.
    #[must_use]
    pub fn buffered_end(&self) -> u64 {
        self.recv_packets
            .iter()
            .map(|(&start, data)| start + data.len() as u64)
            .max()
            .unwrap_or(self.read_offset)
            .max(self.read_offset)
    }

    /// Accept a fragment starting at `offset`. `fin` marks the stream's final byte.
    pub fn receive(&mut self, offset: u64, data: Bytes, fin: bool) {
        if offset + data.len() as u64 <= self.read_offset {
            return;
        }
        if fin {
            self.size = Some(offset + data.len() as u64);
        }
        if !data.is_empty() || fin {
            self.recv_packets.insert(offset, data);
        }
        self.advance_state();
    }

    /// Fast-forward the read cursor to `offset`, discarding any buffered
    /// fragments before it, in response to a FLUSHSTREAM from the peer.
    pub fn flush_to(&mut self, offset: u64) {
        if offset > self.read_offset {
            self.read_offset = offset;
        }
        self.recv_packets.retain(|&start, data| {
            let end = start + data.len() as u64;
            end > self.read_offset
        });
        self.advance_state();
    }

    fn advance_state(&mut self) {
        if self.state == RecvState::Read || self.state == RecvState::AllRecv {
            return;
        }
        let Some(size) = self.size else {
            return;
        };
        self.state = RecvState::SizeKnown;
        if self.check_finish(size) {
            self.state = RecvState::AllRecv;
        }
    }

    fn check_finish(&self, size: u64) -> bool {
        let mut offset = self.read_offset;
        for (&start, data) in &self.recv_packets {
            if offset < start {
                return false;
            }
            offset = offset.max(start + data.len() as u64);
        }
        offset == size
    }

    /// Pull up to `max_len` contiguous bytes starting at the read cursor.
    /// Returns `None` once nothing contiguous is available.
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        let (&start, _) = self.recv_packets.first_key_value()?;
        if start > self.read_offset {
            return None;
        }

        let data = self.recv_packets.remove(&start).expect("key just observed");
        let skip = (self.read_offset - start) as usize;
        let usable = &data[skip..];

        if usable.len() <= max_len {
            self.read_offset += usable.len() as u64;
            let out = data.slice(skip..);
            self.maybe_mark_read();
            Some(out)
        } else {
            let out = data.slice(skip..skip + max_len);
            let remainder = data.slice(skip + max_len..);
            let remainder_offset = start + skip as u64 + max_len as u64;
            self.recv_packets.insert(remainder_offset, remainder);
            self.read_offset += max_len as u64;
            self.maybe_mark_read();
            Some(out)
        }
    }

    fn maybe_mark_read(&mut self) {
        if let Some(size) = self.size {
            if self.read_offset == size {
                self.state = RecvState::Read;
            }
        }
    }

    /// Whether the application has consumed every byte of the stream.
    #[must_use]
    pub fn is_fully_read(&self) -> bool {
        self.state == RecvState::Read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery_reaches_all_recv_then_read() {
        let mut stream = RecvStream::new(1);
        stream.receive(0, Bytes::from_static(b"hello"), true);
        assert_eq!(stream.state(), RecvState::AllRecv);

        let data = stream.read(1024).unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(stream.state(), RecvState::Read);
    }

    #[test]
    fn out_of_order_fragments_wait_for_the_gap() {
        let mut stream = RecvStream::new(1);
        stream.receive(5, Bytes::from_static(b"world"), true);
        assert_eq!(stream.state(), RecvState::SizeKnown);
        assert!(stream.read(1024).is_none());

        stream.receive(0, Bytes::from_static(b"hello"), false);
        assert_eq!(stream.state(), RecvState::AllRecv);
        let data = stream.read(1024).unwrap();
        assert_eq!(&data[..], b"hello");
        let data = stream.read(1024).unwrap();
        assert_eq!(&data[..], b"world");
        assert_eq!(stream.state(), RecvState::Read);
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut stream = RecvStream::new(1);
        stream.receive(0, Bytes::from_static(b"abc"), false);
        stream.receive(0, Bytes::from_static(b"abc"), false);
        let data = stream.read(1024).unwrap();
        assert_eq!(&data[..], b"abc");
        assert!(stream.read(1024).is_none());
    }

    #[test]
    fn read_respects_max_len_and_buffers_the_remainder() {
        let mut stream = RecvStream::new(1);
        stream.receive(0, Bytes::from(vec![1u8; 10]), true);
        let first = stream.read(4).unwrap();
        assert_eq!(first.len(), 4);
        let second = stream.read(100).unwrap();
        assert_eq!(second.len(), 6);
        assert!(stream.is_fully_read());
    }

    #[test]
    fn flush_to_discards_buffered_prefix() {
        let mut stream = RecvStream::new(1);
        stream.receive(10, Bytes::from_static(b"later"), true);
        stream.flush_to(10);
        assert_eq!(stream.read_offset(), 10);
        let data = stream.read(1024).unwrap();
        assert_eq!(&data[..], b"later");
    }
}
