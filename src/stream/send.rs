//! Outbound half of a multiplexed stream.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;

use crate::error::StreamError;

/// Lifecycle of a [`SendStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// No bytes queued yet.
    Ready,
    /// Bytes queued and/or in flight; more may still be queued.
    Send,
    /// Everything queued has been sent at least once; `FIN` has gone out.
    Sent,
    /// Peer has acknowledged every byte up to and including `FIN`.
    Acked,
}

/// A contiguous chunk of application data waiting to be fragmented onto the
/// wire. Stays in the queue until every byte it covers has been
/// acknowledged, even after it has been fully (first-)sent, so a loss can
/// still be retransmitted from the original bytes.
#[derive(Debug)]
struct DataItem {
    data: Bytes,
    /// Absolute stream offset of `data[0]`.
    stream_offset: u64,
}

impl DataItem {
    fn end_offset(&self) -> u64 {
        self.stream_offset + self.data.len() as u64
    }

    /// Slice out `[offset, offset + len)` in absolute stream coordinates.
    fn slice(&self, offset: u64, len: u64) -> Bytes {
        let start = (offset - self.stream_offset) as usize;
        self.data.slice(start..start + len as usize)
    }
}

/// Bookkeeping for one fragment that has been sent but not yet acknowledged.
#[derive(Debug, Clone, Copy)]
pub struct SentRange {
    /// Length of the fragment.
    pub length: u64,
    /// Connection-global packet number the fragment was sent under.
    pub packet_number: u64,
    /// When the fragment was handed to the socket, for loss-threshold comparisons.
    pub sent_time: Instant,
}

/// One fragment ready to be placed on the wire.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Absolute stream offset of the first byte.
    pub offset: u64,
    /// Whether this fragment carries the stream's final byte.
    pub fin: bool,
    /// The fragment's bytes.
    pub data: Bytes,
}

/// Send-side state machine for a single stream, per the invariant
/// `acked_offset <= sent_offset <= queue_offset`.
#[derive(Debug)]
pub struct SendStream {
    stream_id: u16,
    state: SendState,
    queue: VecDeque<DataItem>,
    queue_offset: u64,
    sent_offset: u64,
    acked_offset: u64,
    bytes_in_flight: u64,
    done_queueing: bool,
    /// Fragments sent but not yet acknowledged, keyed by stream offset.
    outstanding: BTreeMap<u64, SentRange>,
    /// Acks that arrived ahead of `acked_offset`, pending contiguity.
    outstanding_acks: BTreeMap<u64, u64>,
    max_queue_bytes: u64,
}

impl SendStream {
    /// Create a fresh, empty send stream.
    #[must_use]
    pub fn new(stream_id: u16, max_queue_bytes: u64) -> Self {
        Self {
            stream_id,
            state: SendState::Ready,
            queue: VecDeque::new(),
            queue_offset: 0,
            sent_offset: 0,
            acked_offset: 0,
            bytes_in_flight: 0,
            done_queueing: false,
            outstanding: BTreeMap::new(),
            outstanding_acks: BTreeMap::new(),
            max_queue_bytes,
        }
    }

    /// The stream id this state machine belongs to.
    #[must_use]
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SendState {
        self.state
    }

    /// Bytes sent but not yet acknowledged.
    #[must_use]
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Cumulative bytes acknowledged by the peer.
    #[must_use]
    pub fn acked_offset(&self) -> u64 {
        self.acked_offset
    }

    /// Total bytes ever packetized.
    #[must_use]
    pub fn sent_offset(&self) -> u64 {
        self.sent_offset
    }

    /// Total bytes ever enqueued.
    #[must_use]
    pub fn queue_offset(&self) -> u64 {
        self.queue_offset
    }

    /// Queue `data` for transmission. Rejected once the unsent-plus-unacked
    /// backlog would exceed `max_queue_bytes` — DataItems stay queued until
    /// fully acked, so the real memory footprint is bounded by
    /// `queue_offset - acked_offset`, not just what hasn't been sent yet.
    pub fn queue(&mut self, data: Bytes) -> Result<(), StreamError> {
        let unsent = self.queue_offset - self.acked_offset;
        if unsent + data.len() as u64 > self.max_queue_bytes {
            return Err(StreamError::Backpressure {
                stream_id: self.stream_id,
                limit: self.max_queue_bytes,
            });
        }
        let stream_offset = self.queue_offset;
        self.queue_offset += data.len() as u64;
        self.queue.push_back(DataItem {
            data,
            stream_offset,
        });
        if self.state == SendState::Ready {
            self.state = SendState::Send;
        }
        Ok(())
    }

    /// Mark the stream as having no further data; the next fragment emitted
    /// carries the `FIN` marker.
    pub fn finish(&mut self) {
        self.done_queueing = true;
        if self.state == SendState::Ready {
            self.state = SendState::Send;
        }
    }

    fn fin_sent(&self) -> bool {
        matches!(self.state, SendState::Sent | SendState::Acked)
    }

    /// Whether there is unsent data (or a pending FIN) ready to fragment.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.sent_offset < self.queue_offset || (self.done_queueing && !self.fin_sent())
    }

    /// Produce the next fragment, at most `max_len` bytes, and record it as
    /// sent under `packet_number` at `sent_time`.
    pub fn next_fragment(
        &mut self,
        max_len: usize,
        packet_number: u64,
        sent_time: Instant,
    ) -> Option<Fragment> {
        if self.sent_offset < self.queue_offset {
            let item = self
                .queue
                .iter()
                .find(|item| item.end_offset() > self.sent_offset)?;
            let available = item.end_offset() - self.sent_offset;
            let take = available.min(max_len as u64);
            let offset = self.sent_offset;
            let chunk = item.slice(offset, take);

            self.sent_offset += take;
            let fin = self.done_queueing && self.sent_offset == self.queue_offset;

            self.record_sent(offset, take, packet_number, sent_time);
            if fin {
                self.state = SendState::Sent;
            }

            return Some(Fragment {
                offset,
                fin,
                data: chunk,
            });
        }

        if self.done_queueing && !self.fin_sent() {
            self.record_sent(self.sent_offset, 0, packet_number, sent_time);
            self.state = SendState::Sent;
            return Some(Fragment {
                offset: self.sent_offset,
                fin: true,
                data: Bytes::new(),
            });
        }

        None
    }

    fn record_sent(&mut self, offset: u64, length: u64, packet_number: u64, sent_time: Instant) {
        self.bytes_in_flight += length;
        self.outstanding.insert(
            offset,
            SentRange {
                length,
                packet_number,
                sent_time,
            },
        );
    }

    /// Retransmit the bytes at `[offset, offset + length)` under a new
    /// packet number, without disturbing `sent_offset`.
    #[must_use]
    pub fn retransmit(
        &mut self,
        offset: u64,
        length: u64,
        packet_number: u64,
        sent_time: Instant,
    ) -> Option<Fragment> {
        let fin = self.done_queueing && offset + length == self.queue_offset;
        let data = if length == 0 {
            Bytes::new()
        } else {
            let item = self
                .queue
                .iter()
                .find(|item| item.stream_offset <= offset && item.end_offset() >= offset + length)?;
            item.slice(offset, length)
        };
        self.record_sent(offset, length, packet_number, sent_time);
        Some(Fragment { offset, fin, data })
    }

    /// Record that the fragment starting at `offset`, `length` bytes long,
    /// has been acknowledged. Acks that arrive ahead of `acked_offset` are
    /// parked in `outstanding_acks` until the gap before them closes.
    /// Returns the byte lengths of any `DataItem`s that became fully acked
    /// as a result, in enqueue order, so the caller can fire `did_send`.
    pub fn on_ack(&mut self, offset: u64, length: u64) -> Vec<u64> {
        if let Some(range) = self.outstanding.remove(&offset) {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(range.length);
        }

        if length > 0 {
            if offset == self.acked_offset {
                self.acked_offset += length;
            } else if offset > self.acked_offset {
                self.outstanding_acks.insert(offset, length);
            }
            // offset < acked_offset: already covered by a prior ack; duplicate.

            while let Some(len) = self.outstanding_acks.remove(&self.acked_offset) {
                self.acked_offset += len;
            }
        }

        let mut completed = Vec::new();
        while let Some(front) = self.queue.front() {
            if front.end_offset() <= self.acked_offset {
                let item = self.queue.pop_front().expect("front just observed");
                completed.push(item.data.len() as u64);
            } else {
                break;
            }
        }

        if self.fin_sent() && self.outstanding.is_empty() && self.acked_offset >= self.sent_offset
        {
            self.state = SendState::Acked;
        }

        completed
    }

    /// Drop outstanding bookkeeping for `offset` so it can be retransmitted
    /// as a new packet.
    pub fn forget_outstanding(&mut self, offset: u64) -> Option<SentRange> {
        let range = self.outstanding.remove(&offset)?;
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(range.length);
        Some(range)
    }

    /// Discard all queued/outstanding state and reset to `new_offset`, as
    /// happens on a sender-initiated stream flush.
    pub fn reset_to(&mut self, new_offset: u64) {
        self.queue.clear();
        self.outstanding.clear();
        self.queue_offset = new_offset;
        self.sent_offset = new_offset;
        self.acked_offset = new_offset;
        self.bytes_in_flight = 0;
    }
}
