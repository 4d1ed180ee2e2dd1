//! Selective acknowledgment ranges.
//!
//! Packet numbers are recorded as alternating runs of "seen" and "gap"
//! lengths anchored at the largest packet number observed so far, mirroring
//! the run-length scheme used by this crate's earlier stream-multiplexing
//! transport. The first entry in `ranges` is always a seen run.

use std::collections::VecDeque;

use crate::wire::AckFrameBody;

/// Ranges are dropped once more than this many are stored; far-past gaps are
/// assumed lost rather than tracked forever.
pub const MAX_STORED_RANGES: usize = 1001;

/// At most this many ranges are ever placed in a single ACK frame.
pub const MAX_SERIALIZED_RANGES: usize = 171;

/// Tracks which packet numbers have been seen, in a form cheap to update
/// per-packet and cheap to serialize into an ACK frame.
#[derive(Debug, Clone)]
pub struct AckRanges {
    ranges: VecDeque<u64>,
    largest: u64,
    max_stored: usize,
    max_serialized: usize,
}

impl Default for AckRanges {
    fn default() -> Self {
        Self::new(MAX_STORED_RANGES, MAX_SERIALIZED_RANGES)
    }
}

impl AckRanges {
    /// An empty tracker; `largest` is meaningless until the first packet is
    /// added. `max_stored` bounds how many run-length entries are kept
    /// in-memory; `max_serialized` bounds how many are placed in a single
    /// ACK frame.
    #[must_use]
    pub fn new(max_stored: usize, max_serialized: usize) -> Self {
        Self {
            ranges: VecDeque::new(),
            largest: 0,
            max_stored,
            max_serialized,
        }
    }

    /// The largest packet number seen so far.
    #[must_use]
    pub fn largest(&self) -> u64 {
        self.largest
    }

    /// Whether `num` has already been recorded as seen.
    #[must_use]
    pub fn contains(&self, num: u64) -> bool {
        if self.ranges.is_empty() {
            return false;
        }
        if num > self.largest {
            return false;
        }
        let mut high = self.largest;
        let mut gap = false;
        for &len in &self.ranges {
            let low = high - len;
            if high >= num && num >= low + 1 {
                return !gap;
            }
            high = low;
            gap = !gap;
        }
        false
    }

    /// Record `num` as seen.
    pub fn add(&mut self, num: u64) {
        if self.ranges.is_empty() {
            self.ranges.push_back(1);
            self.largest = num;
            return;
        }

        if num > self.largest {
            if num == self.largest + 1 {
                self.ranges[0] += 1;
            } else {
                self.ranges.push_front(num - self.largest - 1);
                self.ranges.push_front(1);
            }
            self.largest = num;
            self.truncate();
            return;
        }

        let mut high = self.largest;
        let mut gap = false;
        let mut idx = 0usize;
        while idx < self.ranges.len() {
            let len = self.ranges[idx];
            let low = high - len;

            if high >= num && num >= low + 1 {
                if !gap {
                    return;
                }

                if num == high {
                    self.ranges[idx - 1] += 1;
                    self.ranges[idx] -= 1;
                    if self.ranges[idx] == 0 {
                        let merged = self.ranges[idx - 1] + self.ranges[idx + 1];
                        self.ranges.remove(idx + 1);
                        self.ranges.remove(idx);
                        self.ranges[idx - 1] = merged;
                    }
                } else if num == low + 1 {
                    self.ranges[idx + 1] += 1;
                    self.ranges[idx] -= 1;
                    if self.ranges[idx] == 0 {
                        let merged = self.ranges[idx - 1] + self.ranges[idx + 1];
                        self.ranges.remove(idx + 1);
                        self.ranges.remove(idx);
                        self.ranges[idx - 1] = merged;
                    }
                } else {
                    let tail_gap = high - num;
                    let head_seen = num - (low + 1);
                    self.ranges[idx] = head_seen;
                    self.ranges.insert(idx, tail_gap);
                    self.ranges.insert(idx, 1);
                }
                return;
            }

            high = low;
            gap = !gap;
            idx += 1;
        }

        if high == num {
            *self.ranges.back_mut().expect("ranges non-empty") += 1;
        } else {
            self.ranges.push_back(high - num);
            self.ranges.push_back(1);
        }
        self.truncate();
    }

    fn truncate(&mut self) {
        if self.ranges.len() > self.max_stored {
            self.ranges.truncate(self.max_stored);
        }
    }

    /// Build the wire body for an ACK frame, capped at `max_serialized` entries.
    #[must_use]
    pub fn to_frame_body(&self) -> AckFrameBody {
        let count = self.ranges.len().min(self.max_serialized);
        AckFrameBody {
            largest: self.largest,
            ranges: self.ranges.iter().take(count).copied().collect(),
        }
    }
}

/// Expand a received [`AckFrameBody`] back into the individual packet
/// numbers it acknowledges. The ranges alternate (seen, gap, seen, …)
/// anchored at `largest`; this walks that alternation in reverse.
/// Malformed (peer-supplied) range lengths saturate rather than panic, since
/// ACK frames are not AEAD-authenticated.
#[must_use]
pub fn expand_ack_ranges(body: &AckFrameBody) -> Vec<u64> {
    let mut out = Vec::new();
    let mut high = body.largest;
    let mut gap = false;
    for &len in &body.ranges {
        if len == 0 {
            gap = !gap;
            continue;
        }
        if !gap {
            let low = high.saturating_sub(len - 1);
            out.extend(low..=high);
        }
        high = high.saturating_sub(len);
        gap = !gap;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_packet_becomes_largest() {
        let mut ranges = AckRanges::default();
        ranges.add(5);
        assert_eq!(ranges.largest(), 5);
        assert!(ranges.contains(5));
        assert!(!ranges.contains(4));
    }

    #[test]
    fn contiguous_packets_extend_seen_run() {
        let mut ranges = AckRanges::default();
        ranges.add(1);
        ranges.add(2);
        ranges.add(3);
        assert_eq!(ranges.to_frame_body().ranges, vec![3]);
    }

    #[test]
    fn gap_then_fill_merges_back_to_single_run() {
        let mut ranges = AckRanges::default();
        ranges.add(1);
        ranges.add(3);
        let body = ranges.to_frame_body();
        assert_eq!(body.largest, 3);
        assert_eq!(body.ranges, vec![1, 1, 1]);

        ranges.add(2);
        assert_eq!(ranges.to_frame_body().ranges, vec![3]);
        assert!(ranges.contains(1));
        assert!(ranges.contains(2));
        assert!(ranges.contains(3));
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mut ranges = AckRanges::default();
        ranges.add(10);
        ranges.add(8);
        let before = ranges.to_frame_body();
        ranges.add(8);
        assert_eq!(ranges.to_frame_body(), before);
    }

    #[test]
    fn out_of_order_arrival_splits_gap() {
        let mut ranges = AckRanges::default();
        ranges.add(1);
        ranges.add(10);
        // gap is [2..=9]; fill the middle (5), splitting one gap into two.
        ranges.add(5);
        assert!(ranges.contains(5));
        assert!(!ranges.contains(4));
        assert!(!ranges.contains(6));
        assert_eq!(ranges.to_frame_body().ranges.len(), 5);
    }

    #[test]
    fn serialization_caps_at_171_even_when_more_are_stored() {
        let mut ranges = AckRanges::default();
        // Alternate single seen / single gap packets to build many short ranges.
        let mut pn = 0u64;
        for _ in 0..400 {
            pn += 2;
            ranges.add(pn);
        }
        let body = ranges.to_frame_body();
        assert!(body.ranges.len() <= MAX_SERIALIZED_RANGES);
    }

    #[test]
    fn storage_is_capped_at_1001_ranges() {
        let mut ranges = AckRanges::default();
        let mut pn = 0u64;
        for _ in 0..2000 {
            pn += 2;
            ranges.add(pn);
        }
        assert!(ranges.ranges.len() <= MAX_STORED_RANGES);
    }

    #[test]
    fn expand_matches_every_added_packet_number() {
        let mut ranges = AckRanges::default();
        for &pn in &[1u64, 2, 3, 7, 8, 12] {
            ranges.add(pn);
        }
        let body = ranges.to_frame_body();
        let expanded = expand_ack_ranges(&body);
        assert_eq!(expanded, vec![12, 8, 7, 3, 2, 1]);
        for &pn in &[1u64, 2, 3, 7, 8, 12] {
            assert!(expanded.contains(&pn));
        }
        for &pn in &[4u64, 5, 6, 9, 10, 11] {
            assert!(!expanded.contains(&pn));
        }
    }
}
