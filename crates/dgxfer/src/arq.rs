//! # Acknowledgements and Duplicate Detection
//!
//! Receiver-side ARQ bookkeeping for one connection:
//!
//! - **Pending ACKs**: sequence numbers received but not yet acknowledged, in
//!   arrival order. They leave the queue as contiguous runs of at most 255,
//!   piggybacked on the next outgoing frame or sent in an ack-only frame.
//! - **Frame history**: the last sequence seen per slot of an `M`-entry ring.
//!   A frame whose sequence is already recorded as processed is a duplicate
//!   (a retransmission whose ACK was lost) and is re-acknowledged only.

use std::collections::VecDeque;

use crate::pool::SeqRing;
use crate::wire::MAX_ACK_RUN;

/// Duplicate-detection history entries per connection.
pub const FRAME_HISTORY_SIZE: usize = 1024;

// ─── AckRun ──────────────────────────────────────────────────────────────────

/// `count` consecutive sequence numbers starting at `start`, wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRun {
    pub start: u16,
    pub count: u8,
}

impl AckRun {
    pub fn seqs(self) -> impl Iterator<Item = u16> {
        (0..self.count as u16).map(move |i| self.start.wrapping_add(i))
    }
}

// ─── AckQueue ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct AckQueue {
    pending: VecDeque<u16>,
}

impl AckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, seq: u16) {
        self.pending.push_back(seq);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pop the longest contiguous run at the head of the queue.
    pub fn pop_run(&mut self) -> Option<AckRun> {
        let start = self.pending.pop_front()?;
        let mut count = 1usize;
        let mut expect = start.wrapping_add(1);
        while count < MAX_ACK_RUN && self.pending.front() == Some(&expect) {
            self.pending.pop_front();
            count += 1;
            expect = expect.wrapping_add(1);
        }
        Some(AckRun {
            start,
            count: count as u8,
        })
    }
}

// ─── FrameHistory ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HistoryEntry {
    seq: u16,
    processed: bool,
}

pub struct FrameHistory {
    ring: SeqRing<Option<HistoryEntry>>,
}

impl FrameHistory {
    pub fn new(capacity: usize) -> Self {
        FrameHistory {
            ring: SeqRing::new_with(capacity, || None),
        }
    }

    /// Whether `seq` already had its messages processed.
    pub fn is_duplicate(&self, seq: u16) -> bool {
        matches!(
            self.ring.slot(seq),
            Some(HistoryEntry { seq: s, processed: true }) if *s == seq
        )
    }

    /// Record a frame that passed the duplicate check. Ack-only frames are
    /// recorded unprocessed so an entry from an earlier wrap cannot linger.
    pub fn record(&mut self, seq: u16, processed: bool) {
        *self.ring.slot_mut(seq) = Some(HistoryEntry { seq, processed });
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_contiguous() {
        let mut q = AckQueue::new();
        for s in [100, 101, 102, 103, 104] {
            q.push(s);
        }
        assert_eq!(
            q.pop_run(),
            Some(AckRun {
                start: 100,
                count: 5
            })
        );
        assert!(q.is_empty());
        assert_eq!(q.pop_run(), None);
    }

    #[test]
    fn coalesce_splits_on_gap_and_order() {
        let mut q = AckQueue::new();
        for s in [1, 2, 5, 6, 3] {
            q.push(s);
        }
        assert_eq!(q.pop_run(), Some(AckRun { start: 1, count: 2 }));
        assert_eq!(q.pop_run(), Some(AckRun { start: 5, count: 2 }));
        assert_eq!(q.pop_run(), Some(AckRun { start: 3, count: 1 }));
    }

    #[test]
    fn coalesce_wraps_and_caps() {
        let mut q = AckQueue::new();
        q.push(u16::MAX);
        q.push(0);
        let run = q.pop_run().unwrap();
        assert_eq!(run.count, 2);
        assert_eq!(run.seqs().collect::<Vec<_>>(), vec![u16::MAX, 0]);

        for s in 0..300u16 {
            q.push(s);
        }
        assert_eq!(q.pop_run(), Some(AckRun { start: 0, count: 255 }));
        assert_eq!(
            q.pop_run(),
            Some(AckRun {
                start: 255,
                count: 45
            })
        );
    }

    #[test]
    fn duplicate_only_after_processing() {
        let mut h = FrameHistory::new(FRAME_HISTORY_SIZE);
        assert!(!h.is_duplicate(42));
        h.record(42, true);
        assert!(h.is_duplicate(42));
        // Same slot, different sequence.
        assert!(!h.is_duplicate(42 + FRAME_HISTORY_SIZE as u16));
    }

    #[test]
    fn ack_only_entry_overwrites_stale() {
        let mut h = FrameHistory::new(4);
        h.record(1, true);
        h.record(5, false);
        assert!(!h.is_duplicate(1));
        assert!(!h.is_duplicate(5));
    }

    #[test]
    fn history_survives_wrap() {
        let mut h = FrameHistory::new(FRAME_HISTORY_SIZE);
        h.record(u16::MAX, true);
        assert!(h.is_duplicate(u16::MAX));
        h.record(0, true);
        assert!(h.is_duplicate(0));
        assert!(h.is_duplicate(u16::MAX));
    }
}
