//! # Frame Pool
//!
//! Fixed ring of reusable frame buffers per connection. A frame lives in slot
//! `seq & (N - 1)`, so a slot comes back into use exactly `N` sequence numbers
//! after it was last handed out and at most `N` frames can be unacknowledged.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use quanta::Instant;

use crate::arq::AckRun;
use crate::error::XferError;
use crate::transaction::TransactionAcks;
use crate::wire::{self, FrameHeader, MsgHeader, FLAG_HAS_MESSAGES, FRAME_PREFIX_LEN};

/// Frame slots per connection.
pub const FRAME_POOL_SIZE: usize = 256;

// ─── SeqRing ─────────────────────────────────────────────────────────────────

/// Fixed-capacity ring addressed by 16-bit wrapping sequence numbers.
///
/// Capacity is a power of two no larger than 65536, so it divides the
/// sequence space and `seq & mask` stays consistent across wrap.
#[derive(Debug)]
pub struct SeqRing<T> {
    slots: Box<[T]>,
    mask: usize,
}

impl<T> SeqRing<T> {
    pub fn new_with(capacity: usize, mut fill: impl FnMut() -> T) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity <= 1 << 16,
            "ring capacity must be a power of two <= 65536"
        );
        SeqRing {
            slots: (0..capacity).map(|_| fill()).collect(),
            mask: capacity - 1,
        }
    }

    #[inline]
    pub fn index_of(&self, seq: u16) -> usize {
        seq as usize & self.mask
    }

    #[inline]
    pub fn slot(&self, seq: u16) -> &T {
        &self.slots[self.index_of(seq)]
    }

    #[inline]
    pub fn slot_mut(&mut self, seq: u16) -> &mut T {
        let idx = self.index_of(seq);
        &mut self.slots[idx]
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

// ─── FrameSlot ───────────────────────────────────────────────────────────────

/// One reusable frame buffer.
#[derive(Debug)]
pub struct FrameSlot {
    header: FrameHeader,
    body: BytesMut,
    in_flight: bool,
    msg_count: u16,
    last_msg_offset: Option<usize>,
    bytes_left: usize,
    resends: u32,
    sent_at: Option<Instant>,
    owner: Option<Arc<TransactionAcks>>,
}

impl FrameSlot {
    fn empty() -> Self {
        FrameSlot {
            header: FrameHeader::default(),
            body: BytesMut::new(),
            in_flight: false,
            msg_count: 0,
            last_msg_offset: None,
            bytes_left: 0,
            resends: 0,
            sent_at: None,
            owner: None,
        }
    }

    /// Reset for a new sequence number and reserve header space.
    fn prepare(&mut self, epoch: u16, seq: u16, payload_budget: usize) {
        self.header = FrameHeader {
            epoch,
            frame_seq: seq,
            ..FrameHeader::default()
        };
        self.body.clear();
        self.in_flight = true;
        self.msg_count = 0;
        self.last_msg_offset = None;
        self.bytes_left = payload_budget.saturating_sub(FRAME_PREFIX_LEN);
        self.resends = 0;
        self.sent_at = None;
        self.owner = None;
    }

    pub fn seq(&self) -> u16 {
        self.header.frame_seq
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn msg_count(&self) -> u16 {
        self.msg_count
    }

    pub fn bytes_left(&self) -> usize {
        self.bytes_left
    }

    pub fn resends(&self) -> u32 {
        self.resends
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    pub fn set_route(&mut self, src_id: u16, dest_id: u16) {
        self.header.src_id = src_id;
        self.header.dest_id = dest_id;
    }

    /// Piggyback an ACK run, or clear it.
    pub fn set_acks(&mut self, run: Option<AckRun>) {
        match run {
            Some(run) => {
                self.header.ack_start = run.start;
                self.header.ack_count = run.count;
            }
            None => {
                self.header.ack_start = 0;
                self.header.ack_count = 0;
            }
        }
    }

    pub fn set_owner(&mut self, owner: Arc<TransactionAcks>) {
        self.owner = Some(owner);
    }

    /// Append a message. The caller has already grouped messages so that
    /// each frame's share fits [`bytes_left`](Self::bytes_left).
    pub fn push_message(&mut self, mut header: MsgHeader, payload: &[u8]) {
        header.next_msg = true;
        self.last_msg_offset = Some(self.body.len());
        wire::encode_message(&mut self.body, &header, payload);
        self.bytes_left = self
            .bytes_left
            .saturating_sub(wire::encoded_message_len(payload.len()));
        self.msg_count += 1;
        self.header.flags |= FLAG_HAS_MESSAGES;
    }

    /// Clear "more messages follow" on the last message.
    pub fn seal(&mut self) {
        if let Some(offset) = self.last_msg_offset {
            self.body[offset + 1] = 0;
        }
    }

    /// Record a transmission and return the datagram to send.
    pub fn stamp(&mut self, now: Instant) -> Bytes {
        self.sent_at = Some(now);
        wire::encode_frame(&self.header, &self.body)
    }

    pub fn is_overdue(&self, now: Instant, timeout: Duration) -> bool {
        match self.sent_at {
            Some(sent) => self.in_flight && now.saturating_duration_since(sent) > timeout,
            None => false,
        }
    }
}

// ─── FramePool ───────────────────────────────────────────────────────────────

pub struct FramePool {
    slots: SeqRing<FrameSlot>,
    seq: SequenceGenerator,
    epoch: u16,
    in_flight: usize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        FramePool {
            slots: SeqRing::new_with(capacity, FrameSlot::empty),
            seq: SequenceGenerator::new(1),
            epoch: 0,
            in_flight: 0,
        }
    }

    /// Epoch stamped on every frame handed out from now on.
    pub fn set_epoch(&mut self, epoch: u16) {
        self.epoch = epoch;
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Frames handed out and not yet released.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn next_seq(&self) -> u16 {
        self.seq.current()
    }

    /// Check that the next `count` sequence numbers all map to free slots.
    pub fn can_acquire(&self, count: usize) -> Result<(), XferError> {
        let start = self.seq.current();
        if count > self.capacity() {
            return Err(XferError::TransactionTooLarge {
                frames: count,
                max: self.capacity(),
            });
        }
        for i in 0..count {
            let seq = start.wrapping_add(i as u16);
            if self.slots.slot(seq).in_flight {
                return Err(XferError::FramePoolExhausted { seq });
            }
        }
        Ok(())
    }

    /// Take the next sequentially numbered slot and prepare it.
    ///
    /// The sequence counter only advances on success.
    pub fn acquire(&mut self, payload_budget: usize) -> Result<&mut FrameSlot, XferError> {
        let seq = self.seq.current();
        if self.slots.slot(seq).in_flight {
            return Err(XferError::FramePoolExhausted { seq });
        }
        self.seq.next();
        self.in_flight += 1;
        let slot = self.slots.slot_mut(seq);
        slot.prepare(self.epoch, seq, payload_budget);
        Ok(slot)
    }

    /// The in-flight slot holding exactly `seq`.
    pub fn get_mut(&mut self, seq: u16) -> Option<&mut FrameSlot> {
        let slot = self.slots.slot_mut(seq);
        (slot.in_flight && slot.seq() == seq).then_some(slot)
    }

    /// Free the slot holding `seq` and credit its messages to the owning
    /// transaction. Returns `false` if the slot is free or has moved on to a
    /// newer sequence, so repeated releases are no-ops.
    pub fn release(&mut self, seq: u16) -> bool {
        let Some(slot) = self.get_mut(seq) else {
            return false;
        };
        slot.in_flight = false;
        if let Some(owner) = slot.owner.take() {
            owner.acknowledge(slot.msg_count as u32);
        }
        self.in_flight -= 1;
        true
    }

    /// Free the slot holding `seq` without acknowledging it; the owning
    /// transaction is marked failed.
    pub fn abandon(&mut self, seq: u16) -> bool {
        let Some(slot) = self.get_mut(seq) else {
            return false;
        };
        slot.in_flight = false;
        if let Some(owner) = slot.owner.take() {
            owner.fail();
        }
        self.in_flight -= 1;
        true
    }

    /// Abandon every in-flight frame. Returns how many there were.
    pub fn abandon_all(&mut self) -> usize {
        let seqs: Vec<u16> = self
            .slots
            .iter()
            .filter(|slot| slot.in_flight)
            .map(FrameSlot::seq)
            .collect();
        seqs.into_iter().filter(|&seq| self.abandon(seq)).count()
    }

    /// Sequence numbers of in-flight frames last sent more than `timeout` ago.
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Vec<u16> {
        self.slots
            .iter()
            .filter(|slot| slot.is_overdue(now, timeout))
            .map(FrameSlot::seq)
            .collect()
    }

    /// Count a retransmission of `seq`, returning the new resend count.
    pub fn bump_resends(&mut self, seq: u16) -> Option<u32> {
        self.get_mut(seq).map(|slot| {
            slot.resends += 1;
            slot.resends
        })
    }
}

// ─── Sequence Generator ─────────────────────────────────────────────────────

/// Wrapping 16-bit frame sequence counter.
pub struct SequenceGenerator {
    next: u16,
}

impl SequenceGenerator {
    pub fn new(start: u16) -> Self {
        SequenceGenerator { next: start }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u16 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }

    pub fn current(&self) -> u16 {
        self.next
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}
