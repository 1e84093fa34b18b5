//! # Transactions
//!
//! Sender side: a [`Transaction`] is the list of messages built by one request,
//! finalized by its flag transfer. Each post gets a fresh [`TransactionAcks`]
//! that frames credit as they are acknowledged.
//!
//! Receiver side: a [`TransactionTable`] of `T` reassembly records keyed by
//! `transaction_id & (T - 1)`. A record opens on the first message of a
//! transaction and closes the moment its last message has been processed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::XferError;
use crate::pool::SeqRing;
use crate::wire::MsgType;

/// Reassembly records per connection.
pub const TRANSACTION_TABLE_SIZE: usize = 512;

/// Most messages one transaction can carry; `num_msgs` is 16 bits on the wire.
pub const MAX_TRANSACTION_MESSAGES: usize = u16::MAX as usize;

// ─── Sender Side ─────────────────────────────────────────────────────────────

/// One message of an outbound transaction, described by memory offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundMessage {
    pub msg_type: MsgType,
    pub src_offset: u32,
    pub dst_offset: u32,
    pub len: u16,
}

/// Where the completion flag comes from and where it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagTarget {
    /// Local offset of the 32-bit flag value, read at post time.
    pub src_offset: u32,
    /// Remote offset the value is written to on completion.
    pub dst_offset: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Transaction {
    messages: Vec<OutboundMessage>,
    flag: Option<FlagTarget>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, msg: OutboundMessage) -> Result<(), XferError> {
        if self.flag.is_some() {
            return Err(XferError::Finalized);
        }
        if self.messages.len() >= MAX_TRANSACTION_MESSAGES {
            return Err(XferError::TooManyMessages {
                max: MAX_TRANSACTION_MESSAGES,
            });
        }
        self.messages.push(msg);
        Ok(())
    }

    /// Finalize with the flag transfer. A transaction with no messages gets
    /// a single zero-length flag-only message.
    pub fn finalize(&mut self, flag: FlagTarget) -> Result<(), XferError> {
        if self.flag.is_some() {
            return Err(XferError::Finalized);
        }
        if self.messages.is_empty() {
            self.messages.push(OutboundMessage {
                msg_type: MsgType::Data,
                src_offset: 0,
                dst_offset: flag.dst_offset,
                len: 0,
            });
        }
        self.flag = Some(flag);
        Ok(())
    }

    pub fn flag(&self) -> Option<FlagTarget> {
        self.flag
    }

    pub fn messages(&self) -> &[OutboundMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Message count stamped on the wire. Zero marks a lone zero-length flag
    /// message, which completes on its own.
    pub fn wire_count(&self) -> u16 {
        match self.messages.as_slice() {
            [only] if only.len == 0 => 0,
            msgs => msgs.len() as u16,
        }
    }
}

/// Acknowledgement progress of one posted transaction.
#[derive(Debug)]
pub struct TransactionAcks {
    total: u32,
    acked: AtomicU32,
    failed: AtomicBool,
}

impl TransactionAcks {
    pub fn new(total: u32) -> Self {
        TransactionAcks {
            total,
            acked: AtomicU32::new(0),
            failed: AtomicBool::new(false),
        }
    }

    pub fn acknowledge(&self, messages: u32) {
        self.acked.fetch_add(messages, Ordering::AcqRel);
    }

    pub fn fail(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn acked(&self) -> u32 {
        self.acked.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        !self.is_failed() && self.acked() >= self.total
    }
}

// ─── Receiver Side ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgTransactionRecord {
    pub transaction_id: u16,
    pub expected: u16,
    pub processed: u16,
}

/// Outcome of counting one message against its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More messages outstanding.
    Partial { processed: u16, expected: u16 },
    /// That was the last one; the record has been freed.
    Complete,
}

pub struct TransactionTable {
    records: SeqRing<Option<MsgTransactionRecord>>,
    open: usize,
}

impl TransactionTable {
    pub fn new(capacity: usize) -> Self {
        TransactionTable {
            records: SeqRing::new_with(capacity, || None),
            open: 0,
        }
    }

    /// Fail fast if the record slot for `tid` belongs to another open
    /// transaction.
    pub fn check(&self, tid: u16) -> Result<(), XferError> {
        match self.records.slot(tid) {
            Some(rec) if rec.transaction_id != tid => {
                Err(XferError::TransactionTableCollision {
                    slot: self.records.index_of(tid),
                    held: rec.transaction_id,
                    incoming: tid,
                })
            }
            _ => Ok(()),
        }
    }

    /// Count one processed message of `tid`, opening the record if needed.
    pub fn record_message(&mut self, tid: u16, expected: u16) -> Result<Progress, XferError> {
        self.check(tid)?;
        let slot = self.records.slot_mut(tid);
        if slot.is_none() {
            self.open += 1;
        }
        let rec = slot.get_or_insert(MsgTransactionRecord {
            transaction_id: tid,
            expected,
            processed: 0,
        });
        rec.processed += 1;
        let (processed, expected) = (rec.processed, rec.expected);
        if processed >= expected {
            *slot = None;
            self.open -= 1;
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Partial {
                processed,
                expected,
            })
        }
    }

    pub fn get(&self, tid: u16) -> Option<&MsgTransactionRecord> {
        self.records
            .slot(tid)
            .as_ref()
            .filter(|rec| rec.transaction_id == tid)
    }

    /// Records currently open.
    pub fn open(&self) -> usize {
        self.open
    }
}
