//! # Errors
//!
//! Every fallible library operation returns [`XferError`]. Two variants are
//! resource exhaustion and are treated as fatal by the endpoint threads; the
//! rest are local to one frame, one request or one call.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XferError {
    /// The pool slot for the next sequence still holds an unacknowledged frame.
    #[error("frame pool exhausted: slot for seq {seq} is still in flight")]
    FramePoolExhausted { seq: u16 },

    /// A reassembly record is held by another open transaction.
    #[error("transaction table collision at slot {slot}: held by tid {held}, incoming tid {incoming}")]
    TransactionTableCollision { slot: usize, held: u16, incoming: u16 },

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("range {offset}+{len} exceeds memory region of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("request has no flag transfer")]
    MissingFlagTransfer,

    #[error("request is already finalized by a flag transfer")]
    Finalized,

    /// More messages than the 16-bit per-transaction count can express.
    #[error("transaction already holds the maximum of {max} messages")]
    TooManyMessages { max: usize },

    /// The transaction needs more frames than one pool can hold in flight.
    #[error("transaction needs {frames} frames, at most {max} can be in flight")]
    TransactionTooLarge { frames: usize, max: usize },

    #[error("zero-length transfer")]
    EmptyTransfer,

    #[error("invalid endpoint {input:?}: {reason}")]
    InvalidEndpoint { input: String, reason: &'static str },

    #[error("mailbox {mailbox} out of range (max {max})")]
    MailboxOutOfRange { mailbox: u16, max: u16 },

    #[error("protocol mismatch: local {local}, remote {remote}")]
    ProtocolMismatch { local: String, remote: String },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("endpoint is shut down")]
    Shutdown,
}

impl XferError {
    /// Resource exhaustion that the protocol cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XferError::FramePoolExhausted { .. } | XferError::TransactionTableCollision { .. }
        )
    }
}
