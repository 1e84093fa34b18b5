//! # Transfer Requests
//!
//! [`XferRequest`] is the caller-facing side of one copy operation:
//! describe ranges with [`copy`](XferRequest::copy), finish with a flag
//! transfer, [`post`](XferRequest::post), then poll
//! [`status`](XferRequest::status).
//!
//! ```no_run
//! # use dgxfer::{CopyKind, LocalEndpoint, XferError};
//! # fn demo(local: &LocalEndpoint, peer: &dgxfer::EndPoint) -> Result<(), XferError> {
//! let mut req = local.request(peer)?;
//! req.copy(0, 0, 10_000, CopyKind::Data)?
//!     .copy(16_384, 16_380, 4, CopyKind::Flag)?;
//! req.post()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::error::XferError;
use crate::memory::check_range;
use crate::services::{PostedTransaction, XferServices};
use crate::transaction::{FlagTarget, OutboundMessage, Transaction};
use crate::wire::MsgType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    /// Bulk data, split into frame-sized messages.
    Data,
    /// Like `Data`, tagged as metadata on the wire.
    Metadata,
    /// Finalize: the remote writes the 32-bit value at the source offset to
    /// the destination offset once every message has landed.
    Flag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Pending,
    CompleteSuccess,
    /// A frame was abandoned: resend cap, disconnect or a fatal endpoint stop.
    Failed,
}

pub struct XferRequest {
    services: Arc<XferServices>,
    txn: Transaction,
    posted: Option<PostedTransaction>,
}

impl std::fmt::Debug for XferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XferRequest")
            .field("txn", &self.txn)
            .field("posted", &self.posted)
            .finish_non_exhaustive()
    }
}

impl XferRequest {
    pub fn new(services: Arc<XferServices>) -> Self {
        XferRequest {
            services,
            txn: Transaction::new(),
            posted: None,
        }
    }

    /// Describe one copy from local `src_offset` to remote `dst_offset`.
    ///
    /// A copy that would push the request past the frames one connection
    /// can keep in flight is refused and leaves the request as it was; split
    /// large transfers across requests of at most
    /// [`max_transaction_bytes`](XferServices::max_transaction_bytes).
    pub fn copy(
        &mut self,
        src_offset: u32,
        dst_offset: u32,
        len: u32,
        kind: CopyKind,
    ) -> Result<&mut Self, XferError> {
        let local_size = self.services.memory().len() as u64;
        let remote_size = self.services.remote().size as u64;
        let check_remote = |offset: u32, len: u64| {
            // Size 0: peer learned from traffic, its memory size is unknown.
            if remote_size == 0 {
                Ok(())
            } else {
                check_range(offset as u64, len, remote_size)
            }
        };

        let msg_type = match kind {
            CopyKind::Flag => {
                check_range(src_offset as u64, 4, local_size)?;
                check_remote(dst_offset, 4)?;
                self.txn.finalize(FlagTarget {
                    src_offset,
                    dst_offset,
                })?;
                return Ok(self);
            }
            CopyKind::Data => MsgType::Data,
            CopyKind::Metadata => MsgType::Metadata,
        };

        if len == 0 {
            return Err(XferError::EmptyTransfer);
        }
        if self.txn.flag().is_some() {
            return Err(XferError::Finalized);
        }
        check_range(src_offset as u64, len as u64, local_size)?;
        check_remote(dst_offset, len as u64)?;

        let chunk = self.services.max_message_payload() as u32;
        if chunk == 0 {
            return Err(XferError::Config(format!(
                "frame budget {} leaves no room for payload",
                self.services.payload_size()
            )));
        }
        let mut txn = self.txn.clone();
        let mut offset = 0u32;
        while offset < len {
            let n = chunk.min(len - offset);
            txn.add(OutboundMessage {
                msg_type,
                src_offset: src_offset + offset,
                dst_offset: dst_offset + offset,
                len: n as u16,
            })?;
            offset += n;
        }
        let frames = self.services.frames_needed(&txn)?;
        let max = self.services.max_transaction_frames();
        if frames > max {
            return Err(XferError::TransactionTooLarge { frames, max });
        }
        self.txn = txn;
        Ok(self)
    }

    /// Send the transaction. Each post gets a fresh transaction id, reads the
    /// current source bytes and flag value, and restarts status tracking.
    pub fn post(&mut self) -> Result<(), XferError> {
        if self.txn.flag().is_none() {
            return Err(XferError::MissingFlagTransfer);
        }
        self.posted = Some(self.services.post_transaction(&self.txn)?);
        Ok(())
    }

    pub fn status(&self) -> CompletionStatus {
        match &self.posted {
            Some(p) if p.acks.is_failed() => CompletionStatus::Failed,
            Some(p) if p.acks.is_complete() => CompletionStatus::CompleteSuccess,
            _ => CompletionStatus::Pending,
        }
    }

    /// Poll [`status`](Self::status) until it leaves `Pending` or `timeout`
    /// passes.
    pub fn wait(&self, timeout: Duration) -> CompletionStatus {
        let deadline = quanta::Instant::now() + timeout;
        loop {
            let status = self.status();
            if status != CompletionStatus::Pending || quanta::Instant::now() >= deadline {
                return status;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Merge `other` into this request. Requests are independent, so this
    /// returns `self` unchanged.
    pub fn group(self, other: XferRequest) -> Self {
        drop(other);
        self
    }

    pub fn transaction_id(&self) -> Option<u16> {
        self.posted.as_ref().map(|p| p.transaction_id)
    }

    /// Messages built so far.
    pub fn message_count(&self) -> usize {
        self.txn.len()
    }

    pub fn services(&self) -> &Arc<XferServices> {
        &self.services
    }
}
