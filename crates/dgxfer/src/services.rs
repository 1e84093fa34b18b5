//! # Connection State Machine
//!
//! [`XferServices`] holds everything for one ordered (local, remote) mailbox
//! pair: the frame pool, pending ACKs, duplicate history and the
//! reassembly table. All of it sits behind one lock that is held only while
//! bookkeeping; datagrams are built under the lock and sent after it is
//! released.
//!
//! Each connection stamps its frames with a random epoch. A peer that shows
//! up with a new epoch has restarted its sequence numbers, so the receive
//! state kept for the old one is discarded.
//!
//! Inbound, [`process_frame`](XferServices::process_frame) runs in order:
//!
//! 1. epoch check: frames from a retired peer epoch are dropped
//! 2. duplicate check: a processed frame seen again is re-acknowledged only
//! 3. ACK extraction: release the piggybacked run
//! 4. ack-only frames stop here
//! 5. record history, queue our ACK
//! 6. copy each message and count it against its transaction
//! 7. the last message of a transaction writes its flag

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use bytes::Bytes;
use quanta::{Clock, Instant};
use tracing::{debug, error, trace, warn};

use crate::arq::{AckQueue, AckRun, FrameHistory, FRAME_HISTORY_SIZE};
use crate::config::XferConfig;
use crate::endpoint::EndPoint;
use crate::error::XferError;
use crate::memory::SharedRegion;
use crate::pool::{FramePool, FRAME_POOL_SIZE};
use crate::stats::ConnStats;
use crate::transaction::{
    Progress, Transaction, TransactionAcks, TransactionTable, TRANSACTION_TABLE_SIZE,
};
use crate::transport::DatagramTransport;
use crate::wire::{self, Frame, FrameHeader, MsgHeader, MsgType, FRAME_PREFIX_LEN};

/// What one inbound frame did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    /// Already processed; only re-acknowledged.
    pub duplicate: bool,
    /// Local frames released by the piggybacked ACK run.
    pub frames_acked: usize,
    pub messages: usize,
    /// Transactions whose flag this frame wrote.
    pub completed: usize,
    /// Peer announced teardown.
    pub disconnect: bool,
    /// Sent under a peer epoch that has since been replaced; ignored.
    pub stale: bool,
}

/// Handle to one posted transaction.
#[derive(Debug, Clone)]
pub struct PostedTransaction {
    pub transaction_id: u16,
    pub frames: usize,
    pub acks: Arc<TransactionAcks>,
}

struct ConnState {
    pool: FramePool,
    acks: AckQueue,
    history: FrameHistory,
    table: TransactionTable,
    last_ack_send: Option<Instant>,
    next_tid: u16,
    peer_epoch: Option<u16>,
    retired_epochs: VecDeque<u16>,
    stats: ConnStats,
}

/// Replaced peer epochs remembered so their late frames can be dropped.
const RETIRED_EPOCHS: usize = 4;

pub struct XferServices {
    local_mailbox: u16,
    epoch: u16,
    remote: RwLock<EndPoint>,
    transport: Arc<dyn DatagramTransport>,
    memory: Arc<SharedRegion>,
    payload_size: usize,
    max_resends: Option<u32>,
    clock: Clock,
    state: Mutex<ConnState>,
}

impl XferServices {
    pub fn new(
        local_mailbox: u16,
        remote: EndPoint,
        transport: Arc<dyn DatagramTransport>,
        memory: Arc<SharedRegion>,
        config: &XferConfig,
        clock: Clock,
    ) -> Self {
        let payload_size = config.effective_payload_size(transport.max_payload_size());
        let epoch = rand::random::<u16>();
        let mut pool = FramePool::new(FRAME_POOL_SIZE);
        pool.set_epoch(epoch);
        XferServices {
            local_mailbox,
            epoch,
            remote: RwLock::new(remote),
            transport,
            memory,
            payload_size,
            max_resends: config.max_resends,
            clock,
            state: Mutex::new(ConnState {
                pool,
                acks: AckQueue::new(),
                history: FrameHistory::new(FRAME_HISTORY_SIZE),
                table: TransactionTable::new(TRANSACTION_TABLE_SIZE),
                last_ack_send: None,
                next_tid: 1,
                peer_epoch: None,
                retired_epochs: VecDeque::with_capacity(RETIRED_EPOCHS),
                stats: ConnStats::default(),
            }),
        }
    }

    /// Replace the randomly chosen epoch. Only meaningful before the first
    /// frame goes out.
    pub fn with_epoch(mut self, epoch: u16) -> Self {
        self.epoch = epoch;
        self.state
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .pool
            .set_epoch(epoch);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn local_mailbox(&self) -> u16 {
        self.local_mailbox
    }

    /// Epoch stamped on every outbound frame.
    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    pub fn remote(&self) -> EndPoint {
        self.remote.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn remote_mailbox(&self) -> u16 {
        self.remote.read().unwrap_or_else(|e| e.into_inner()).mailbox
    }

    /// Replace the peer's endpoint, e.g. once its full naming string is known.
    pub fn set_remote(&self, remote: EndPoint) {
        *self.remote.write().unwrap_or_else(|e| e.into_inner()) = remote;
    }

    pub fn memory(&self) -> &Arc<SharedRegion> {
        &self.memory
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Frame budget in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Largest chunk one message may carry.
    pub fn max_message_payload(&self) -> usize {
        wire::max_message_payload(self.payload_size)
    }

    pub fn stats(&self) -> ConnStats {
        self.lock().stats.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().pool.in_flight()
    }

    pub fn pending_acks(&self) -> usize {
        self.lock().acks.len()
    }

    pub fn open_transactions(&self) -> usize {
        self.lock().table.open()
    }

    // ─── Sending ────────────────────────────────────────────────────────

    /// Pack a finalized transaction into frames and send them.
    ///
    /// Source bytes and the flag value are read from local memory now. Either
    /// every frame is taken from the pool or none is.
    pub fn post_transaction(&self, txn: &Transaction) -> Result<PostedTransaction, XferError> {
        let flag = txn.flag().ok_or(XferError::MissingFlagTransfer)?;
        let flag_value = self.memory.read_u32(flag.src_offset as usize)?;
        let payloads = txn
            .messages()
            .iter()
            .map(|m| {
                if m.msg_type.carries_payload() && m.len > 0 {
                    self.memory.read(m.src_offset as usize, m.len as usize)
                } else {
                    Ok(Vec::new())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let groups = self.plan_frames(txn)?;
        let num_msgs = txn.wire_count();
        let dest_id = self.remote_mailbox();
        let now = self.clock.now();

        let (posted, datagrams) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.pool.can_acquire(groups.len())?;

            let tid = st.next_tid;
            st.next_tid = st.next_tid.wrapping_add(1);
            let acks = Arc::new(TransactionAcks::new(txn.len() as u32));

            let mut datagrams = Vec::with_capacity(groups.len());
            let mut msg_sequence = 0u16;
            for group in &groups {
                let run = st.acks.pop_run();
                if run.is_some() {
                    st.last_ack_send = Some(now);
                }
                let slot = st.pool.acquire(self.payload_size)?;
                slot.set_route(self.local_mailbox, dest_id);
                slot.set_acks(run);
                slot.set_owner(acks.clone());
                for idx in group.clone() {
                    let m = &txn.messages()[idx];
                    let header = MsgHeader {
                        msg_type: m.msg_type,
                        next_msg: true,
                        transaction_id: tid,
                        num_msgs,
                        msg_sequence,
                        data_addr: m.dst_offset,
                        data_len: m.len,
                        flag_addr: flag.dst_offset,
                        flag_value,
                    };
                    slot.push_message(header, &payloads[idx]);
                    msg_sequence = msg_sequence.wrapping_add(1);
                }
                slot.seal();
                trace!(seq = slot.seq(), tid, msgs = slot.msg_count(), "frame posted");
                datagrams.push(slot.stamp(now));
            }

            st.stats.frames_sent += datagrams.len() as u64;
            st.stats.transactions_posted += 1;
            debug!(
                tid,
                frames = datagrams.len(),
                messages = txn.len(),
                mailbox = dest_id,
                "transaction posted"
            );
            (
                PostedTransaction {
                    transaction_id: tid,
                    frames: groups.len(),
                    acks,
                },
                datagrams,
            )
        };

        for datagram in &datagrams {
            self.transmit(datagram);
        }
        Ok(posted)
    }

    /// Frames `txn` would occupy if posted now.
    pub fn frames_needed(&self, txn: &Transaction) -> Result<usize, XferError> {
        Ok(self.plan_frames(txn)?.len())
    }

    /// Most frames one transaction may span.
    pub fn max_transaction_frames(&self) -> usize {
        FRAME_POOL_SIZE
    }

    /// Longest single data copy one transaction can carry.
    pub fn max_transaction_bytes(&self) -> u64 {
        self.max_message_payload() as u64 * FRAME_POOL_SIZE as u64
    }

    /// Group message indices into frames, starting a new frame whenever the
    /// next message would not fit.
    fn plan_frames(&self, txn: &Transaction) -> Result<Vec<std::ops::Range<usize>>, XferError> {
        let budget = self.payload_size.saturating_sub(FRAME_PREFIX_LEN);
        let mut groups = Vec::new();
        let mut start = 0;
        let mut used = 0;
        for (idx, m) in txn.messages().iter().enumerate() {
            let need = wire::encoded_message_len(m.len as usize);
            if need > budget {
                return Err(XferError::Malformed("message exceeds frame budget"));
            }
            if used + need > budget {
                groups.push(start..idx);
                start = idx;
                used = 0;
            }
            used += need;
        }
        if start < txn.len() {
            groups.push(start..txn.len());
        }
        Ok(groups)
    }

    /// Tell the peer this connection is going away. The frame is
    /// retransmitted like any other; the returned handle completes once the
    /// peer has acknowledged it.
    pub fn post_disconnect(&self) -> Result<PostedTransaction, XferError> {
        let dest_id = self.remote_mailbox();
        let now = self.clock.now();
        let acks = Arc::new(TransactionAcks::new(1));
        let datagram = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let run = st.acks.pop_run();
            if run.is_some() {
                st.last_ack_send = Some(now);
            }
            let slot = st.pool.acquire(self.payload_size)?;
            slot.set_route(self.local_mailbox, dest_id);
            slot.set_acks(run);
            slot.set_owner(acks.clone());
            slot.push_message(
                MsgHeader {
                    msg_type: MsgType::Disconnect,
                    next_msg: false,
                    transaction_id: 0,
                    num_msgs: 0,
                    msg_sequence: 0,
                    data_addr: 0,
                    data_len: 0,
                    flag_addr: 0,
                    flag_value: 0,
                },
                &[],
            );
            slot.seal();
            debug!(seq = slot.seq(), mailbox = dest_id, "disconnect posted");
            let datagram = slot.stamp(now);
            st.stats.frames_sent += 1;
            datagram
        };
        self.transmit(&datagram);
        Ok(PostedTransaction {
            transaction_id: 0,
            frames: 1,
            acks,
        })
    }

    /// Hand one datagram to the transport. Failures are counted and logged;
    /// the retransmit loop covers anything that did not go out.
    fn transmit(&self, datagram: &Bytes) {
        let result = {
            let remote = self.remote.read().unwrap_or_else(|e| e.into_inner());
            self.transport.send_to(datagram, &remote)
        };
        if let Err(e) = result {
            warn!(
                mailbox = self.local_mailbox,
                len = datagram.len(),
                error = %e,
                "datagram send failed"
            );
            self.lock().stats.send_errors += 1;
        }
    }

    // ─── ACK Bookkeeping ────────────────────────────────────────────────

    /// Release `count` consecutive local frames starting at `start`.
    pub fn ack(&self, count: u8, start: u16) -> usize {
        let mut st = self.lock();
        Self::release_run(&mut st, AckRun { start, count })
    }

    fn release_run(st: &mut ConnState, run: AckRun) -> usize {
        let released = run.seqs().filter(|&seq| st.pool.release(seq)).count();
        if released < run.count as usize {
            debug!(
                start = run.start,
                count = run.count,
                released,
                "ACK run covered frames no longer in flight"
            );
        }
        st.stats.frames_acked += released as u64;
        released
    }

    /// Fail every transaction still waiting on this connection's frames.
    pub fn abandon_in_flight(&self) -> usize {
        let mut st = self.lock();
        let abandoned = st.pool.abandon_all();
        st.stats.frames_abandoned += abandoned as u64;
        abandoned
    }

    /// Queue an ACK for an inbound frame.
    pub fn add_frame_ack(&self, header: &FrameHeader) {
        self.lock().acks.push(header.frame_seq);
    }

    /// Resend every in-flight frame last sent more than `timeout` before
    /// `now`. Returns the number of frames resent.
    ///
    /// With a resend cap configured, frames past it are abandoned and their
    /// transaction fails. The peer is not told: if it saw part of that
    /// transaction, its reassembly record stays open, and the transaction id
    /// that next maps onto the same record is a fatal collision there.
    pub fn check_acks(&self, now: Instant, timeout: Duration) -> usize {
        let datagrams = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let mut datagrams = Vec::new();
            for seq in st.pool.overdue(now, timeout) {
                let resends = st.pool.bump_resends(seq).unwrap_or(0);
                if self.max_resends.is_some_and(|max| resends > max) {
                    error!(
                        seq,
                        resends,
                        mailbox = self.remote_mailbox(),
                        "frame exceeded resend cap, abandoning"
                    );
                    st.pool.abandon(seq);
                    st.stats.frames_abandoned += 1;
                    continue;
                }
                let run = st.acks.pop_run();
                if run.is_some() {
                    st.last_ack_send = Some(now);
                }
                if let Some(slot) = st.pool.get_mut(seq) {
                    slot.set_acks(run);
                    debug!(seq, resends, "retransmitting frame");
                    datagrams.push(slot.stamp(now));
                }
            }
            st.stats.retransmissions += datagrams.len() as u64;
            st.stats.frames_sent += datagrams.len() as u64;
            datagrams
        };

        for datagram in &datagrams {
            self.transmit(datagram);
        }
        datagrams.len()
    }

    /// Flush queued ACKs in ack-only frames once the last ACK sent is older
    /// than `timeout`. Returns the number of ack-only frames sent.
    pub fn send_acks(&self, now: Instant, timeout: Duration) -> usize {
        self.drain_acks(now, Some(timeout))
    }

    /// Send every queued ACK now, ignoring the batching delay.
    pub fn flush_acks(&self, now: Instant) -> usize {
        self.drain_acks(now, None)
    }

    fn drain_acks(&self, now: Instant, delay: Option<Duration>) -> usize {
        let datagrams = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.acks.is_empty() {
                return 0;
            }
            // No ACK sent yet on this connection: the first batch goes at once.
            if let (Some(delay), Some(last)) = (delay, st.last_ack_send) {
                if now.saturating_duration_since(last) <= delay {
                    return 0;
                }
            }
            let dest_id = self.remote_mailbox();
            let mut datagrams = Vec::new();
            while !st.acks.is_empty() {
                let slot = match st.pool.acquire(self.payload_size) {
                    Ok(slot) => slot,
                    Err(e) => {
                        // Retransmissions carry the queued ACKs instead.
                        debug!(error = %e, "no frame free for ACKs");
                        break;
                    }
                };
                let seq = slot.seq();
                slot.set_route(self.local_mailbox, dest_id);
                slot.set_acks(st.acks.pop_run());
                datagrams.push(slot.stamp(now));
                // Nothing acknowledges an ack-only frame.
                st.pool.release(seq);
            }
            if !datagrams.is_empty() {
                st.last_ack_send = Some(now);
            }
            st.stats.ack_frames_sent += datagrams.len() as u64;
            st.stats.frames_sent += datagrams.len() as u64;
            datagrams
        };

        for datagram in &datagrams {
            self.transmit(datagram);
        }
        datagrams.len()
    }

    // ─── Receiving ──────────────────────────────────────────────────────

    /// Process one inbound frame addressed to this connection.
    pub fn process_frame(&self, frame: &Frame) -> Result<FrameOutcome, XferError> {
        let header = frame.header;
        let seq = header.frame_seq;
        let mut outcome = FrameOutcome::default();

        let mut guard = self.lock();
        let st = &mut *guard;
        st.stats.frames_received += 1;

        if !Self::observe_epoch(st, header.epoch) {
            debug!(seq, epoch = header.epoch, "frame from retired peer epoch dropped");
            st.stats.stale_frames += 1;
            outcome.stale = true;
            return Ok(outcome);
        }

        if st.history.is_duplicate(seq) {
            debug!(seq, mailbox = header.src_id, "duplicate frame, re-acknowledging");
            st.stats.duplicates += 1;
            st.acks.push(seq);
            outcome.duplicate = true;
            return Ok(outcome);
        }

        if header.ack_count > 0 {
            st.stats.ack_runs_received += 1;
            outcome.frames_acked = Self::release_run(
                st,
                AckRun {
                    start: header.ack_start,
                    count: header.ack_count,
                },
            );
        }

        if !header.has_messages() || frame.messages.is_empty() {
            st.history.record(seq, false);
            return Ok(outcome);
        }

        // Nothing is committed until every message is known to land.
        self.validate(frame, &st.table)?;

        st.history.record(seq, true);
        st.acks.push(seq);

        for msg in &frame.messages {
            let h = &msg.header;
            if h.msg_type == MsgType::Disconnect {
                outcome.disconnect = true;
                continue;
            }
            if h.num_msgs != 0 && h.msg_type.carries_payload() && !msg.payload.is_empty() {
                self.memory.write(h.data_addr as usize, &msg.payload)?;
                st.stats.bytes_copied += msg.payload.len() as u64;
            }
            st.stats.messages_processed += 1;
            outcome.messages += 1;

            let complete = match h.num_msgs {
                0 => true,
                expected => {
                    st.table.record_message(h.transaction_id, expected)? == Progress::Complete
                }
            };
            if complete {
                self.memory.write_u32(h.flag_addr as usize, h.flag_value)?;
                st.stats.transactions_completed += 1;
                outcome.completed += 1;
                debug!(
                    tid = h.transaction_id,
                    flag_addr = h.flag_addr,
                    "transaction complete"
                );
            }
        }

        trace!(seq, messages = outcome.messages, "frame processed");
        Ok(outcome)
    }

    /// Follow the peer's epoch. Returns `false` for a frame sent under an
    /// epoch the peer has already replaced.
    fn observe_epoch(st: &mut ConnState, epoch: u16) -> bool {
        match st.peer_epoch {
            Some(current) if current == epoch => true,
            _ if st.retired_epochs.contains(&epoch) => false,
            None => {
                st.peer_epoch = Some(epoch);
                true
            }
            Some(current) => {
                debug!(old = current, new = epoch, "peer restarted, resetting receive state");
                st.history = FrameHistory::new(FRAME_HISTORY_SIZE);
                st.table = TransactionTable::new(TRANSACTION_TABLE_SIZE);
                st.acks = AckQueue::new();
                if st.retired_epochs.len() == RETIRED_EPOCHS {
                    st.retired_epochs.pop_front();
                }
                st.retired_epochs.push_back(current);
                st.peer_epoch = Some(epoch);
                st.stats.peer_restarts += 1;
                true
            }
        }
    }

    fn validate(&self, frame: &Frame, table: &TransactionTable) -> Result<(), XferError> {
        for msg in &frame.messages {
            let h = &msg.header;
            if h.msg_type == MsgType::Disconnect {
                continue;
            }
            if h.num_msgs != 0 && h.msg_type.carries_payload() {
                self.memory.check(h.data_addr as u64, h.data_len as u64)?;
            }
            self.memory.check(h.flag_addr as u64, 4)?;
            if h.num_msgs != 0 {
                table.check(h.transaction_id)?;
            }
        }
        Ok(())
    }
}
