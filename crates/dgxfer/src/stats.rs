//! # Transfer Statistics
//!
//! Per-connection and per-endpoint counters, serializable for JSON export.

use serde::Serialize;

// ─── Connection Stats ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnStats {
    /// Frames transmitted, retransmissions included.
    pub frames_sent: u64,
    /// Frames resent after the retransmit timeout.
    pub retransmissions: u64,
    /// Frames given up on after the resend cap.
    pub frames_abandoned: u64,
    /// Frames whose slot was freed by a peer ACK.
    pub frames_acked: u64,
    /// Ack-only frames sent.
    pub ack_frames_sent: u64,
    /// ACK runs received in frame headers.
    pub ack_runs_received: u64,
    /// Datagrams the transport refused.
    pub send_errors: u64,
    /// Frames handed to this connection by the receiver loop.
    pub frames_received: u64,
    /// Frames re-acknowledged without processing.
    pub duplicates: u64,
    /// Times the peer came back with a new connection epoch.
    pub peer_restarts: u64,
    /// Frames dropped because they carried a retired peer epoch.
    pub stale_frames: u64,
    pub messages_processed: u64,
    /// Payload bytes copied into local memory.
    pub bytes_copied: u64,
    pub transactions_posted: u64,
    /// Inbound transactions whose flag was written.
    pub transactions_completed: u64,
}

impl ConnStats {
    /// Retransmission overhead ratio.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.frames_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.frames_sent as f64
        }
    }
}

// ─── Endpoint Stats ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub datagrams_received: u64,
    /// Datagrams that failed to decode.
    pub malformed: u64,
    /// Frames for another mailbox or from an out-of-range one.
    pub unroutable: u64,
    /// Frames a connection rejected after decoding.
    pub rejected: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    /// Receive-path errors that stopped the endpoint.
    pub fatal_errors: u64,
}
