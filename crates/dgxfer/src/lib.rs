//! # dgxfer
//!
//! Reliable one-sided "put with completion" over an unreliable datagram
//! transport. A request copies local memory ranges into a peer's memory and,
//! once every byte has landed, writes a 32-bit completion flag there.
//!
//! Frames carry 16-bit wrapping sequence numbers, ACKs travel as coalesced
//! runs piggybacked on outgoing frames, unacknowledged frames are resent on a
//! fixed timer, and duplicates are re-acknowledged without being reprocessed.
//!
//! ## Crate structure
//!
//! - [`wire`]: Frame and message headers, encode/decode
//! - [`pool`]: Sequence-indexed ring and the per-connection frame pool
//! - [`arq`]: Pending-ACK queue and duplicate history
//! - [`transaction`]: Sender transactions and receiver reassembly table
//! - [`services`]: Per-connection state machine
//! - [`request`]: Caller-facing copy/post/status API
//! - [`endpoint`]: Naming strings, local endpoint and its threads
//! - [`transport`]: Datagram transports (UDP, in-memory)
//! - [`memory`]: Endpoint memory region
//! - [`config`]: Timers and limits, TOML loading
//! - [`stats`]: Connection and endpoint counters
//! - [`error`]: Error type

pub mod arq;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod pool;
pub mod request;
pub mod services;
pub mod stats;
pub mod transaction;
pub mod transport;
pub mod wire;

pub use config::XferConfig;
pub use endpoint::{EndPoint, LocalEndpoint};
pub use error::XferError;
pub use request::{CompletionStatus, CopyKind, XferRequest};
pub use services::XferServices;
pub use transport::{DatagramTransport, MemoryNetwork, UdpTransport};
