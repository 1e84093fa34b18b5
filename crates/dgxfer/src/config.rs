use std::time::Duration;

use serde::Deserialize;

use crate::error::XferError;

pub const CONFIG_VERSION: u32 = 1;

/// TOML shape of [`XferConfig`]. Absent keys take defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct XferConfigInput {
    pub version: u32,
    pub retransmit_timeout_ms: Option<u64>,
    pub ack_delay_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub receive_timeout_ms: Option<u64>,
    /// `0` disables the cap.
    pub max_resends: Option<u32>,
    pub max_payload_size: Option<usize>,
    pub disconnect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XferConfig {
    pub version: u32,
    /// In-flight frames older than this are resent.
    pub retransmit_timeout: Duration,
    /// Queued ACKs wait at most this long for a frame to ride on.
    pub ack_delay: Duration,
    /// Ack/retransmit loop sleep between connections.
    pub poll_interval: Duration,
    /// Receiver loop blocking timeout.
    pub receive_timeout: Duration,
    /// Resends before a frame is abandoned; `None` retries forever.
    pub max_resends: Option<u32>,
    /// Frame budget override, clamped to what the transport supports.
    pub max_payload_size: Option<usize>,
    /// How long `disconnect` waits for the peer to acknowledge.
    pub disconnect_timeout: Duration,
}

impl Default for XferConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            retransmit_timeout: Duration::from_millis(200),
            ack_delay: Duration::from_millis(80),
            poll_interval: Duration::from_millis(2),
            receive_timeout: Duration::from_millis(100),
            max_resends: None,
            max_payload_size: None,
            disconnect_timeout: Duration::from_secs(1),
        }
    }
}

impl XferConfigInput {
    pub fn resolve(self) -> Result<XferConfig, XferError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(XferError::Config(format!(
                "Unsupported config version {}",
                version
            )));
        }

        let defaults = XferConfig::default();
        let millis = |v: Option<u64>, d: Duration| {
            v.map(|ms| Duration::from_millis(ms.max(1))).unwrap_or(d)
        };

        let max_resends = match self.max_resends {
            Some(0) => None,
            Some(n) => Some(n),
            None => defaults.max_resends,
        };

        if let Some(size) = self.max_payload_size {
            if size < crate::wire::FRAME_PREFIX_LEN + crate::wire::MSG_HEADER_LEN + 16 {
                return Err(XferError::Config(format!(
                    "max_payload_size {} too small",
                    size
                )));
            }
        }

        Ok(XferConfig {
            version,
            retransmit_timeout: millis(self.retransmit_timeout_ms, defaults.retransmit_timeout),
            ack_delay: millis(self.ack_delay_ms, defaults.ack_delay),
            poll_interval: millis(self.poll_interval_ms, defaults.poll_interval),
            receive_timeout: millis(self.receive_timeout_ms, defaults.receive_timeout),
            max_resends,
            max_payload_size: self.max_payload_size,
            disconnect_timeout: millis(self.disconnect_timeout_ms, defaults.disconnect_timeout),
        })
    }
}

impl XferConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, XferError> {
        if input.trim().is_empty() {
            return Ok(XferConfig::default());
        }
        let parsed: XferConfigInput = toml::from_str(input)
            .map_err(|e| XferError::Config(format!("Invalid config TOML: {}", e)))?;
        parsed.resolve()
    }

    /// Frame budget given the transport's limit.
    pub fn effective_payload_size(&self, transport_max: usize) -> usize {
        self.max_payload_size
            .map_or(transport_max, |size| size.min(transport_max))
    }
}
