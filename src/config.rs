//! Broker tuning knobs.

use std::time::Duration;

use crate::bridge::DEFAULT_BUFFER_SIZE;
use crate::protocol::DEFAULT_MAX_LINE_LEN;

/// Settings shared by every session a broker runs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Deadline for the identification line. Default: 30 seconds.
    pub identification_timeout: Duration,
    /// Deadline of each keep-alive read on an idle provider. A single expiry
    /// only means the provider is quiet; EOF or an error means it is gone.
    /// Default: 30 seconds.
    pub keepalive_interval: Duration,
    /// Consecutive silent keep-alive intervals after which a waiting
    /// provider is treated as dead and dropped. A dead peer is unregistered
    /// within `keepalive_interval * max_missed_keepalives`. Values below 1
    /// count as 1. Default: 4.
    pub max_missed_keepalives: u32,
    /// Copy buffer per bridge direction. Default: 4096 bytes.
    pub buffer_size: usize,
    /// Longest accepted control line. Default: 1024 bytes.
    pub max_line_len: usize,
    /// Bytes an idle provider may send before it is claimed; they are held
    /// for the consumer. Exceeding this drops the provider. Default: 64 KiB.
    pub max_pending_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            identification_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            max_missed_keepalives: 4,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_pending_bytes: 64 * 1024,
        }
    }
}

impl BrokerConfig {
    /// Set the identification deadline.
    pub fn with_identification_timeout(mut self, d: Duration) -> Self {
        self.identification_timeout = d;
        self
    }

    /// Set the keep-alive read deadline.
    pub fn with_keepalive_interval(mut self, d: Duration) -> Self {
        self.keepalive_interval = d;
        self
    }

    /// Set how many silent keep-alive intervals a provider may miss.
    pub fn with_max_missed_keepalives(mut self, n: u32) -> Self {
        self.max_missed_keepalives = n;
        self
    }

    /// Set the bridge buffer size.
    pub fn with_buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    /// Set the control line limit.
    pub fn with_max_line_len(mut self, n: usize) -> Self {
        self.max_line_len = n;
        self
    }

    /// Set the idle provider pending-byte limit.
    pub fn with_max_pending_bytes(mut self, n: usize) -> Self {
        self.max_pending_bytes = n;
        self
    }
}
