//! Channel and connection configuration

use std::time::Duration;
use zrpc_proto::codec::MAX_FRAME_SIZE;

/// Default interval between heartbeats on an open channel
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default silence after which a channel's remote is considered lost
pub const LIVENESS_THRESHOLD: Duration = Duration::from_secs(10);

/// Default capacity of a channel's inbound queue
pub const QUEUE_CAPACITY: usize = 128;

/// Settings shared by every channel of one multiplexer
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Heartbeat emission and sweep period
    pub heartbeat_interval: Duration,
    /// Inbound queue capacity per channel
    pub queue_capacity: usize,
    /// Largest frame accepted or produced
    pub max_frame_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            queue_capacity: QUEUE_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ChannelConfig {
    /// Silence allowed before a channel is marked lost: two missed heartbeats
    pub fn liveness_threshold(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}
