//! Multiplexer session configuration

use std::time::Duration;
use tailnet_transport::{TransportError, TransportResult};

/// Session tuning shared by listeners and connectors
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Interval between keepalive pings
    pub keep_alive_interval: Duration,

    /// Close the session when no frame arrives for this long
    pub max_idle_timeout: Duration,

    /// Maximum concurrently open logical streams
    pub max_streams: usize,

    /// Buffered frames per stream before the reader waits on the consumer
    pub stream_channel_capacity: usize,

    /// Buffered outbound frames shared by all streams
    pub write_channel_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(15),
            max_idle_timeout: Duration::from_secs(60),
            max_streams: 256,
            stream_channel_capacity: 256,
            write_channel_capacity: 256,
        }
    }
}

impl MuxConfig {
    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be non-zero".to_string(),
            ));
        }
        if self.max_idle_timeout <= self.keep_alive_interval {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must exceed the keep-alive interval".to_string(),
            ));
        }
        if self.max_streams == 0 || self.stream_channel_capacity == 0 {
            return Err(TransportError::ConfigurationError(
                "Stream limits must be non-zero".to_string(),
            ));
        }
        if self.write_channel_capacity == 0 {
            return Err(TransportError::ConfigurationError(
                "Write channel capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
