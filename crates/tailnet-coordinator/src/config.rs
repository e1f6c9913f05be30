//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the registry, the Coordinate handler and the janitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a dropped peer holding a resume token stays parked
    #[serde(with = "duration_secs")]
    pub resume_grace_period: Duration,

    /// Per-peer outbound update queue capacity (oldest dropped when full)
    pub queue_capacity: usize,

    /// Maximum peer updates coalesced into one response
    pub max_batch_size: usize,

    /// Validity of each issued resume token
    #[serde(with = "duration_secs")]
    pub resume_token_lifetime: Duration,

    /// Hint sent to peers for when to refresh their resume token
    #[serde(with = "duration_secs")]
    pub resume_token_refresh_interval: Duration,

    /// Time allowed for the first message on a new stream
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// How often parked peers are swept
    #[serde(with = "duration_secs")]
    pub janitor_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            resume_grace_period: Duration::from_secs(5 * 60),
            queue_capacity: 64,
            max_batch_size: 64,
            resume_token_lifetime: Duration::from_secs(30 * 60),
            resume_token_refresh_interval: Duration::from_secs(10 * 60),
            handshake_timeout: Duration::from_secs(10),
            janitor_interval: Duration::from_secs(15),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.resume_grace_period = grace;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be at least 1".to_string());
        }
        if self.janitor_interval.is_zero() {
            return Err("janitor_interval must be non-zero".to_string());
        }
        if self.handshake_timeout.is_zero() {
            return Err("handshake_timeout must be non-zero".to_string());
        }
        if self.resume_token_refresh_interval >= self.resume_token_lifetime {
            return Err(
                "resume_token_refresh_interval must be shorter than resume_token_lifetime"
                    .to_string(),
            );
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
