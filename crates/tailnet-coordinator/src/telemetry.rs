//! Telemetry pass-through

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tailnet_proto::TelemetryRequest;
use tracing::debug;

/// Destination for `PostTelemetry` batches
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn post(&self, request: TelemetryRequest) -> Result<(), String>;
}

/// Logs each event at debug level and counts them
#[derive(Debug, Default)]
pub struct LoggingTelemetrySink {
    events_received: AtomicU64,
}

impl LoggingTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TelemetrySink for LoggingTelemetrySink {
    async fn post(&self, request: TelemetryRequest) -> Result<(), String> {
        for event in &request.events {
            debug!(
                event_id = %event.id,
                peer_id = %event.peer_id,
                status = %event.status,
                "Telemetry event"
            );
        }
        self.events_received
            .fetch_add(request.events.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
