//! Tailnet coordination service
//!
//! Tracks which agents and clients are online and relays their node
//! updates to the peers they hold tunnels with. No tunnel traffic passes
//! through here; peers use what they learn to connect directly or through
//! DERP relays.
//!
//! [`TailnetService`] serves the RPCs of one multiplexed connection,
//! [`PeerRegistry`] holds the shared state, and [`DerpMapDistributor`]
//! pushes relay topology to every connected peer.

pub mod config;
pub mod derp;
pub mod error;
pub mod handler;
pub mod health;
pub mod queue;
pub mod registry;
pub mod service;
pub mod subscriptions;
pub mod telemetry;
pub mod workspace;

pub use config::CoordinatorConfig;
pub use derp::DerpMapDistributor;
pub use error::{CoordinateError, RegistryError};
pub use handler::CoordinateHandler;
pub use health::{AgentHealth, HealthSnapshot};
pub use queue::UpdateQueue;
pub use registry::{Disposition, PeerEvent, PeerHandle, PeerRegistry};
pub use service::TailnetService;
pub use subscriptions::SubscriptionIndex;
pub use telemetry::{LoggingTelemetrySink, TelemetrySink};
pub use workspace::{InMemoryWorkspaceUpdates, WorkspaceUpdatesProvider};
