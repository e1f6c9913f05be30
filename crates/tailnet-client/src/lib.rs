//! Tailnet client library
//!
//! Speaks the coordinator's RPCs over any [`TransportConnection`]. Agents and
//! clients use [`TailnetClient::coordinate`] to register and exchange node
//! updates; the other calls cover DERP maps, resume tokens, telemetry and
//! workspace updates.
//!
//! [`TransportConnection`]: tailnet_transport::TransportConnection

pub mod client;
pub mod session;

pub use client::{ClientError, TailnetClient};
pub use session::{
    CoordinateReceiver, CoordinateSender, CoordinateSession, DerpMapStream, WorkspaceUpdateStream,
};

pub use tailnet_proto::{CoordinateRequest, CoordinateResponse, Handshake, Node, PeerKind};
