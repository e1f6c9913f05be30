//! Coordinator error types

use tailnet_auth::AuthError;
use tailnet_transport::TransportError;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by [`PeerRegistry`](crate::PeerRegistry) operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Peer {0} is already connected")]
    AlreadyActive(Uuid),

    #[error("Peer cannot open a tunnel to itself")]
    SelfTunnel,

    #[error("No tunnel between {0} and {1}")]
    NoTunnel(Uuid, Uuid),

    /// The handle no longer owns the record: it was superseded by a newer
    /// connection, parked or evicted
    #[error("Registration for peer {0} is no longer current")]
    StaleHandle(Uuid),
}

/// Errors that end a Coordinate stream
#[derive(Debug, Error)]
pub enum CoordinateError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Registration rejected: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake timed out")]
    HandshakeTimeout,
}
