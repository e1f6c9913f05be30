//! Transport abstraction layer for tailnet RPC streams
//!
//! The coordinator and client only see logical, message-oriented streams
//! opened over a connection. How those streams are carried (a frame
//! multiplexer over TCP, an in-memory pair in tests) is the business of the
//! implementing crate.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        tailnet-coordinator / tailnet-client              │
//! └─────────────────────────────────────────────────────────┘
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            tailnet-transport (this crate)                │
//! │  - TransportListener    - TransportConnection            │
//! │  - TransportStream      - TransportConnector             │
//! └─────────────────────────────────────────────────────────┘
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ tailnet-mux (TCP)        │ memory (in-process pairs)    │
//! └──────────────────────────┴──────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use tailnet_proto::TailnetMessage;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod memory;

pub use memory::{MemoryConnection, MemoryStream};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl From<tailnet_proto::CodecError> for TransportError {
    fn from(err: tailnet_proto::CodecError) -> Self {
        TransportError::ProtocolError(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of a logical stream
#[async_trait]
pub trait MessageSender: Send + Sync + Debug {
    /// Send a message on this stream
    async fn send_message(&mut self, message: &TailnetMessage) -> TransportResult<()>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;
}

/// Receiving half of a logical stream
#[async_trait]
pub trait MessageReceiver: Send + Sync + Debug {
    /// Receive a message from this stream
    ///
    /// Returns `None` once the remote side finished the stream. Calls after
    /// that wait until the stream is reset or the connection closes, and
    /// then return an error.
    async fn recv_message(&mut self) -> TransportResult<Option<TailnetMessage>>;
}

/// A bidirectional message stream over a transport connection
#[async_trait]
pub trait TransportStream: Send + Sync + Debug {
    type SendHalf: MessageSender + 'static;
    type RecvHalf: MessageReceiver + 'static;

    /// Send a message on this stream
    async fn send_message(&mut self, message: &TailnetMessage) -> TransportResult<()>;

    /// Receive a message from this stream
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    async fn recv_message(&mut self) -> TransportResult<Option<TailnetMessage>>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;

    /// Get the stream ID (unique within this connection)
    fn stream_id(&self) -> u64;

    /// Split into independently owned halves so reading and writing can run
    /// on separate tasks
    fn split(self) -> (Self::SendHalf, Self::RecvHalf);
}

/// A transport connection that can carry many logical streams
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    /// The stream type created by this connection
    type Stream: TransportStream + 'static;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection
    ///
    /// # Arguments
    /// * `error_code` - Application-specific error code (0 for normal closure)
    /// * `reason` - Human-readable reason for closure
    async fn close(&self, error_code: u32, reason: &str);

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get the remote peer address
    fn remote_address(&self) -> SocketAddr;

    /// Get a unique stable identifier for this connection, for logging
    fn connection_id(&self) -> String;

    /// Token cancelled once the connection is closed for any reason
    /// (local close, remote close, idle timeout)
    fn closed_token(&self) -> CancellationToken;
}

/// Server-side: accepts incoming transport connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// The connection type accepted by this listener
    type Connection: TransportConnection;

    /// Accept an incoming connection
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;
}

/// Client-side: establishes outgoing transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// The connection type created by this connector
    type Connection: TransportConnection;

    /// Connect to a remote coordinator
    async fn connect(&self, addr: SocketAddr) -> TransportResult<Self::Connection>;
}
