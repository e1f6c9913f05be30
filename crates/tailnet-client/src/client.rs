//! Connection-level client

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tailnet_mux::{MuxConfig, MuxConnector, MuxSession};
use tailnet_proto::{
    CoordinateRequest, CoordinateResponse, Handshake, RefreshResumeTokenRequest,
    RefreshResumeTokenResponse, RpcErrorCode, StreamDerpMapsRequest, TailnetMessage,
    TelemetryRequest, WorkspaceUpdatesRequest,
};
use tailnet_transport::{TransportConnection, TransportConnector, TransportError, TransportStream};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::session::{CoordinateSession, DerpMapStream, WorkspaceUpdateStream};

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Coordinator rejected request: {0}")]
    Rejected(String),

    #[error("RPC failed ({code:?}): {message}")]
    Rpc { code: RpcErrorCode, message: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Stream closed by coordinator")]
    StreamClosed,
}

impl ClientError {
    pub(crate) fn unexpected(expected: &str, got: &TailnetMessage) -> Self {
        ClientError::ProtocolError(format!("expected {}, got {}", expected, got.name()))
    }
}

/// RPC client over one transport connection
#[derive(Debug)]
pub struct TailnetClient<C: TransportConnection> {
    connection: Arc<C>,
    response_timeout: Duration,
}

impl<C: TransportConnection> Clone for TailnetClient<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            response_timeout: self.response_timeout,
        }
    }
}

impl TailnetClient<MuxSession> {
    /// Dial a coordinator over TCP and wrap the socket in a mux session
    pub async fn connect_tcp(addr: SocketAddr, config: MuxConfig) -> Result<Self, ClientError> {
        let connector = MuxConnector::new(config)?;
        let session = connector
            .connect(addr)
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        info!("Connected to coordinator at {}", addr);
        Ok(Self::new(Arc::new(session)))
    }
}

impl<C: TransportConnection> TailnetClient<C> {
    pub fn new(connection: Arc<C>) -> Self {
        Self {
            connection,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// How long to wait for the first response of any RPC
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    pub async fn close(&self) {
        self.connection.close(0, "client closed").await;
    }

    /// Open a stream and send its first message
    async fn start(&self, first: TailnetMessage) -> Result<C::Stream, ClientError> {
        let mut stream = self.connection.open_stream().await?;
        stream.send_message(&first).await?;
        Ok(stream)
    }

    async fn first_response(
        &self,
        stream: &mut C::Stream,
        what: &'static str,
    ) -> Result<TailnetMessage, ClientError> {
        let received = tokio::time::timeout(self.response_timeout, stream.recv_message())
            .await
            .map_err(|_| ClientError::Timeout(what))??;

        match received {
            Some(TailnetMessage::RpcError { code, message }) => {
                Err(ClientError::Rpc { code, message })
            }
            Some(message) => Ok(message),
            None => Err(ClientError::StreamClosed),
        }
    }

    /// Register with the coordinator and open the node-update stream
    pub async fn coordinate(
        &self,
        handshake: Handshake,
    ) -> Result<CoordinateSession<C::Stream>, ClientError> {
        let peer_id = handshake.peer_id;
        let mut stream = self
            .start(TailnetMessage::CoordinateRequest(
                CoordinateRequest::Handshake(handshake),
            ))
            .await?;

        match self.first_response(&mut stream, "registration").await? {
            TailnetMessage::CoordinateResponse(CoordinateResponse::Registered {
                peer_id: registered_id,
                resume_token,
                resumed,
                refresh_in_secs,
            }) => {
                if registered_id != peer_id {
                    return Err(ClientError::ProtocolError(format!(
                        "registered as {} but asked for {}",
                        registered_id, peer_id
                    )));
                }
                debug!(peer_id = %peer_id, resumed, "Registered with coordinator");
                Ok(CoordinateSession::new(
                    stream,
                    peer_id,
                    resume_token,
                    resumed,
                    Duration::from_secs(refresh_in_secs),
                ))
            }
            TailnetMessage::CoordinateResponse(CoordinateResponse::Error { message }) => {
                Err(ClientError::Rejected(message))
            }
            other => Err(ClientError::unexpected("registration", &other)),
        }
    }

    /// Subscribe to DERP map updates; the current map arrives first
    pub async fn stream_derp_maps(&self) -> Result<DerpMapStream<C::Stream>, ClientError> {
        let stream = self
            .start(TailnetMessage::StreamDerpMapsRequest(
                StreamDerpMapsRequest::default(),
            ))
            .await?;
        Ok(DerpMapStream::new(stream))
    }

    /// Exchange a resume token for a fresh one
    pub async fn refresh_resume_token(
        &self,
        token: impl Into<String>,
    ) -> Result<RefreshResumeTokenResponse, ClientError> {
        let mut stream = self
            .start(TailnetMessage::RefreshResumeTokenRequest(
                RefreshResumeTokenRequest {
                    token: token.into(),
                },
            ))
            .await?;

        match self.first_response(&mut stream, "resume token").await? {
            TailnetMessage::RefreshResumeTokenResponse(response) => Ok(response),
            other => Err(ClientError::unexpected("resume token", &other)),
        }
    }

    pub async fn post_telemetry(&self, request: TelemetryRequest) -> Result<(), ClientError> {
        let mut stream = self
            .start(TailnetMessage::TelemetryRequest(request))
            .await?;

        match self.first_response(&mut stream, "telemetry ack").await? {
            TailnetMessage::TelemetryResponse(_) => Ok(()),
            other => Err(ClientError::unexpected("telemetry ack", &other)),
        }
    }

    /// Follow workspace changes for an owner: a snapshot first, then deltas
    pub async fn workspace_updates(
        &self,
        workspace_owner_id: Uuid,
    ) -> Result<WorkspaceUpdateStream<C::Stream>, ClientError> {
        let stream = self
            .start(TailnetMessage::WorkspaceUpdatesRequest(
                WorkspaceUpdatesRequest { workspace_owner_id },
            ))
            .await?;
        Ok(WorkspaceUpdateStream::new(stream))
    }
}
