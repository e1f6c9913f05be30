//! RPC dispatch for one multiplexed connection
//!
//! Every logical stream a peer opens carries one RPC, selected by its first
//! message. Streams run as independent tasks; all of them observe the
//! connection's closed token.

use futures::StreamExt;
use std::sync::Arc;
use tailnet_auth::{
    ClaimsAuthorizer, InsecureAuthenticator, PeerAuthenticator, ResumeTokenProvider,
    TunnelAuthorizer,
};
use tailnet_proto::{
    RefreshResumeTokenRequest, RefreshResumeTokenResponse, RpcErrorCode, RpcMethod,
    TailnetMessage, TelemetryRequest, TelemetryResponse, WorkspaceUpdatesRequest,
};
use tailnet_transport::{
    MessageReceiver, MessageSender, TransportConnection, TransportError, TransportStream,
};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::derp::DerpMapDistributor;
use crate::error::CoordinateError;
use crate::handler::CoordinateHandler;
use crate::registry::PeerRegistry;
use crate::telemetry::{LoggingTelemetrySink, TelemetrySink};
use crate::workspace::WorkspaceUpdatesProvider;

/// The coordinator's RPC surface, shared by every connection
pub struct TailnetService {
    config: CoordinatorConfig,
    registry: Arc<PeerRegistry>,
    authenticator: Arc<dyn PeerAuthenticator>,
    authorizer: Arc<dyn TunnelAuthorizer>,
    tokens: Arc<ResumeTokenProvider>,
    telemetry: Arc<dyn TelemetrySink>,
    workspace_updates: Option<Arc<dyn WorkspaceUpdatesProvider>>,
    derp: Arc<DerpMapDistributor>,
}

impl TailnetService {
    /// Service with development defaults: every handshake is trusted, the
    /// resume token secret is random and telemetry is only logged
    pub fn new(config: CoordinatorConfig) -> Self {
        let tokens = ResumeTokenProvider::with_random_secret(config.resume_token_lifetime);
        Self {
            registry: Arc::new(PeerRegistry::new(config.clone())),
            authenticator: Arc::new(InsecureAuthenticator),
            authorizer: Arc::new(ClaimsAuthorizer),
            tokens: Arc::new(tokens),
            telemetry: Arc::new(LoggingTelemetrySink::new()),
            workspace_updates: None,
            derp: Arc::new(DerpMapDistributor::default()),
            config,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn PeerAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn TunnelAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_resume_tokens(mut self, tokens: ResumeTokenProvider) -> Self {
        self.tokens = Arc::new(tokens);
        self
    }

    pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn with_workspace_updates(mut self, provider: Arc<dyn WorkspaceUpdatesProvider>) -> Self {
        self.workspace_updates = Some(provider);
        self
    }

    pub fn with_derp_distributor(mut self, derp: Arc<DerpMapDistributor>) -> Self {
        self.derp = derp;
        self
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn derp(&self) -> &Arc<DerpMapDistributor> {
        &self.derp
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn coordinate_handler(&self) -> CoordinateHandler {
        CoordinateHandler::new(
            self.registry.clone(),
            self.authenticator.clone(),
            self.authorizer.clone(),
            self.tokens.clone(),
        )
    }

    /// Serve RPC streams until the connection closes.
    ///
    /// Returns once every stream task has finished and released its peer.
    pub async fn serve_connection<C>(self: Arc<Self>, connection: Arc<C>)
    where
        C: TransportConnection + 'static,
    {
        let conn_id = connection.connection_id();
        let cancel = connection.closed_token();
        info!(
            "[{}] Serving tailnet connection from {}",
            conn_id,
            connection.remote_address()
        );

        let mut streams = JoinSet::new();
        loop {
            tokio::select! {
                accepted = connection.accept_stream() => match accepted {
                    Ok(Some(stream)) => {
                        let service = self.clone();
                        let cancel = cancel.clone();
                        let conn_id = conn_id.clone();
                        streams.spawn(async move {
                            service.serve_stream(stream, cancel, &conn_id).await;
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[{}] Failed to accept stream: {}", conn_id, e);
                        break;
                    }
                },
                Some(joined) = streams.join_next(), if !streams.is_empty() => {
                    if let Err(e) = joined {
                        warn!("[{}] Stream task failed: {}", conn_id, e);
                    }
                }
            }
        }

        // No more streams will arrive; make sure the live ones stop too
        if !connection.is_closed() {
            connection.close(0, "connection finished").await;
        }
        while let Some(joined) = streams.join_next().await {
            if let Err(e) = joined {
                warn!("[{}] Stream task failed: {}", conn_id, e);
            }
        }

        info!("[{}] Tailnet connection closed", conn_id);
    }

    /// Read a stream's first message and run the RPC it selects
    pub async fn serve_stream<S>(&self, mut stream: S, cancel: CancellationToken, conn_id: &str)
    where
        S: TransportStream + 'static,
    {
        let stream_id = stream.stream_id();
        let first = match self.read_first(&mut stream).await {
            Ok(Some(first)) => first,
            Ok(None) => {
                debug!("[{}] Stream {} closed before any request", conn_id, stream_id);
                return;
            }
            Err(e) => {
                warn!("[{}] Stream {}: {}", conn_id, stream_id, e);
                respond_error(&mut stream, RpcErrorCode::Protocol, &e.to_string()).await;
                return;
            }
        };

        let Some(method) = RpcMethod::for_first_message(&first) else {
            let message = format!("{} cannot start an RPC", first.name());
            warn!("[{}] Stream {}: {}", conn_id, stream_id, message);
            respond_error(&mut stream, RpcErrorCode::Protocol, &message).await;
            return;
        };
        debug!("[{}] Stream {}: {}", conn_id, stream_id, method);

        match first {
            TailnetMessage::CoordinateRequest(request) => {
                let handler = self.coordinate_handler();
                if let Err(e) = handler.handle(stream, request, cancel).await {
                    debug!("[{}] Coordinate stream {} ended: {}", conn_id, stream_id, e);
                }
            }
            TailnetMessage::StreamDerpMapsRequest(_) => {
                self.stream_derp_maps(stream, cancel).await;
            }
            TailnetMessage::RefreshResumeTokenRequest(request) => {
                self.refresh_resume_token(stream, request).await;
            }
            TailnetMessage::TelemetryRequest(request) => {
                self.post_telemetry(stream, request).await;
            }
            TailnetMessage::WorkspaceUpdatesRequest(request) => {
                self.workspace_updates(stream, request, cancel).await;
            }
            other => {
                // for_first_message only accepts the request variants above
                debug!("[{}] Ignoring {} on stream {}", conn_id, other.name(), stream_id);
            }
        }
    }

    async fn read_first<S: TransportStream>(
        &self,
        stream: &mut S,
    ) -> Result<Option<TailnetMessage>, CoordinateError> {
        match tokio::time::timeout(self.config.handshake_timeout, stream.recv_message()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CoordinateError::HandshakeTimeout),
        }
    }

    async fn stream_derp_maps<S: TransportStream + 'static>(
        &self,
        stream: S,
        cancel: CancellationToken,
    ) {
        let maps = self
            .derp
            .stream_for(cancel)
            .map(|map| TailnetMessage::DerpMap((*map).clone()));
        let sent = forward_until_closed(stream, maps).await;
        debug!("DERP map stream ended after {} maps", sent);
    }

    async fn refresh_resume_token<S: TransportStream>(
        &self,
        mut stream: S,
        request: RefreshResumeTokenRequest,
    ) {
        let response = match self.tokens.refresh(&request.token) {
            Ok((old, issued)) => {
                if let Ok(peer_id) = old.peer_id() {
                    self.registry
                        .adopt_resume_token(peer_id, &old.jti, &issued.token_id);
                }
                TailnetMessage::RefreshResumeTokenResponse(RefreshResumeTokenResponse {
                    token: issued.token,
                    refresh_in_secs: self.config.resume_token_refresh_interval.as_secs(),
                    expires_at: issued.expires_at,
                })
            }
            Err(e) => {
                debug!("Resume token refresh refused: {}", e);
                rpc_error(RpcErrorCode::Unauthenticated, e.to_string())
            }
        };

        let _ = stream.send_message(&response).await;
        let _ = stream.finish().await;
    }

    async fn post_telemetry<S: TransportStream>(&self, mut stream: S, request: TelemetryRequest) {
        let response = match self.telemetry.post(request).await {
            Ok(()) => TailnetMessage::TelemetryResponse(TelemetryResponse {}),
            Err(e) => {
                warn!("Telemetry sink rejected batch: {}", e);
                rpc_error(RpcErrorCode::Internal, e)
            }
        };

        let _ = stream.send_message(&response).await;
        let _ = stream.finish().await;
    }

    async fn workspace_updates<S: TransportStream + 'static>(
        &self,
        mut stream: S,
        request: WorkspaceUpdatesRequest,
        cancel: CancellationToken,
    ) {
        let Some(provider) = &self.workspace_updates else {
            respond_error(
                &mut stream,
                RpcErrorCode::Unimplemented,
                "workspace updates are not available on this coordinator",
            )
            .await;
            return;
        };

        let updates = match provider.subscribe(request.workspace_owner_id).await {
            Ok(updates) => updates,
            Err(e) => {
                respond_error(&mut stream, RpcErrorCode::Internal, &e).await;
                return;
            }
        };

        let updates = updates
            .take_until(cancel.cancelled_owned())
            .map(TailnetMessage::WorkspaceUpdate)
            .boxed();
        let sent = forward_until_closed(stream, updates).await;
        debug!(
            owner_id = %request.workspace_owner_id,
            "Workspace update stream ended after {} updates", sent
        );
    }

    /// Evict parked peers whose resume window has passed, until `shutdown`
    pub fn spawn_janitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let period = self.config.janitor_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let expired = registry.sweep_expired();
                        if !expired.is_empty() {
                            info!("Janitor evicted {} expired peer(s)", expired.len());
                        }
                    }
                }
            }
            debug!("Janitor stopped");
        })
    }
}

/// Send every item of `items` until it ends, a send fails, or the peer
/// resets the stream. A peer half-closing its side is expected and ignored.
async fn forward_until_closed<S, I>(stream: S, mut items: I) -> usize
where
    S: TransportStream,
    I: futures::Stream<Item = TailnetMessage> + Unpin,
{
    let (mut send, mut recv) = stream.split();
    let mut sent = 0;

    loop {
        tokio::select! {
            item = items.next() => {
                let Some(item) = item else { break };
                if let Err(e) = send.send_message(&item).await {
                    debug!("Stream send failed: {}", e);
                    break;
                }
                sent += 1;
            }
            incoming = recv.recv_message() => match incoming {
                Ok(Some(message)) => {
                    debug!("Ignoring {} on server-streaming RPC", message.name());
                }
                Ok(None) => {}
                Err(TransportError::StreamClosed) | Err(TransportError::ConnectionClosed) => break,
                Err(e) => {
                    debug!("Stream receive failed: {}", e);
                    break;
                }
            },
        }
    }

    let _ = send.finish().await;
    sent
}

fn rpc_error(code: RpcErrorCode, message: impl Into<String>) -> TailnetMessage {
    TailnetMessage::RpcError {
        code,
        message: message.into(),
    }
}

async fn respond_error<S: TransportStream>(stream: &mut S, code: RpcErrorCode, message: &str) {
    let _ = stream.send_message(&rpc_error(code, message)).await;
    let _ = stream.finish().await;
}
