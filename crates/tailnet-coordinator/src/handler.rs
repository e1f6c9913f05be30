//! Coordinate stream handler
//!
//! Drives one peer's `Coordinate` stream through
//! `Connecting -> Registered -> Streaming -> Closed`. While streaming, the
//! reader runs on the calling task and applies requests to the registry; a
//! spawned writer drains the peer's update queue and request replies to the
//! wire. Both observe a child of the connection's cancellation token, and
//! the registry handle is released on every exit path.

use std::fmt;
use std::sync::Arc;
use tailnet_auth::{AuthorizedPeer, PeerAuthenticator, ResumeTokenProvider, TunnelAuthorizer};
use tailnet_proto::{
    CoordinateRequest, CoordinateResponse, Handshake, PeerUpdate, TailnetMessage,
};
use tailnet_transport::{MessageReceiver, MessageSender, TransportError, TransportStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinateError, RegistryError};
use crate::queue::UpdateQueue;
use crate::registry::{Disposition, PeerHandle, PeerRegistry};

const REPLY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Connecting,
    Registered,
    Streaming,
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Connecting => "connecting",
            StreamState::Registered => "registered",
            StreamState::Streaming => "streaming",
            StreamState::Closed => "closed",
        };
        f.write_str(name)
    }
}

enum Flow {
    Continue,
    Stop(Disposition),
}

/// Why the writer stopped
#[derive(Debug)]
enum WriterExit {
    Cancelled,
    Superseded,
    Failed(TransportError),
}

pub struct CoordinateHandler {
    registry: Arc<PeerRegistry>,
    authenticator: Arc<dyn PeerAuthenticator>,
    authorizer: Arc<dyn TunnelAuthorizer>,
    tokens: Arc<ResumeTokenProvider>,
    config: CoordinatorConfig,
}

impl CoordinateHandler {
    pub fn new(
        registry: Arc<PeerRegistry>,
        authenticator: Arc<dyn PeerAuthenticator>,
        authorizer: Arc<dyn TunnelAuthorizer>,
        tokens: Arc<ResumeTokenProvider>,
    ) -> Self {
        let config = registry.config().clone();
        Self {
            registry,
            authenticator,
            authorizer,
            tokens,
            config,
        }
    }

    /// Serve a Coordinate stream whose first message has already been read
    pub async fn handle<S>(
        &self,
        mut stream: S,
        first: CoordinateRequest,
        cancel: CancellationToken,
    ) -> Result<(), CoordinateError>
    where
        S: TransportStream + 'static,
    {
        let stream_id = stream.stream_id();
        let mut state = StreamState::Connecting;
        debug!("[{}] Coordinate stream {}", stream_id, state);

        let handshake = match first {
            CoordinateRequest::Handshake(handshake) => handshake,
            other => {
                let message = format!("expected handshake, got {}", request_name(&other));
                reject(&mut stream, &message).await;
                return Err(CoordinateError::Protocol(message));
            }
        };

        let peer = match self.authenticator.authenticate(&handshake).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!(
                    peer_id = %handshake.peer_id,
                    "[{}] Handshake authentication failed: {}",
                    stream_id, e
                );
                reject(&mut stream, &format!("authentication failed: {}", e)).await;
                return Err(e.into());
            }
        };

        let resume_token_id = self.verified_resume_token_id(&handshake);
        let handle = match self
            .registry
            .register(peer.clone(), resume_token_id.as_deref())
        {
            Ok(handle) => handle,
            Err(e) => {
                reject(&mut stream, &e.to_string()).await;
                return Err(e.into());
            }
        };

        let resume_token = match self.tokens.issue(handle.peer_id) {
            Ok(issued) => {
                if let Err(e) = self.registry.set_resume_token_id(&handle, issued.token_id) {
                    debug!(peer_id = %handle.peer_id, "Could not record resume token: {}", e);
                }
                issued.token
            }
            Err(e) => {
                // The peer can still coordinate, it just cannot resume
                warn!(peer_id = %handle.peer_id, "Failed to issue resume token: {}", e);
                String::new()
            }
        };

        let registered = CoordinateResponse::Registered {
            peer_id: handle.peer_id,
            resume_token,
            resumed: handle.resumed,
            refresh_in_secs: self.config.resume_token_refresh_interval.as_secs(),
        };
        if let Err(e) = stream
            .send_message(&TailnetMessage::CoordinateResponse(registered))
            .await
        {
            self.registry.release(&handle, Disposition::Dropped);
            return Err(e.into());
        }

        state = StreamState::Registered;
        info!(
            peer_id = %handle.peer_id,
            kind = %handle.kind,
            resumed = handle.resumed,
            "[{}] Coordinate stream {}",
            stream_id, state
        );

        let (send, mut recv) = stream.split();
        let child = cancel.child_token();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);

        let writer = tokio::spawn(write_loop(
            send,
            handle.queue().clone(),
            reply_rx,
            child.clone(),
            self.config.max_batch_size,
        ));

        state = StreamState::Streaming;
        debug!(peer_id = %handle.peer_id, "[{}] Coordinate stream {}", stream_id, state);

        let disposition = loop {
            let message = tokio::select! {
                _ = child.cancelled() => break Disposition::Dropped,
                message = recv.recv_message() => message,
            };

            match message {
                Ok(Some(TailnetMessage::CoordinateRequest(request))) => {
                    match self.apply(&handle, &peer, request, &reply_tx).await {
                        Flow::Continue => {}
                        Flow::Stop(disposition) => break disposition,
                    }
                }
                Ok(Some(other)) => {
                    let message = format!("unexpected {} on coordinate stream", other.name());
                    send_reply(&reply_tx, &handle, error_response(message)).await;
                    break Disposition::Dropped;
                }
                Ok(None) => {
                    debug!(
                        peer_id = %handle.peer_id,
                        "[{}] Peer closed coordinate stream", stream_id
                    );
                    break Disposition::Dropped;
                }
                Err(e) => {
                    debug!(
                        peer_id = %handle.peer_id,
                        "[{}] Coordinate read failed: {}", stream_id, e
                    );
                    break Disposition::Dropped;
                }
            }
        };

        drop(reply_tx);
        child.cancel();
        let exit = match writer.await {
            Ok(exit) => exit,
            Err(e) => WriterExit::Failed(TransportError::ConnectionError(e.to_string())),
        };

        self.registry.release(&handle, disposition);
        state = StreamState::Closed;
        info!(
            peer_id = %handle.peer_id,
            disposition = ?disposition,
            writer = ?exit,
            "[{}] Coordinate stream {}",
            stream_id, state
        );

        match exit {
            WriterExit::Failed(e) => Err(e.into()),
            WriterExit::Cancelled | WriterExit::Superseded => Ok(()),
        }
    }

    /// `jti` of the handshake's resume token, if it verifies and names this peer
    fn verified_resume_token_id(&self, handshake: &Handshake) -> Option<String> {
        let token = handshake.resume_token.as_deref()?;
        match self.tokens.verify(token) {
            Ok(claims) if claims.peer_id().ok() == Some(handshake.peer_id) => Some(claims.jti),
            Ok(_) => {
                warn!(
                    peer_id = %handshake.peer_id,
                    "Resume token belongs to another peer, registering fresh"
                );
                None
            }
            Err(e) => {
                debug!(
                    peer_id = %handshake.peer_id,
                    "Resume token rejected, registering fresh: {}", e
                );
                None
            }
        }
    }

    async fn apply(
        &self,
        handle: &PeerHandle,
        peer: &AuthorizedPeer,
        request: CoordinateRequest,
        replies: &mpsc::Sender<CoordinateResponse>,
    ) -> Flow {
        let result = match request {
            CoordinateRequest::UpdateSelf { node } => self.registry.update_node(handle, node),
            CoordinateRequest::AddTunnel { id } => {
                if let Err(e) = self.authorizer.authorize_tunnel(peer, id).await {
                    debug!(peer_id = %handle.peer_id, target = %id, "Tunnel refused: {}", e);
                    send_reply(replies, handle, error_response(e.to_string())).await;
                    return Flow::Continue;
                }
                self.registry.subscribe(handle, id).map(|_| ())
            }
            CoordinateRequest::RemoveTunnel { id } => {
                self.registry.unsubscribe(handle, id).map(|_| ())
            }
            CoordinateRequest::ReadyForHandshake { id } => {
                self.registry.ready_for_handshake(handle, id)
            }
            CoordinateRequest::Disconnect => {
                debug!(peer_id = %handle.peer_id, "Peer requested disconnect");
                return Flow::Stop(Disposition::Graceful);
            }
            CoordinateRequest::Handshake(_) => {
                send_reply(replies, handle, error_response("handshake already completed")).await;
                return Flow::Stop(Disposition::Dropped);
            }
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(RegistryError::StaleHandle(_)) => Flow::Stop(Disposition::Dropped),
            Err(e) => {
                send_reply(replies, handle, error_response(e.to_string())).await;
                Flow::Continue
            }
        }
    }
}

async fn write_loop<W>(
    mut send: W,
    queue: Arc<UpdateQueue<PeerUpdate>>,
    mut replies: mpsc::Receiver<CoordinateResponse>,
    cancel: CancellationToken,
    max_batch: usize,
) -> WriterExit
where
    W: MessageSender,
{
    let exit = loop {
        let response = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break WriterExit::Cancelled,
            },
            _ = cancel.cancelled() => break WriterExit::Cancelled,
            batch = queue.pop_batch(max_batch) => match batch {
                Some(updates) => CoordinateResponse::PeerUpdates(updates),
                None => {
                    let _ = send
                        .send_message(&TailnetMessage::CoordinateResponse(error_response(
                            "registration superseded",
                        )))
                        .await;
                    break WriterExit::Superseded;
                }
            },
        };

        if let Err(e) = send
            .send_message(&TailnetMessage::CoordinateResponse(response))
            .await
        {
            break WriterExit::Failed(e);
        }
    };

    cancel.cancel();
    let _ = send.finish().await;
    exit
}

async fn reject<S: TransportStream>(stream: &mut S, message: &str) {
    let _ = stream
        .send_message(&TailnetMessage::CoordinateResponse(error_response(message)))
        .await;
    let _ = stream.finish().await;
}

/// Queue a response for the writer task
async fn send_reply(
    replies: &mpsc::Sender<CoordinateResponse>,
    handle: &PeerHandle,
    response: CoordinateResponse,
) {
    if replies.send(response).await.is_err() {
        debug!(peer_id = %handle.peer_id, "Writer already stopped, reply dropped");
    }
}

fn error_response(message: impl Into<String>) -> CoordinateResponse {
    CoordinateResponse::Error {
        message: message.into(),
    }
}

fn request_name(request: &CoordinateRequest) -> &'static str {
    match request {
        CoordinateRequest::Handshake(_) => "handshake",
        CoordinateRequest::UpdateSelf { .. } => "update_self",
        CoordinateRequest::AddTunnel { .. } => "add_tunnel",
        CoordinateRequest::RemoveTunnel { .. } => "remove_tunnel",
        CoordinateRequest::ReadyForHandshake { .. } => "ready_for_handshake",
        CoordinateRequest::Disconnect => "disconnect",
    }
}
