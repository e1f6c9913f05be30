//! Multiplexed session over a single byte connection

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tailnet_proto::{Frame, FrameType, StreamId, SESSION_STREAM_ID};
use tailnet_transport::{TransportConnection, TransportError, TransportResult};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::codec::FrameCodec;
use crate::config::MuxConfig;
use crate::stream::{MuxStream, StreamEvent};

/// Pending incoming streams not yet picked up by `accept_stream`
const ACCEPT_BACKLOG: usize = 64;

/// Which end of the connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Dialed the connection; opens odd stream IDs
    Client,
    /// Accepted the connection; opens even stream IDs
    Server,
}

impl SessionRole {
    fn first_stream_id(self) -> StreamId {
        match self {
            SessionRole::Client => 1,
            SessionRole::Server => 2,
        }
    }

    /// Whether the remote end is the one that opens `stream_id`
    fn is_remote_initiated(self, stream_id: StreamId) -> bool {
        match self {
            SessionRole::Client => stream_id % 2 == 0,
            SessionRole::Server => stream_id % 2 == 1,
        }
    }
}

/// State shared between the session handle, its streams and its tasks
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) connection_id: String,
    pub(crate) frame_tx: mpsc::Sender<Frame>,
    pub(crate) closed: CancellationToken,
    streams: Mutex<HashMap<StreamId, mpsc::Sender<StreamEvent>>>,
}

impl SessionShared {
    fn streams(&self) -> MutexGuard<'_, HashMap<StreamId, mpsc::Sender<StreamEvent>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn remove_stream(&self, stream_id: StreamId) {
        self.streams().remove(&stream_id);
    }
}

/// Time of the last frame received, for idle detection
#[derive(Debug)]
struct Activity {
    started: Instant,
    last_frame_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_frame_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_frame_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_frame_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Multiplexed session
///
/// Spawns a reader, a writer and a keepalive task. The session closes when
/// the peer goes away, when no frame arrives within the idle timeout, or
/// when [`TransportConnection::close`] is called; all three cancel the
/// token returned by `closed_token`.
pub struct MuxSession {
    shared: Arc<SessionShared>,
    remote_addr: SocketAddr,
    role: SessionRole,
    max_streams: usize,
    stream_channel_capacity: usize,
    next_stream_id: AtomicU32,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("connection_id", &self.shared.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role)
            .finish()
    }
}

impl MuxSession {
    /// Wrap an established byte connection
    pub fn new<T>(io: T, remote_addr: SocketAddr, role: SessionRole, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection_id = format!("mux-{}", uuid::Uuid::new_v4().simple());
        let (read_half, write_half) = tokio::io::split(io);

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(config.write_channel_capacity);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(SessionShared {
            connection_id,
            frame_tx,
            closed: CancellationToken::new(),
            streams: Mutex::new(HashMap::new()),
        });
        let activity = Arc::new(Activity::new());

        tokio::spawn(writer_task(
            FramedWrite::new(write_half, FrameCodec),
            frame_rx,
            shared.closed.clone(),
            shared.connection_id.clone(),
        ));

        tokio::spawn(reader_task(
            FramedRead::new(read_half, FrameCodec),
            shared.clone(),
            accept_tx,
            role,
            config.clone(),
            activity.clone(),
        ));

        tokio::spawn(keepalive_task(shared.clone(), activity, config.clone()));

        debug!(
            "[{}] Session started ({:?}) with {}",
            shared.connection_id, role, remote_addr
        );

        Self {
            shared,
            remote_addr,
            role,
            max_streams: config.max_streams,
            stream_channel_capacity: config.stream_channel_capacity,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Client end of a connection this process dialed
    pub fn client<T>(io: T, remote_addr: SocketAddr, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, remote_addr, SessionRole::Client, config)
    }

    /// Server end of a connection this process accepted
    pub fn server<T>(io: T, remote_addr: SocketAddr, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, remote_addr, SessionRole::Server, config)
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Number of logical streams currently open
    pub fn active_streams(&self) -> usize {
        self.shared.streams().len()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

#[async_trait]
impl TransportConnection for MuxSession {
    type Stream = MuxStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        let (tx, rx) = mpsc::channel(self.stream_channel_capacity);
        let stream_id = {
            let mut streams = self.shared.streams();
            if streams.len() >= self.max_streams {
                return Err(TransportError::ConnectionError(format!(
                    "Stream limit of {} reached",
                    self.max_streams
                )));
            }
            // Increment by 2 to keep odd/even ownership
            let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
            streams.insert(stream_id, tx);
            stream_id
        };

        debug!("[{}] Opened stream {}", self.shared.connection_id, stream_id);
        Ok(MuxStream::new(stream_id, rx, self.shared.clone()))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let mut accept_rx = self.accept_rx.lock().await;

        let stream = tokio::select! {
            biased;
            stream = accept_rx.recv() => stream,
            _ = self.shared.closed.cancelled() => None,
        };

        if let Some(stream) = &stream {
            debug!(
                "[{}] Accepted stream {}",
                self.shared.connection_id,
                tailnet_transport::TransportStream::stream_id(stream)
            );
        }
        Ok(stream)
    }

    async fn close(&self, error_code: u32, reason: &str) {
        debug!(
            "[{}] Closing session (code {}): {}",
            self.shared.connection_id, error_code, reason
        );
        self.shared.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn connection_id(&self) -> String {
        self.shared.connection_id.clone()
    }

    fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }
}

/// Writer task - drains queued frames to the connection
async fn writer_task<W>(
    mut sink: FramedWrite<WriteHalf<W>, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    conn_id: String,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        // Queued frames win over cancellation so a final message still goes out
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.cancelled() => break,
        };

        trace!(
            "[{}] Sending frame: stream={}, type={:?}, len={}",
            conn_id,
            frame.stream_id,
            frame.frame_type,
            frame.payload.len()
        );

        let result = tokio::select! {
            biased;
            result = sink.send(frame) => result,
            _ = closed.cancelled() => break,
        };
        if let Err(e) = result {
            error!("[{}] Mux send error: {}", conn_id, e);
            break;
        }
    }

    closed.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        let _ = sink.send(Frame::go_away()).await;
        let _ = sink.close().await;
    })
    .await;

    debug!("[{}] Mux writer task ended", conn_id);
}

/// Reader task - receives frames and dispatches to streams
async fn reader_task<R>(
    mut source: FramedRead<ReadHalf<R>, FrameCodec>,
    shared: Arc<SessionShared>,
    accept_tx: mpsc::Sender<MuxStream>,
    role: SessionRole,
    config: MuxConfig,
    activity: Arc<Activity>,
) where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_id = shared.connection_id.clone();
    let mut last_remote_stream: StreamId = 0;

    loop {
        let frame = tokio::select! {
            result = source.next() => match result {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("[{}] Mux read error: {}", conn_id, e);
                    break;
                }
                None => {
                    debug!("[{}] Connection closed by peer", conn_id);
                    break;
                }
            },
            _ = shared.closed.cancelled() => break,
        };

        activity.touch();

        trace!(
            "[{}] Received frame: stream={}, type={:?}, len={}",
            conn_id,
            frame.stream_id,
            frame.frame_type,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Ping => {
                let _ = shared.frame_tx.try_send(Frame::pong(frame.payload));
            }
            FrameType::Pong => {}
            FrameType::GoAway => {
                debug!("[{}] Peer sent go-away", conn_id);
                break;
            }
            FrameType::Data if frame.stream_id == SESSION_STREAM_ID => {
                warn!("[{}] Data frame on session stream ignored", conn_id);
            }
            FrameType::Data => {
                let existing = shared.streams().get(&frame.stream_id).cloned();
                match existing {
                    Some(tx) => {
                        deliver(&shared, frame.stream_id, &tx, StreamEvent::Data(frame.payload));
                    }
                    None if role.is_remote_initiated(frame.stream_id)
                        && frame.stream_id > last_remote_stream =>
                    {
                        last_remote_stream = frame.stream_id;
                        if let Some(stream) =
                            register_incoming(&shared, &config, frame.stream_id, frame.payload)
                        {
                            if let Err(e) = accept_tx.try_send(stream) {
                                warn!(
                                    "[{}] Accept backlog unavailable ({}), resetting stream {}",
                                    conn_id, e, frame.stream_id
                                );
                                // Dropping the stream released it; tell the opener
                                let _ = shared.frame_tx.try_send(Frame::reset(frame.stream_id));
                            }
                        }
                    }
                    None => {
                        trace!(
                            "[{}] Data for released stream {} discarded, resetting",
                            conn_id,
                            frame.stream_id
                        );
                        let _ = shared.frame_tx.try_send(Frame::reset(frame.stream_id));
                    }
                }
            }
            FrameType::Close => {
                let existing = shared.streams().get(&frame.stream_id).cloned();
                if let Some(tx) = existing {
                    deliver(&shared, frame.stream_id, &tx, StreamEvent::Fin);
                }
            }
            FrameType::Reset => {
                let existing = shared.streams().remove(&frame.stream_id);
                if let Some(tx) = existing {
                    debug!("[{}] Stream {} reset by peer", conn_id, frame.stream_id);
                    // Already unregistered; a full queue still sees the sender drop
                    let _ = tx.try_send(StreamEvent::Reset);
                }
            }
        }
    }

    debug!("[{}] Mux reader task ended", conn_id);
    shared.closed.cancel();

    // Dropping the senders ends every open stream
    shared.streams().clear();
}

/// Hand an event to a stream without waiting.
///
/// The reader serves every stream of the session, so a stream whose
/// inbound queue is full is reset rather than waited on.
fn deliver(
    shared: &SessionShared,
    stream_id: StreamId,
    tx: &mpsc::Sender<StreamEvent>,
    event: StreamEvent,
) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(
                "[{}] Stream {} is not draining its inbound queue, resetting",
                shared.connection_id, stream_id
            );
            shared.remove_stream(stream_id);
            let _ = shared.frame_tx.try_send(Frame::reset(stream_id));
        }
        Err(TrySendError::Closed(_)) => shared.remove_stream(stream_id),
    }
}

fn register_incoming(
    shared: &Arc<SessionShared>,
    config: &MuxConfig,
    stream_id: StreamId,
    first_payload: bytes::Bytes,
) -> Option<MuxStream> {
    let mut streams = shared.streams();
    if streams.len() >= config.max_streams {
        warn!(
            "[{}] Stream limit reached, resetting stream {}",
            shared.connection_id, stream_id
        );
        let _ = shared.frame_tx.try_send(Frame::reset(stream_id));
        return None;
    }

    let (tx, rx) = mpsc::channel(config.stream_channel_capacity);
    // Fresh channel always has room for the first event
    let _ = tx.try_send(StreamEvent::Data(first_payload));
    streams.insert(stream_id, tx);
    drop(streams);

    Some(MuxStream::new(stream_id, rx, shared.clone()))
}

/// Keepalive task - pings the peer and enforces the idle timeout
async fn keepalive_task(shared: Arc<SessionShared>, activity: Arc<Activity>, config: MuxConfig) {
    let mut interval = tokio::time::interval(config.keep_alive_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    interval.tick().await;

    let mut nonce: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let idle = activity.idle_for();
                if idle >= config.max_idle_timeout {
                    warn!(
                        "[{}] No frames for {:?}, closing idle session",
                        shared.connection_id, idle
                    );
                    shared.closed.cancel();
                    break;
                }

                nonce = nonce.wrapping_add(1);
                if shared.frame_tx.try_send(Frame::ping(nonce)).is_err() {
                    trace!("[{}] Write queue full, skipping ping", shared.connection_id);
                }
            }
            _ = shared.closed.cancelled() => break,
        }
    }
}
