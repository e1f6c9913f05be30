//! In-process connection pairs
//!
//! Messages are handed over through channels without any encoding, which
//! makes these connections useful for exercising RPC handlers in tests and
//! for embedding a coordinator and its peers in one process.

use crate::{
    MessageReceiver, MessageSender, TransportConnection, TransportError, TransportResult,
    TransportStream,
};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tailnet_proto::TailnetMessage;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STREAM_CHANNEL_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Sending half of a [`MemoryStream`]
#[derive(Debug)]
pub struct MemorySendHalf {
    id: u64,
    tx: Option<mpsc::Sender<TailnetMessage>>,
    closed: CancellationToken,
}

#[async_trait]
impl MessageSender for MemorySendHalf {
    async fn send_message(&mut self, message: &TailnetMessage) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tokio::select! {
            result = tx.send(message.clone()) => {
                result.map_err(|_| TransportError::StreamClosed)
            }
            _ = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.tx.take().is_some() {
            debug!("[mem-{}] Stream finished", self.id);
        }
        Ok(())
    }
}

/// Receiving half of a [`MemoryStream`]
#[derive(Debug)]
pub struct MemoryRecvHalf {
    rx: mpsc::Receiver<TailnetMessage>,
    closed: CancellationToken,
    eof: bool,
}

#[async_trait]
impl MessageReceiver for MemoryRecvHalf {
    async fn recv_message(&mut self) -> TransportResult<Option<TailnetMessage>> {
        if self.eof {
            self.closed.cancelled().await;
            return Err(TransportError::ConnectionClosed);
        }

        tokio::select! {
            biased;
            msg = self.rx.recv() => {
                self.eof = msg.is_none();
                Ok(msg)
            }
            _ = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
        }
    }
}

/// One end of an in-memory logical stream
#[derive(Debug)]
pub struct MemoryStream {
    id: u64,
    send: MemorySendHalf,
    recv: MemoryRecvHalf,
}

impl MemoryStream {
    fn pair(id: u64, closed: &CancellationToken) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let make = |tx, rx| Self {
            id,
            send: MemorySendHalf {
                id,
                tx: Some(tx),
                closed: closed.clone(),
            },
            recv: MemoryRecvHalf {
                rx,
                closed: closed.clone(),
                eof: false,
            },
        };

        (make(a_tx, a_rx), make(b_tx, b_rx))
    }
}

#[async_trait]
impl TransportStream for MemoryStream {
    type SendHalf = MemorySendHalf;
    type RecvHalf = MemoryRecvHalf;

    async fn send_message(&mut self, message: &TailnetMessage) -> TransportResult<()> {
        self.send.send_message(message).await
    }

    async fn recv_message(&mut self) -> TransportResult<Option<TailnetMessage>> {
        self.recv.recv_message().await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.send.finish().await
    }

    fn stream_id(&self) -> u64 {
        self.id
    }

    fn split(self) -> (Self::SendHalf, Self::RecvHalf) {
        (self.send, self.recv)
    }
}

/// One end of an in-memory connection
///
/// Created in connected pairs by [`MemoryConnection::pair`]. Closing either
/// end closes both, like a socket would.
#[derive(Debug)]
pub struct MemoryConnection {
    id: String,
    remote_addr: SocketAddr,
    next_stream_id: Arc<AtomicU64>,
    outgoing: mpsc::Sender<MemoryStream>,
    incoming: Mutex<mpsc::Receiver<MemoryStream>>,
    closed: CancellationToken,
}

impl MemoryConnection {
    /// Create two connected ends: `(client, server)`
    pub fn pair() -> (Self, Self) {
        let closed = CancellationToken::new();
        let next_stream_id = Arc::new(AtomicU64::new(1));
        let (to_server, server_incoming) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (to_client, client_incoming) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let suffix = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let client = Self {
            id: format!("mem-client-{}", suffix),
            remote_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 2)),
            next_stream_id: next_stream_id.clone(),
            outgoing: to_server,
            incoming: Mutex::new(client_incoming),
            closed: closed.clone(),
        };
        let server = Self {
            id: format!("mem-server-{}", suffix),
            remote_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 1)),
            next_stream_id,
            outgoing: to_client,
            incoming: Mutex::new(server_incoming),
            closed,
        };

        (client, server)
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    type Stream = MemoryStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (local, remote) = MemoryStream::pair(id, &self.closed);
        self.outgoing
            .send(remote)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        Ok(local)
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => Ok(stream),
            _ = self.closed.cancelled() => Ok(None),
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        debug!(
            "[{}] Closing connection (code {}): {}",
            self.id, error_code, reason
        );
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn connection_id(&self) -> String {
        self.id.clone()
    }

    fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}
