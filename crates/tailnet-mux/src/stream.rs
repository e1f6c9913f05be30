//! Logical streams carried by a [`MuxSession`](crate::MuxSession)
//!
//! Messages are encoded with [`TailnetCodec`] and shipped as Data frames.
//! A Close frame ends one direction of the stream; a Reset aborts both.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tailnet_proto::{Frame, StreamId, TailnetCodec, TailnetMessage};
use tailnet_transport::{
    MessageReceiver, MessageSender, TransportError, TransportResult, TransportStream,
};
use tokio::sync::mpsc;
use tracing::trace;

use crate::session::SessionShared;

/// Events the session reader delivers to a stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset,
}

/// Sending half of a [`MuxStream`]
#[derive(Debug)]
pub struct MuxSendHalf {
    stream_id: StreamId,
    shared: Arc<SessionShared>,
    finished: bool,
}

impl MuxSendHalf {
    async fn send_frame(&self, frame: Frame) -> TransportResult<()> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared
            .frame_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl MessageSender for MuxSendHalf {
    async fn send_message(&mut self, message: &TailnetMessage) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::StreamClosed);
        }

        let encoded = TailnetCodec::encode(message)?;
        self.send_frame(Frame::data(self.stream_id, encoded)).await?;

        trace!(
            "[{}] Sent message on stream {}: {:?}",
            self.shared.connection_id,
            self.stream_id,
            message
        );
        Ok(())
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        // Ignore error if connection is already closed
        let _ = self.send_frame(Frame::close(self.stream_id)).await;
        Ok(())
    }
}

impl Drop for MuxSendHalf {
    fn drop(&mut self) {
        if !self.finished && !self.shared.closed.is_cancelled() {
            let _ = self.shared.frame_tx.try_send(Frame::close(self.stream_id));
        }
    }
}

/// Receiving half of a [`MuxStream`]
#[derive(Debug)]
pub struct MuxRecvHalf {
    stream_id: StreamId,
    rx: mpsc::Receiver<StreamEvent>,
    buffer: BytesMut,
    /// Close frame received
    finished: bool,
    /// End of stream already returned to the caller
    eof_reported: bool,
    shared: Arc<SessionShared>,
}

impl MuxRecvHalf {
    /// Error for a stream the session stopped feeding
    fn released_error(&self) -> TransportError {
        if self.shared.closed.is_cancelled() {
            TransportError::ConnectionClosed
        } else {
            // Reset for overflowing its inbound queue
            TransportError::StreamClosed
        }
    }
}

#[async_trait]
impl MessageReceiver for MuxRecvHalf {
    async fn recv_message(&mut self) -> TransportResult<Option<TailnetMessage>> {
        loop {
            if let Some(msg) = TailnetCodec::decode(&mut self.buffer)? {
                trace!(
                    "[{}] Received message on stream {}: {:?}",
                    self.shared.connection_id,
                    self.stream_id,
                    msg
                );
                return Ok(Some(msg));
            }

            if self.finished && !self.eof_reported {
                if !self.buffer.is_empty() {
                    self.buffer.clear();
                    return Err(TransportError::ProtocolError(
                        "Stream closed with incomplete message".to_string(),
                    ));
                }
                self.eof_reported = true;
                return Ok(None);
            }

            if self.eof_reported {
                // Half-closed by the peer; only a reset or session end follows
                return match self.rx.recv().await {
                    Some(StreamEvent::Reset) => Err(TransportError::StreamClosed),
                    Some(_) => continue,
                    None => Err(self.released_error()),
                };
            }

            match self.rx.recv().await {
                Some(StreamEvent::Data(data)) => self.buffer.extend_from_slice(&data),
                Some(StreamEvent::Fin) => self.finished = true,
                Some(StreamEvent::Reset) => {
                    self.finished = true;
                    self.eof_reported = true;
                    self.buffer.clear();
                    return Err(TransportError::StreamClosed);
                }
                None => {
                    // Unregistered by the session reader
                    self.finished = true;
                    self.eof_reported = true;
                    self.buffer.clear();
                    return Err(self.released_error());
                }
            }
        }
    }
}

impl Drop for MuxRecvHalf {
    fn drop(&mut self) {
        self.shared.remove_stream(self.stream_id);
    }
}

/// A logical bidirectional stream within a multiplexed session
#[derive(Debug)]
pub struct MuxStream {
    stream_id: StreamId,
    send: MuxSendHalf,
    recv: MuxRecvHalf,
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: StreamId,
        rx: mpsc::Receiver<StreamEvent>,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            stream_id,
            send: MuxSendHalf {
                stream_id,
                shared: shared.clone(),
                finished: false,
            },
            recv: MuxRecvHalf {
                stream_id,
                rx,
                buffer: BytesMut::with_capacity(8192),
                finished: false,
                eof_reported: false,
                shared,
            },
        }
    }
}

#[async_trait]
impl TransportStream for MuxStream {
    type SendHalf = MuxSendHalf;
    type RecvHalf = MuxRecvHalf;

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
        self.stream_id as u64
    }

    fn split(self) -> (Self::SendHalf, Self::RecvHalf) {
        (self.send, self.recv)
    }
}
