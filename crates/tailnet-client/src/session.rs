//! Typed views over open RPC streams

use std::time::Duration;
use tailnet_proto::{
    CoordinateRequest, CoordinateResponse, DerpMap, Node, PeerUpdate, TailnetMessage,
    WorkspaceUpdate,
};
use tailnet_transport::{MessageReceiver, MessageSender, TransportStream};
use uuid::Uuid;

use crate::client::ClientError;

/// Sending side of a Coordinate stream
#[derive(Debug)]
pub struct CoordinateSender<W: MessageSender> {
    send: W,
}

impl<W: MessageSender> CoordinateSender<W> {
    pub async fn send(&mut self, request: CoordinateRequest) -> Result<(), ClientError> {
        self.send
            .send_message(&TailnetMessage::CoordinateRequest(request))
            .await?;
        Ok(())
    }

    /// Publish this peer's node
    pub async fn update_node(&mut self, node: Node) -> Result<(), ClientError> {
        self.send(CoordinateRequest::UpdateSelf { node }).await
    }

    pub async fn add_tunnel(&mut self, id: Uuid) -> Result<(), ClientError> {
        self.send(CoordinateRequest::AddTunnel { id }).await
    }

    pub async fn remove_tunnel(&mut self, id: Uuid) -> Result<(), ClientError> {
        self.send(CoordinateRequest::RemoveTunnel { id }).await
    }

    pub async fn ready_for_handshake(&mut self, id: Uuid) -> Result<(), ClientError> {
        self.send(CoordinateRequest::ReadyForHandshake { id }).await
    }

    /// Leave gracefully; peers are told this peer disconnected
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.send(CoordinateRequest::Disconnect).await?;
        self.send.finish().await?;
        Ok(())
    }
}

/// Receiving side of a Coordinate stream
#[derive(Debug)]
pub struct CoordinateReceiver<R: MessageReceiver> {
    recv: R,
}

impl<R: MessageReceiver> CoordinateReceiver<R> {
    /// Next response; `None` once the coordinator ends the stream
    pub async fn recv(&mut self) -> Result<Option<CoordinateResponse>, ClientError> {
        match self.recv.recv_message().await? {
            Some(TailnetMessage::CoordinateResponse(response)) => Ok(Some(response)),
            Some(TailnetMessage::RpcError { code, message }) => {
                Err(ClientError::Rpc { code, message })
            }
            Some(other) => Err(ClientError::unexpected("coordinate response", &other)),
            None => Ok(None),
        }
    }

    /// Next batch of peer updates. A rejected request comes back as
    /// [`ClientError::Rejected`].
    pub async fn recv_updates(&mut self) -> Result<Option<Vec<PeerUpdate>>, ClientError> {
        match self.recv().await? {
            Some(CoordinateResponse::PeerUpdates(updates)) => Ok(Some(updates)),
            Some(CoordinateResponse::Error { message }) => Err(ClientError::Rejected(message)),
            Some(CoordinateResponse::Registered { .. }) => Err(ClientError::ProtocolError(
                "registered twice on one stream".to_string(),
            )),
            None => Ok(None),
        }
    }
}

/// A registered Coordinate stream
#[derive(Debug)]
pub struct CoordinateSession<S: TransportStream> {
    sender: CoordinateSender<S::SendHalf>,
    receiver: CoordinateReceiver<S::RecvHalf>,
    peer_id: Uuid,
    resume_token: String,
    resumed: bool,
    refresh_in: Duration,
}

impl<S: TransportStream> CoordinateSession<S> {
    pub(crate) fn new(
        stream: S,
        peer_id: Uuid,
        resume_token: String,
        resumed: bool,
        refresh_in: Duration,
    ) -> Self {
        let (send, recv) = stream.split();
        Self {
            sender: CoordinateSender { send },
            receiver: CoordinateReceiver { recv },
            peer_id,
            resume_token,
            resumed,
            refresh_in,
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Token to present on reconnect to reclaim this registration
    pub fn resume_token(&self) -> &str {
        &self.resume_token
    }

    /// Whether this registration reclaimed an earlier one
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// When the coordinator suggests refreshing the resume token
    pub fn refresh_in(&self) -> Duration {
        self.refresh_in
    }

    pub fn set_resume_token(&mut self, token: String) {
        self.resume_token = token;
    }

    pub async fn send(&mut self, request: CoordinateRequest) -> Result<(), ClientError> {
        self.sender.send(request).await
    }

    pub async fn update_node(&mut self, node: Node) -> Result<(), ClientError> {
        self.sender.update_node(node).await
    }

    pub async fn add_tunnel(&mut self, id: Uuid) -> Result<(), ClientError> {
        self.sender.add_tunnel(id).await
    }

    pub async fn remove_tunnel(&mut self, id: Uuid) -> Result<(), ClientError> {
        self.sender.remove_tunnel(id).await
    }

    pub async fn ready_for_handshake(&mut self, id: Uuid) -> Result<(), ClientError> {
        self.sender.ready_for_handshake(id).await
    }

    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.sender.disconnect().await
    }

    pub async fn recv(&mut self) -> Result<Option<CoordinateResponse>, ClientError> {
        self.receiver.recv().await
    }

    pub async fn recv_updates(&mut self) -> Result<Option<Vec<PeerUpdate>>, ClientError> {
        self.receiver.recv_updates().await
    }

    /// Separate halves for sending and receiving from different tasks
    pub fn split(self) -> (CoordinateSender<S::SendHalf>, CoordinateReceiver<S::RecvHalf>) {
        (self.sender, self.receiver)
    }
}

/// DERP maps pushed by the coordinator, newest last
#[derive(Debug)]
pub struct DerpMapStream<S: TransportStream> {
    stream: S,
}

impl<S: TransportStream> DerpMapStream<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self { stream }
    }

    pub async fn next(&mut self) -> Result<Option<DerpMap>, ClientError> {
        match self.stream.recv_message().await? {
            Some(TailnetMessage::DerpMap(map)) => Ok(Some(map)),
            Some(TailnetMessage::RpcError { code, message }) => {
                Err(ClientError::Rpc { code, message })
            }
            Some(other) => Err(ClientError::unexpected("DERP map", &other)),
            None => Ok(None),
        }
    }
}

#[derive(Debug)]
pub struct WorkspaceUpdateStream<S: TransportStream> {
    stream: S,
}

impl<S: TransportStream> WorkspaceUpdateStream<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self { stream }
    }

    pub async fn next(&mut self) -> Result<Option<WorkspaceUpdate>, ClientError> {
        match self.stream.recv_message().await? {
            Some(TailnetMessage::WorkspaceUpdate(update)) => Ok(Some(update)),
            Some(TailnetMessage::RpcError { code, message }) => {
                Err(ClientError::Rpc { code, message })
            }
            Some(other) => Err(ClientError::unexpected("workspace update", &other)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tailnet_proto::RpcErrorCode;
    use tailnet_transport::memory::MemoryConnection;
    use tailnet_transport::TransportConnection;

    #[tokio::test]
    async fn test_split_session_sends_and_receives() {
        let (client, server) = MemoryConnection::pair();
        let stream = client.open_stream().await.unwrap();
        let mut remote = server.accept_stream().await.unwrap().unwrap();

        let session = CoordinateSession::new(
            stream,
            Uuid::new_v4(),
            "token".to_string(),
            false,
            Duration::from_secs(60),
        );
        let (mut sender, mut receiver) = session.split();

        let agent = Uuid::new_v4();
        sender.add_tunnel(agent).await.unwrap();
        assert_eq!(
            remote.recv_message().await.unwrap(),
            Some(TailnetMessage::CoordinateRequest(
                CoordinateRequest::AddTunnel { id: agent }
            ))
        );

        remote
            .send_message(&TailnetMessage::CoordinateResponse(
                CoordinateResponse::PeerUpdates(vec![PeerUpdate::node(agent, Node::default())]),
            ))
            .await
            .unwrap();
        let updates = receiver.recv_updates().await.unwrap().unwrap();
        assert_eq!(updates[0].id, agent);

        remote
            .send_message(&TailnetMessage::CoordinateResponse(CoordinateResponse::Error {
                message: "Peer cannot open a tunnel to itself".to_string(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            receiver.recv_updates().await,
            Err(ClientError::Rejected(_))
        ));

        drop(server);
    }

    #[tokio::test]
    async fn test_derp_stream_reports_rpc_errors() {
        let (client, server) = MemoryConnection::pair();
        let stream = client.open_stream().await.unwrap();
        let mut remote = server.accept_stream().await.unwrap().unwrap();
        let mut maps = DerpMapStream::new(stream);

        remote
            .send_message(&TailnetMessage::DerpMap(DerpMap::new()))
            .await
            .unwrap();
        remote
            .send_message(&TailnetMessage::RpcError {
                code: RpcErrorCode::Internal,
                message: "boom".to_string(),
            })
            .await
            .unwrap();

        assert!(maps.next().await.unwrap().is_some());
        assert!(matches!(maps.next().await, Err(ClientError::Rpc { .. })));
    }
}
