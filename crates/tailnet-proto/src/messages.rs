//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::derp::DerpMap;

/// Main tailnet protocol message enum
///
/// The first message sent on a freshly opened logical stream selects the RPC
/// that stream carries (see [`RpcMethod::for_first_message`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TailnetMessage {
    // Coordinate (bidirectional stream)
    CoordinateRequest(CoordinateRequest),
    CoordinateResponse(CoordinateResponse),

    // StreamDERPMaps (server streaming)
    StreamDerpMapsRequest(StreamDerpMapsRequest),
    DerpMap(DerpMap),

    // RefreshResumeToken (unary)
    RefreshResumeTokenRequest(RefreshResumeTokenRequest),
    RefreshResumeTokenResponse(RefreshResumeTokenResponse),

    // PostTelemetry (unary)
    TelemetryRequest(TelemetryRequest),
    TelemetryResponse(TelemetryResponse),

    // WorkspaceUpdates (server streaming)
    WorkspaceUpdatesRequest(WorkspaceUpdatesRequest),
    WorkspaceUpdate(WorkspaceUpdate),

    /// Terminal error for the RPC carried on this stream
    RpcError {
        code: RpcErrorCode,
        message: String,
    },
}

impl TailnetMessage {
    /// Short variant name for logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            TailnetMessage::CoordinateRequest(_) => "CoordinateRequest",
            TailnetMessage::CoordinateResponse(_) => "CoordinateResponse",
            TailnetMessage::StreamDerpMapsRequest(_) => "StreamDerpMapsRequest",
            TailnetMessage::DerpMap(_) => "DerpMap",
            TailnetMessage::RefreshResumeTokenRequest(_) => "RefreshResumeTokenRequest",
            TailnetMessage::RefreshResumeTokenResponse(_) => "RefreshResumeTokenResponse",
            TailnetMessage::TelemetryRequest(_) => "TelemetryRequest",
            TailnetMessage::TelemetryResponse(_) => "TelemetryResponse",
            TailnetMessage::WorkspaceUpdatesRequest(_) => "WorkspaceUpdatesRequest",
            TailnetMessage::WorkspaceUpdate(_) => "WorkspaceUpdate",
            TailnetMessage::RpcError { .. } => "RpcError",
        }
    }
}

/// RPC methods served by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    PostTelemetry,
    StreamDerpMaps,
    RefreshResumeToken,
    Coordinate,
    WorkspaceUpdates,
}

impl RpcMethod {
    /// Fully qualified method name, used for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::PostTelemetry => "/tailnet.v2.Tailnet/PostTelemetry",
            RpcMethod::StreamDerpMaps => "/tailnet.v2.Tailnet/StreamDERPMaps",
            RpcMethod::RefreshResumeToken => "/tailnet.v2.Tailnet/RefreshResumeToken",
            RpcMethod::Coordinate => "/tailnet.v2.Tailnet/Coordinate",
            RpcMethod::WorkspaceUpdates => "/tailnet.v2.Tailnet/WorkspaceUpdates",
        }
    }

    /// Determine which RPC a stream carries from its first message.
    ///
    /// Returns `None` for messages that may never open a stream (responses,
    /// errors).
    pub fn for_first_message(message: &TailnetMessage) -> Option<Self> {
        match message {
            TailnetMessage::CoordinateRequest(_) => Some(RpcMethod::Coordinate),
            TailnetMessage::StreamDerpMapsRequest(_) => Some(RpcMethod::StreamDerpMaps),
            TailnetMessage::RefreshResumeTokenRequest(_) => Some(RpcMethod::RefreshResumeToken),
            TailnetMessage::TelemetryRequest(_) => Some(RpcMethod::PostTelemetry),
            TailnetMessage::WorkspaceUpdatesRequest(_) => Some(RpcMethod::WorkspaceUpdates),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried in [`TailnetMessage::RpcError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorCode {
    /// Malformed handshake or unexpected message
    Protocol,
    /// Peer failed authentication
    Unauthenticated,
    /// Peer may not perform the request
    PermissionDenied,
    /// Peer ID already live on another connection
    AlreadyActive,
    /// Method has no backing implementation on this coordinator
    Unimplemented,
    Internal,
}

/// Kind of participant in the tailnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerKind {
    /// Workspace agent
    Agent,
    /// Client dialing into an agent
    Client,
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKind::Agent => f.write_str("agent"),
            PeerKind::Client => f.write_str("client"),
        }
    }
}

/// A peer's network reachability information
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Tailnet node ID (distinct from the peer UUID)
    pub id: i64,
    /// Time this node state was produced (unix millis)
    pub as_of: i64,
    /// WireGuard public key
    pub key: String,
    /// Disco key used for path discovery
    pub disco: String,
    /// Preferred DERP region ID
    pub preferred_derp: u16,
    /// Measured latency per DERP region name (seconds)
    pub derp_latency: BTreeMap<String, f64>,
    /// DERP regions this node forces over WebSocket, with the reason
    pub derp_forced_websocket: BTreeMap<u16, String>,
    /// Directly reachable endpoints ("ip:port")
    pub endpoints: Vec<String>,
    /// Tailnet addresses assigned to the node
    pub addresses: Vec<String>,
    /// IPs routed to this node
    pub allowed_ips: Vec<String>,
}

/// First message of a Coordinate stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    pub peer_id: Uuid,
    pub kind: PeerKind,
    /// Human-readable name for logs
    pub name: String,
    /// Credential checked by the session authentication layer
    pub auth_token: String,
    /// Token issued on a previous Coordinate stream
    pub resume_token: Option<String>,
}

/// Messages a peer sends on a Coordinate stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CoordinateRequest {
    Handshake(Handshake),
    /// Replace this peer's node
    UpdateSelf { node: Node },
    /// Subscribe to a target peer (creates a tunnel)
    AddTunnel { id: Uuid },
    /// Unsubscribe from a target peer
    RemoveTunnel { id: Uuid },
    /// Tell a tunneled peer that we are ready for its WireGuard handshake
    ReadyForHandshake { id: Uuid },
    /// Graceful goodbye; subscribers see `Disconnected` rather than `Lost`
    Disconnect,
}

/// Messages the coordinator sends on a Coordinate stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CoordinateResponse {
    /// Handshake accepted
    Registered {
        peer_id: Uuid,
        resume_token: String,
        /// Whether a previous registry record was reclaimed
        resumed: bool,
        /// Seconds after which the peer should refresh its resume token
        refresh_in_secs: u64,
    },
    PeerUpdates(Vec<PeerUpdate>),
    /// A single request was rejected; the stream stays open
    Error { message: String },
}

/// Update about one peer relayed to an interested peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerUpdate {
    pub id: Uuid,
    pub kind: PeerUpdateKind,
    pub node: Option<Node>,
    pub reason: String,
}

impl PeerUpdate {
    pub fn node(id: Uuid, node: Node) -> Self {
        Self {
            id,
            kind: PeerUpdateKind::Node,
            node: Some(node),
            reason: String::new(),
        }
    }

    pub fn disconnected(id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id,
            kind: PeerUpdateKind::Disconnected,
            node: None,
            reason: reason.into(),
        }
    }

    pub fn lost(id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id,
            kind: PeerUpdateKind::Lost,
            node: None,
            reason: reason.into(),
        }
    }

    pub fn ready_for_handshake(id: Uuid) -> Self {
        Self {
            id,
            kind: PeerUpdateKind::ReadyForHandshake,
            node: None,
            reason: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerUpdateKind {
    Node,
    Disconnected,
    Lost,
    ReadyForHandshake,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamDerpMapsRequest {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshResumeTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshResumeTokenResponse {
    pub token: String,
    /// Seconds until the peer should refresh again
    pub refresh_in_secs: u64,
    /// Expiry of the new token (unix seconds)
    pub expires_at: i64,
}

/// Connection telemetry posted by peers; opaque to the coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRequest {
    pub events: Vec<TelemetryEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub id: Uuid,
    /// Unix millis
    pub time: i64,
    pub peer_id: Uuid,
    pub status: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryResponse {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceUpdatesRequest {
    pub workspace_owner_id: Uuid,
}

/// Higher-level workspace lifecycle delta
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceUpdate {
    pub upserted_workspaces: Vec<Workspace>,
    pub upserted_agents: Vec<WorkspaceAgent>,
    pub deleted_workspaces: Vec<Uuid>,
    pub deleted_agents: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub status: WorkspaceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkspaceStatus {
    Unknown,
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Deleting,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceAgent {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
}
