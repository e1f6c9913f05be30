//! The non-coordinate RPCs, and the whole service over mux sessions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tailnet_client::{ClientError, TailnetClient};
use tailnet_coordinator::{
    CoordinatorConfig, InMemoryWorkspaceUpdates, LoggingTelemetrySink, PeerEvent, TailnetService,
};
use tailnet_mux::{MuxConfig, MuxListener, MuxSession};
use tailnet_proto::{
    DerpMap, DerpNode, DerpRegion, Handshake, Node, PeerKind, PeerUpdateKind, RpcErrorCode,
    TailnetMessage, TelemetryEvent, TelemetryRequest, Workspace, WorkspaceStatus,
    WorkspaceUpdate,
};
use tailnet_transport::memory::MemoryConnection;
use tailnet_transport::{TransportConnection, TransportListener, TransportStream};
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("tailnet_coordinator=debug,tailnet_mux=debug")
        .try_init();
}

fn serve(service: &Arc<TailnetService>) -> TailnetClient<MemoryConnection> {
    let (client, server) = MemoryConnection::pair();
    tokio::spawn(service.clone().serve_connection(Arc::new(server)));
    TailnetClient::new(Arc::new(client))
}

fn handshake(peer_id: Uuid, kind: PeerKind, resume_token: Option<String>) -> Handshake {
    Handshake {
        peer_id,
        kind,
        name: kind.to_string(),
        auth_token: String::new(),
        resume_token,
    }
}

fn region(id: u16, code: &str) -> DerpRegion {
    DerpRegion {
        region_id: id,
        region_code: code.to_string(),
        region_name: code.to_uppercase(),
        nodes: vec![DerpNode {
            name: format!("{}a", id),
            region_id: id,
            host_name: format!("derp{}.example.com", id),
            ipv4: None,
            ipv6: None,
            stun_port: 3478,
            derp_port: 443,
            stun_only: false,
            can_port80: false,
            force_http: false,
        }],
        ..Default::default()
    }
}

fn workspace(name: &str, status: WorkspaceStatus) -> Workspace {
    Workspace {
        id: Uuid::new_v4(),
        name: name.to_string(),
        status,
    }
}

#[tokio::test]
async fn test_derp_map_stream_follows_updates() {
    init_tracing();
    let service = Arc::new(TailnetService::new(CoordinatorConfig::default()));
    let client = serve(&service);

    let mut maps = client.stream_derp_maps().await.unwrap();
    let first = timeout(WAIT, maps.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first.version, 1);
    assert!(first.regions.is_empty());

    let mut map = DerpMap::new();
    map.regions.insert(1, region(1, "nyc"));
    assert_eq!(service.derp().update(map.clone()), 2);

    let second = timeout(WAIT, maps.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(second.version, 2);
    assert_eq!(second.region_ids(), vec![1]);

    // Same topology again: readers are not woken
    assert_eq!(service.derp().update_if_changed(map), None);
    assert!(timeout(Duration::from_millis(50), maps.next()).await.is_err());
}

#[tokio::test]
async fn test_derp_stream_ends_with_connection() {
    init_tracing();
    let service = Arc::new(TailnetService::new(CoordinatorConfig::default()));
    let client = serve(&service);

    let mut maps = client.stream_derp_maps().await.unwrap();
    timeout(WAIT, maps.next()).await.unwrap().unwrap().unwrap();

    client.close().await;
    let ended = timeout(WAIT, maps.next()).await.unwrap();
    assert!(matches!(ended, Ok(None) | Err(ClientError::Transport(_))));
}

#[tokio::test]
async fn test_refreshed_token_resumes_registration() {
    init_tracing();
    let service = Arc::new(TailnetService::new(CoordinatorConfig::default()));
    let registry = service.registry().clone();
    let agent_id = Uuid::new_v4();

    let agent_client = serve(&service);
    let agent = agent_client
        .coordinate(handshake(agent_id, PeerKind::Agent, None))
        .await
        .unwrap();

    let refreshed = agent_client
        .refresh_resume_token(agent.resume_token())
        .await
        .unwrap();
    assert!(!refreshed.token.is_empty());
    assert_ne!(refreshed.token, agent.resume_token());
    assert_eq!(
        refreshed.refresh_in_secs,
        service.config().resume_token_refresh_interval.as_secs()
    );

    let mut events = registry.subscribe_events();
    agent_client.close().await;
    timeout(WAIT, async {
        while events.recv().await.unwrap() != (PeerEvent::Parked { peer_id: agent_id }) {}
    })
    .await
    .unwrap();

    let client = serve(&service);
    let resumed = client
        .coordinate(handshake(agent_id, PeerKind::Agent, Some(refreshed.token)))
        .await
        .unwrap();
    assert!(resumed.resumed());
}

#[tokio::test]
async fn test_refresh_rejects_garbage_token() {
    init_tracing();
    let service = Arc::new(TailnetService::new(CoordinatorConfig::default()));
    let client = serve(&service);

    let err = client.refresh_resume_token("garbage").await.unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::Rpc {
                code: RpcErrorCode::Unauthenticated,
                ..
            }
        ),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_telemetry_reaches_sink() {
    init_tracing();
    let sink = Arc::new(LoggingTelemetrySink::new());
    let service = Arc::new(
        TailnetService::new(CoordinatorConfig::default()).with_telemetry_sink(sink.clone()),
    );
    let client = serve(&service);

    let request = TelemetryRequest {
        events: vec![
            TelemetryEvent {
                id: Uuid::new_v4(),
                peer_id: Uuid::new_v4(),
                status: "connected".to_string(),
                ..Default::default()
            },
            TelemetryEvent {
                id: Uuid::new_v4(),
                peer_id: Uuid::new_v4(),
                status: "disconnected".to_string(),
                ..Default::default()
            },
        ],
    };
    client.post_telemetry(request).await.unwrap();
    assert_eq!(sink.events_received(), 2);
}

#[tokio::test]
async fn test_workspace_updates_snapshot_then_deltas() {
    init_tracing();
    let provider = Arc::new(InMemoryWorkspaceUpdates::new());
    let service = Arc::new(
        TailnetService::new(CoordinatorConfig::default()).with_workspace_updates(provider.clone()),
    );
    let client = serve(&service);
    let (owner, stranger) = (Uuid::new_v4(), Uuid::new_v4());

    let dev = workspace("dev", WorkspaceStatus::Running);
    provider.publish(
        owner,
        WorkspaceUpdate {
            upserted_workspaces: vec![dev.clone()],
            ..Default::default()
        },
    );

    let mut updates = client.workspace_updates(owner).await.unwrap();
    let snapshot = timeout(WAIT, updates.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(snapshot.upserted_workspaces, vec![dev.clone()]);

    // Other owners' changes are filtered out
    provider.publish(
        stranger,
        WorkspaceUpdate {
            upserted_workspaces: vec![workspace("other", WorkspaceStatus::Starting)],
            ..Default::default()
        },
    );
    provider.publish(
        owner,
        WorkspaceUpdate {
            deleted_workspaces: vec![dev.id],
            ..Default::default()
        },
    );

    let delta = timeout(WAIT, updates.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(delta.deleted_workspaces, vec![dev.id]);
    assert!(delta.upserted_workspaces.is_empty());
}

#[tokio::test]
async fn test_workspace_updates_unimplemented_without_provider() {
    init_tracing();
    let service = Arc::new(TailnetService::new(CoordinatorConfig::default()));
    let client = serve(&service);

    let mut updates = client.workspace_updates(Uuid::new_v4()).await.unwrap();
    let err = timeout(WAIT, updates.next()).await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ClientError::Rpc {
            code: RpcErrorCode::Unimplemented,
            ..
        }
    ));
}

#[tokio::test]
async fn test_stream_must_start_with_request() {
    init_tracing();
    let service = Arc::new(TailnetService::new(CoordinatorConfig::default()));
    let client = serve(&service);

    let mut stream = client.connection().open_stream().await.unwrap();
    stream
        .send_message(&TailnetMessage::DerpMap(DerpMap::new()))
        .await
        .unwrap();

    match timeout(WAIT, stream.recv_message()).await.unwrap().unwrap() {
        Some(TailnetMessage::RpcError { code, message }) => {
            assert_eq!(code, RpcErrorCode::Protocol);
            assert!(message.contains("cannot start an RPC"), "{}", message);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_stream_times_out() {
    init_tracing();
    let config = CoordinatorConfig::default().with_handshake_timeout(Duration::from_secs(2));
    let service = Arc::new(TailnetService::new(config));
    let client = serve(&service);

    let mut stream = client.connection().open_stream().await.unwrap();
    match stream.recv_message().await.unwrap() {
        Some(TailnetMessage::RpcError { code, message }) => {
            assert_eq!(code, RpcErrorCode::Protocol);
            assert_eq!(message, "Handshake timed out");
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(service.registry().peer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_janitor_evicts_expired_peers() {
    init_tracing();
    let config = CoordinatorConfig::default()
        .with_grace_period(Duration::from_secs(30))
        .with_janitor_interval(Duration::from_secs(5));
    let service = Arc::new(TailnetService::new(config));
    let registry = service.registry().clone();
    let shutdown = tokio_util::sync::CancellationToken::new();
    let janitor = service.spawn_janitor(shutdown.clone());

    let agent_id = Uuid::new_v4();
    let agent_client = serve(&service);
    let _agent = agent_client
        .coordinate(handshake(agent_id, PeerKind::Agent, None))
        .await
        .unwrap();

    let mut events = registry.subscribe_events();
    agent_client.close().await;

    let evicted = timeout(Duration::from_secs(60), async {
        loop {
            if let PeerEvent::Evicted { peer_id, reason } = events.recv().await.unwrap() {
                return (peer_id, reason);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(evicted, (agent_id, "resume grace period expired".to_string()));
    assert!(!registry.is_registered(agent_id));

    shutdown.cancel();
    janitor.await.unwrap();
}

fn mux_pair(service: &Arc<TailnetService>) -> TailnetClient<MuxSession> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
    let server = MuxSession::server(server_io, addr, MuxConfig::default());
    let client = MuxSession::client(client_io, addr, MuxConfig::default());
    tokio::spawn(service.clone().serve_connection(Arc::new(server)));
    TailnetClient::new(Arc::new(client))
}

#[tokio::test]
async fn test_coordinate_over_mux_sessions() {
    init_tracing();
    let service = Arc::new(TailnetService::new(CoordinatorConfig::default()));
    let (agent_id, client_id) = (Uuid::new_v4(), Uuid::new_v4());

    let agent_conn = mux_pair(&service);
    let mut agent = agent_conn
        .coordinate(handshake(agent_id, PeerKind::Agent, None))
        .await
        .unwrap();
    agent
        .update_node(Node {
            key: "nodekey:agent".to_string(),
            endpoints: vec!["10.0.0.1:41641".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

    let client_conn = mux_pair(&service);
    let mut client = client_conn
        .coordinate(handshake(client_id, PeerKind::Client, None))
        .await
        .unwrap();
    client.add_tunnel(agent_id).await.unwrap();

    let update = timeout(WAIT, async {
        loop {
            let updates = client.recv_updates().await.unwrap().unwrap();
            if let Some(update) = updates.into_iter().find(|u| u.id == agent_id) {
                return update;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(update.kind, PeerUpdateKind::Node);
    assert_eq!(update.node.unwrap().key, "nodekey:agent");

    // A DERP stream shares the connection with the coordinate stream
    let mut maps = client_conn.stream_derp_maps().await.unwrap();
    assert_eq!(
        timeout(WAIT, maps.next()).await.unwrap().unwrap().unwrap().version,
        1
    );

    // Closing the session ends the agent's stream and parks it
    agent_conn.close().await;
    timeout(WAIT, async {
        while service.registry().is_live(agent_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(service.registry().is_registered(agent_id));
}

#[tokio::test]
async fn test_tcp_listener_serves_clients() {
    init_tracing();
    let service = Arc::new(TailnetService::new(CoordinatorConfig::default()));
    let listener = MuxListener::bind("127.0.0.1:0".parse().unwrap(), MuxConfig::default())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_service = service.clone();
    tokio::spawn(async move {
        while let Ok((session, _remote)) = listener.accept().await {
            tokio::spawn(accept_service.clone().serve_connection(Arc::new(session)));
        }
    });

    let client = TailnetClient::connect_tcp(addr, MuxConfig::default())
        .await
        .unwrap();
    let peer_id = Uuid::new_v4();
    let session = client
        .coordinate(handshake(peer_id, PeerKind::Client, None))
        .await
        .unwrap();
    assert_eq!(session.peer_id(), peer_id);
    assert!(service.registry().is_live(peer_id));

    client.post_telemetry(TelemetryRequest::default()).await.unwrap();
    client.close().await;
}
