//! Coordinate streams end to end: registration, node relay, eviction and resume

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tailnet_auth::{JwtAuthenticator, JwtValidator, PeerClaims};
use tailnet_client::{ClientError, CoordinateSession, TailnetClient};
use tailnet_coordinator::{CoordinatorConfig, PeerEvent, TailnetService};
use tailnet_proto::{Handshake, Node, PeerKind, PeerUpdate, PeerUpdateKind};
use tailnet_transport::memory::MemoryConnection;
use tailnet_transport::TransportStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("tailnet_coordinator=debug")
        .try_init();
}

struct Harness {
    service: Arc<TailnetService>,
    // The coordinator tears a connection down once its peer drops it
    clients: Mutex<Vec<TailnetClient<MemoryConnection>>>,
}

impl Harness {
    fn new(config: CoordinatorConfig) -> Self {
        Self::with_service(TailnetService::new(config))
    }

    fn with_service(service: TailnetService) -> Self {
        Self {
            service: Arc::new(service),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// New in-memory connection served by the coordinator, open until the
    /// harness is dropped or the client closes it
    fn connect(&self) -> TailnetClient<MemoryConnection> {
        let (client, server) = MemoryConnection::pair();
        tokio::spawn(self.service.clone().serve_connection(Arc::new(server)));
        let client = TailnetClient::new(Arc::new(client));
        self.clients.lock().unwrap().push(client.clone());
        client
    }
}

fn handshake(peer_id: Uuid, kind: PeerKind) -> Handshake {
    Handshake {
        peer_id,
        kind,
        name: format!("{}-{}", kind, &peer_id.to_string()[..8]),
        auth_token: String::new(),
        resume_token: None,
    }
}

fn node(endpoint: &str) -> Node {
    Node {
        key: format!("nodekey:{}", endpoint),
        endpoints: vec![endpoint.to_string()],
        ..Default::default()
    }
}

/// Read batches until one carries an update matching `matches`
async fn wait_for<S, F>(session: &mut CoordinateSession<S>, mut matches: F) -> PeerUpdate
where
    S: TransportStream,
    F: FnMut(&PeerUpdate) -> bool,
{
    timeout(WAIT, async {
        loop {
            let updates = session
                .recv_updates()
                .await
                .expect("coordinate stream failed")
                .expect("coordinate stream ended");
            if let Some(update) = updates.into_iter().find(|u| matches(u)) {
                return update;
            }
        }
    })
    .await
    .expect("timed out waiting for peer update")
}

/// Read until the coordinator rejects a request, returning its message
async fn wait_for_rejection<S: TransportStream>(session: &mut CoordinateSession<S>) -> String {
    timeout(WAIT, async {
        loop {
            match session.recv_updates().await {
                Ok(Some(_)) => continue,
                Err(ClientError::Rejected(message)) => return message,
                other => panic!("expected a rejection, got {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for rejection")
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<PeerEvent>,
    matches: impl Fn(&PeerEvent) -> bool,
) {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for registry event")
}

fn is_node(peer: Uuid, endpoint: &'static str) -> impl Fn(&PeerUpdate) -> bool {
    move |u: &PeerUpdate| {
        u.id == peer
            && u.kind == PeerUpdateKind::Node
            && u.node.as_ref().map_or(false, |n| n.endpoints == [endpoint])
    }
}

/// Wait until `count` live clients hold tunnels to `agent_id`
async fn wait_for_clients(harness: &Harness, agent_id: Uuid, count: usize) {
    timeout(WAIT, async {
        loop {
            let connected = harness
                .service
                .registry()
                .health_snapshot()
                .agent(&agent_id)
                .map(|a| a.connected_clients);
            if connected == Some(count) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tunnels were not recorded")
}

#[tokio::test]
async fn test_client_sees_agent_node_after_subscribing() {
    init_tracing();
    let harness = Harness::new(CoordinatorConfig::default());
    let (agent_id, client_id) = (Uuid::new_v4(), Uuid::new_v4());

    let mut agent = harness
        .connect()
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();
    agent.update_node(node("10.0.0.1:41641")).await.unwrap();

    let mut client = harness
        .connect()
        .coordinate(handshake(client_id, PeerKind::Client))
        .await
        .unwrap();
    client.update_node(node("192.168.1.5:41641")).await.unwrap();
    client.add_tunnel(agent_id).await.unwrap();

    wait_for(&mut client, is_node(agent_id, "10.0.0.1:41641")).await;
    wait_for(&mut agent, is_node(client_id, "192.168.1.5:41641")).await;

    assert_eq!(
        harness.service.registry().tunnels_of(client_id),
        vec![agent_id]
    );
}

#[tokio::test]
async fn test_agent_update_fans_out_to_every_client() {
    init_tracing();
    let harness = Harness::new(CoordinatorConfig::default());
    let agent_id = Uuid::new_v4();

    let mut agent = harness
        .connect()
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();

    let mut clients = Vec::new();
    for _ in 0..2 {
        let mut client = harness
            .connect()
            .coordinate(handshake(Uuid::new_v4(), PeerKind::Client))
            .await
            .unwrap();
        client.add_tunnel(agent_id).await.unwrap();
        clients.push(client);
    }

    // Tunnels from different streams land in any order
    wait_for_clients(&harness, agent_id, 2).await;

    agent.update_node(node("10.0.0.9:41641")).await.unwrap();
    for client in clients.iter_mut() {
        wait_for(client, is_node(agent_id, "10.0.0.9:41641")).await;
    }
}

#[tokio::test]
async fn test_graceful_disconnect_notifies_subscribers() {
    init_tracing();
    let harness = Harness::new(CoordinatorConfig::default());
    let (agent_id, client_id) = (Uuid::new_v4(), Uuid::new_v4());

    let mut agent = harness
        .connect()
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();
    agent.update_node(node("10.0.0.1:41641")).await.unwrap();

    let mut client = harness
        .connect()
        .coordinate(handshake(client_id, PeerKind::Client))
        .await
        .unwrap();
    client.add_tunnel(agent_id).await.unwrap();
    wait_for(&mut client, is_node(agent_id, "10.0.0.1:41641")).await;

    agent.disconnect().await.unwrap();

    let notice = wait_for(&mut client, |u| u.id == agent_id).await;
    assert_eq!(notice.kind, PeerUpdateKind::Disconnected);
    assert_eq!(notice.reason, "peer disconnected");
    assert!(!harness.service.registry().is_registered(agent_id));
}

#[tokio::test]
async fn test_ready_for_handshake_reaches_tunnel_peer() {
    init_tracing();
    let harness = Harness::new(CoordinatorConfig::default());
    let (agent_id, client_id) = (Uuid::new_v4(), Uuid::new_v4());

    let mut agent = harness
        .connect()
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();
    let mut client = harness
        .connect()
        .coordinate(handshake(client_id, PeerKind::Client))
        .await
        .unwrap();

    // No tunnel yet: rejected, but the stream stays usable
    client.ready_for_handshake(agent_id).await.unwrap();
    let message = wait_for_rejection(&mut client).await;
    assert!(message.contains("No tunnel"), "{}", message);

    client.add_tunnel(agent_id).await.unwrap();
    client.ready_for_handshake(agent_id).await.unwrap();

    let ready = wait_for(&mut agent, |u| u.id == client_id).await;
    assert_eq!(ready.kind, PeerUpdateKind::ReadyForHandshake);
}

#[tokio::test]
async fn test_invalid_tunnels_are_rejected_without_closing_stream() {
    init_tracing();
    let harness = Harness::new(CoordinatorConfig::default());
    let (agent_id, client_id) = (Uuid::new_v4(), Uuid::new_v4());

    let mut agent = harness
        .connect()
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();
    let mut client = harness
        .connect()
        .coordinate(handshake(client_id, PeerKind::Client))
        .await
        .unwrap();

    client.add_tunnel(client_id).await.unwrap();
    let message = wait_for_rejection(&mut client).await;
    assert!(message.contains("itself"), "{}", message);

    agent.add_tunnel(client_id).await.unwrap();
    let message = wait_for_rejection(&mut agent).await;
    assert!(message.contains("agents may not open tunnels"), "{}", message);

    // Both streams still relay updates
    client.add_tunnel(agent_id).await.unwrap();
    agent.update_node(node("10.0.0.3:41641")).await.unwrap();
    wait_for(&mut client, is_node(agent_id, "10.0.0.3:41641")).await;
}

#[tokio::test]
async fn test_second_live_registration_is_rejected() {
    init_tracing();
    let harness = Harness::new(CoordinatorConfig::default());
    let agent_id = Uuid::new_v4();

    let _agent = harness
        .connect()
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();

    let err = harness
        .connect()
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, ClientError::Rejected(msg) if msg.contains("already connected")),
        "{:?}",
        err
    );
    assert!(harness.service.registry().is_live(agent_id));
}

#[tokio::test]
async fn test_resume_within_grace_keeps_tunnels() {
    init_tracing();
    let harness = Harness::new(CoordinatorConfig::default());
    let registry = harness.service.registry().clone();
    let (agent_id, client_id) = (Uuid::new_v4(), Uuid::new_v4());

    let agent_client = harness.connect();
    let mut agent = agent_client
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();
    agent.update_node(node("10.0.0.1:41641")).await.unwrap();
    let resume_token = agent.resume_token().to_string();
    assert!(!resume_token.is_empty());

    let mut client = harness
        .connect()
        .coordinate(handshake(client_id, PeerKind::Client))
        .await
        .unwrap();
    client.update_node(node("192.168.1.5:41641")).await.unwrap();
    client.add_tunnel(agent_id).await.unwrap();
    wait_for(&mut client, is_node(agent_id, "10.0.0.1:41641")).await;

    let mut events = registry.subscribe_events();
    agent_client.close().await;
    wait_for_event(&mut events, |e| {
        *e == PeerEvent::Parked { peer_id: agent_id }
    })
    .await;
    assert!(registry.is_registered(agent_id));
    assert!(!registry.is_live(agent_id));

    let mut resume = handshake(agent_id, PeerKind::Agent);
    resume.resume_token = Some(resume_token.clone());
    let mut agent = harness.connect().coordinate(resume).await.unwrap();
    assert!(agent.resumed());
    assert_ne!(agent.resume_token(), resume_token);

    // The resumed agent is resynced with its tunnel peers
    wait_for(&mut agent, is_node(client_id, "192.168.1.5:41641")).await;

    agent.update_node(node("10.0.0.2:41641")).await.unwrap();
    let mut seen_loss = false;
    wait_for(&mut client, |u| {
        if u.id == agent_id && u.kind != PeerUpdateKind::Node {
            seen_loss = true;
        }
        is_node(agent_id, "10.0.0.2:41641")(u)
    })
    .await;
    assert!(!seen_loss, "client was told the agent left");
}

#[tokio::test(start_paused = true)]
async fn test_parked_peer_is_lost_after_grace_period() {
    init_tracing();
    let config = CoordinatorConfig::default().with_grace_period(Duration::from_secs(30));
    let harness = Harness::new(config);
    let registry = harness.service.registry().clone();
    let (agent_id, client_id) = (Uuid::new_v4(), Uuid::new_v4());

    let agent_client = harness.connect();
    let mut agent = agent_client
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();
    agent.update_node(node("10.0.0.1:41641")).await.unwrap();
    let resume_token = agent.resume_token().to_string();

    let mut client = harness
        .connect()
        .coordinate(handshake(client_id, PeerKind::Client))
        .await
        .unwrap();
    client.add_tunnel(agent_id).await.unwrap();
    wait_for(&mut client, is_node(agent_id, "10.0.0.1:41641")).await;

    let mut events = registry.subscribe_events();
    agent_client.close().await;
    wait_for_event(&mut events, |e| {
        *e == PeerEvent::Parked { peer_id: agent_id }
    })
    .await;

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(registry.sweep_expired().is_empty());

    tokio::time::advance(Duration::from_secs(21)).await;
    assert_eq!(registry.sweep_expired(), vec![agent_id]);

    let notice = wait_for(&mut client, |u| u.id == agent_id).await;
    assert_eq!(notice.kind, PeerUpdateKind::Lost);
    assert_eq!(notice.reason, "resume grace period expired");

    // The token is still valid but there is nothing left to resume
    let mut late = handshake(agent_id, PeerKind::Agent);
    late.resume_token = Some(resume_token);
    let agent = harness.connect().coordinate(late).await.unwrap();
    assert!(!agent.resumed());
    assert!(registry.tunnels_of(client_id).contains(&agent_id));
}

#[tokio::test]
async fn test_resume_token_hands_off_live_registration() {
    init_tracing();
    let harness = Harness::new(CoordinatorConfig::default());
    let agent_id = Uuid::new_v4();

    let mut old = harness
        .connect()
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();

    let mut takeover = handshake(agent_id, PeerKind::Agent);
    takeover.resume_token = Some(old.resume_token().to_string());
    let new = harness.connect().coordinate(takeover).await.unwrap();
    assert!(new.resumed());

    let message = wait_for_rejection(&mut old).await;
    assert_eq!(message, "registration superseded");
    assert!(harness.service.registry().is_live(agent_id));
}

#[tokio::test]
async fn test_slow_subscriber_does_not_block_others() {
    init_tracing();
    let config = CoordinatorConfig::default().with_queue_capacity(4);
    let harness = Harness::new(config);
    let agent_id = Uuid::new_v4();

    let mut agent = harness
        .connect()
        .coordinate(handshake(agent_id, PeerKind::Agent))
        .await
        .unwrap();

    // Never reads
    let mut stalled = harness
        .connect()
        .coordinate(handshake(Uuid::new_v4(), PeerKind::Client))
        .await
        .unwrap();
    stalled.add_tunnel(agent_id).await.unwrap();

    let mut reader = harness
        .connect()
        .coordinate(handshake(Uuid::new_v4(), PeerKind::Client))
        .await
        .unwrap();
    reader.add_tunnel(agent_id).await.unwrap();

    wait_for_clients(&harness, agent_id, 2).await;

    for i in 0..200 {
        agent
            .update_node(node(&format!("10.0.0.{}:41641", i)))
            .await
            .unwrap();
    }

    wait_for(&mut reader, is_node(agent_id, "10.0.0.199:41641")).await;
}

#[tokio::test]
async fn test_jwt_authenticator_checks_handshake_credential() {
    init_tracing();
    let secret = b"coordinator-test-secret";
    let service = TailnetService::new(CoordinatorConfig::default()).with_authenticator(Arc::new(
        JwtAuthenticator::new(JwtValidator::new(secret)),
    ));
    let harness = Harness::with_service(service);
    let agent_id = Uuid::new_v4();

    let mut forged = handshake(agent_id, PeerKind::Agent);
    forged.auth_token = "not-a-jwt".to_string();
    let err = harness.connect().coordinate(forged).await.unwrap_err();
    assert!(
        matches!(&err, ClientError::Rejected(msg) if msg.starts_with("authentication failed")),
        "{:?}",
        err
    );

    // A token minted for a client cannot register an agent
    let claims = PeerClaims::new(
        agent_id,
        PeerKind::Client,
        "tailnet".to_string(),
        "coordinator".to_string(),
        chrono::Duration::hours(1),
    );
    let mut mismatched = handshake(agent_id, PeerKind::Agent);
    mismatched.auth_token = JwtValidator::encode(secret, &claims).unwrap();
    assert!(harness.connect().coordinate(mismatched).await.is_err());

    let claims = PeerClaims::new(
        agent_id,
        PeerKind::Agent,
        "tailnet".to_string(),
        "coordinator".to_string(),
        chrono::Duration::hours(1),
    );
    let mut valid = handshake(agent_id, PeerKind::Agent);
    valid.auth_token = JwtValidator::encode(secret, &claims).unwrap();
    let session = harness.connect().coordinate(valid).await.unwrap();
    assert_eq!(session.peer_id(), agent_id);
}
