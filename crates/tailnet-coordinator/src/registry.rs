//! Peer registry
//!
//! Process-wide directory of connected agents and clients. Owns every peer
//! record and every tunnel edge under a single lock; Coordinate handlers only
//! hold a [`PeerHandle`] (peer ID plus registration generation) and must hand
//! it back through [`PeerRegistry::release`] on every exit path.
//!
//! Nothing in here performs I/O. Fan-out is a non-blocking push onto each
//! interested peer's [`UpdateQueue`], which its handler drains to the wire.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tailnet_auth::AuthorizedPeer;
use tailnet_proto::{Node, PeerKind, PeerUpdate};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::RegistryError;
use crate::health::{AgentHealth, HealthSnapshot};
use crate::queue::UpdateQueue;
use crate::subscriptions::SubscriptionIndex;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notifications for observers outside the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected { peer_id: Uuid, kind: PeerKind },
    Resumed { peer_id: Uuid, kind: PeerKind },
    Parked { peer_id: Uuid },
    Evicted { peer_id: Uuid, reason: String },
}

/// How a Coordinate stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The peer said goodbye
    Graceful,
    /// The connection failed, timed out or was cancelled
    Dropped,
}

/// A handler's claim on a registry record
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub peer_id: Uuid,
    pub kind: PeerKind,
    pub generation: u64,
    pub resumed: bool,
    queue: Arc<UpdateQueue<PeerUpdate>>,
}

impl PeerHandle {
    /// Outbound updates for this registration
    pub fn queue(&self) -> &Arc<UpdateQueue<PeerUpdate>> {
        &self.queue
    }
}

#[derive(Debug)]
enum Connection {
    Live {
        generation: u64,
        queue: Arc<UpdateQueue<PeerUpdate>>,
    },
    Parked {
        until: Instant,
    },
}

#[derive(Debug)]
struct PeerRecord {
    peer: AuthorizedPeer,
    node: Option<Node>,
    last_seen: DateTime<Utc>,
    resume_token_id: Option<String>,
    connection: Connection,
}

impl PeerRecord {
    fn live_queue(&self) -> Option<&Arc<UpdateQueue<PeerUpdate>>> {
        match &self.connection {
            Connection::Live { queue, .. } => Some(queue),
            Connection::Parked { .. } => None,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.connection, Connection::Live { .. })
    }

    /// Parked past its grace window
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.connection, Connection::Parked { until } if until <= now)
    }

    fn owned_by(&self, handle: &PeerHandle) -> bool {
        matches!(
            self.connection,
            Connection::Live { generation, .. } if generation == handle.generation
        )
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    peers: HashMap<Uuid, PeerRecord>,
    subscriptions: SubscriptionIndex,
    next_generation: u64,
}

impl RegistryState {
    fn enqueue(&self, peer_id: Uuid, update: PeerUpdate) {
        if let Some(queue) = self.peers.get(&peer_id).and_then(PeerRecord::live_queue) {
            queue.push(update);
        }
    }

    fn owned_record(
        &mut self,
        handle: &PeerHandle,
    ) -> Result<&mut PeerRecord, RegistryError> {
        match self.peers.get_mut(&handle.peer_id) {
            Some(record) if record.owned_by(handle) => Ok(record),
            _ => Err(RegistryError::StaleHandle(handle.peer_id)),
        }
    }

    fn check_owned(&self, handle: &PeerHandle) -> Result<(), RegistryError> {
        match self.peers.get(&handle.peer_id) {
            Some(record) if record.owned_by(handle) => Ok(()),
            _ => Err(RegistryError::StaleHandle(handle.peer_id)),
        }
    }

    /// Queue the current node of every peer sharing a tunnel with `peer_id`
    fn resync(&self, peer_id: Uuid, queue: &UpdateQueue<PeerUpdate>) {
        for other in self.subscriptions.peers_sharing(peer_id) {
            if let Some(node) = self.peers.get(&other).and_then(|r| r.node.clone()) {
                queue.push(PeerUpdate::node(other, node));
            }
        }
    }

    /// Send `update` to everyone sharing a tunnel with `peer_id`.
    ///
    /// Targets may legitimately have no record (evicted agents keep their
    /// incoming edges). Subscribers always have one; a missing subscriber
    /// means the index and the peer table disagree.
    fn fan_out(&mut self, peer_id: Uuid, update: &PeerUpdate) {
        for target in self.subscriptions.targets_of(peer_id) {
            self.enqueue(target, update.clone());
        }

        for subscriber in self.subscriptions.subscribers_of(peer_id) {
            if self.peers.contains_key(&subscriber) {
                self.enqueue(subscriber, update.clone());
            } else {
                error!(
                    peer_id = %peer_id,
                    subscriber = %subscriber,
                    "Subscription from unregistered peer, dropping its edges"
                );
                debug_assert!(false, "subscription index out of sync with peer table");
                self.subscriptions.remove_all_from(subscriber);
            }
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// In-memory peer directory. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct PeerRegistry {
    state: Mutex<RegistryState>,
    events: broadcast::Sender<PeerEvent>,
    config: CoordinatorConfig,
}

impl PeerRegistry {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(RegistryState::default()),
            events,
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PeerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Observe peer lifecycle changes
    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Create or reclaim the record for `peer`.
    ///
    /// `resume_token_id` is the `jti` of an already verified resume token.
    /// When it matches the record's current token the record (node and
    /// tunnels) is reused: a parked record is resumed, and a live one is
    /// handed off to the new connection, closing the old connection's queue.
    /// Without a match a live record is `AlreadyActive`, and a parked one is
    /// evicted before registering fresh.
    pub fn register(
        &self,
        peer: AuthorizedPeer,
        resume_token_id: Option<&str>,
    ) -> Result<PeerHandle, RegistryError> {
        let mut state = self.state();
        let peer_id = peer.peer_id;

        // The janitor may not have run yet; an expired record is never resumed
        let expired = state
            .peers
            .get(&peer_id)
            .is_some_and(|record| record.is_expired(Instant::now()));
        if expired {
            self.evict_locked(
                &mut state,
                peer_id,
                PeerUpdate::lost(peer_id, "resume grace period expired"),
                "resume grace period expired",
            );
        }

        let token_matches = |record: &PeerRecord| {
            resume_token_id.is_some()
                && record.resume_token_id.as_deref() == resume_token_id
                && record.peer.kind == peer.kind
        };

        let reclaim = match state.peers.get(&peer_id) {
            Some(record) if record.is_live() && !token_matches(record) => {
                warn!(peer_id = %peer_id, "Rejected registration: peer already connected");
                return Err(RegistryError::AlreadyActive(peer_id));
            }
            Some(record) => token_matches(record),
            None => false,
        };

        if !reclaim && state.peers.contains_key(&peer_id) {
            self.evict_locked(
                &mut state,
                peer_id,
                PeerUpdate::lost(peer_id, "peer re-registered"),
                "re-registered without resume token",
            );
        }

        let generation = state.next_generation();
        let queue = Arc::new(UpdateQueue::new(self.config.queue_capacity));
        let kind = peer.kind;

        if reclaim {
            if let Some(record) = state.peers.get_mut(&peer_id) {
                if let Connection::Live { queue: old, .. } = &record.connection {
                    old.close();
                    info!(peer_id = %peer_id, "Handing off live peer to new connection");
                }
                record.connection = Connection::Live {
                    generation,
                    queue: queue.clone(),
                };
                record.peer = peer;
                record.last_seen = Utc::now();
            }
            info!(peer_id = %peer_id, kind = %kind, generation, "Peer resumed");
            self.emit(PeerEvent::Resumed { peer_id, kind });
        } else {
            state.peers.insert(
                peer_id,
                PeerRecord {
                    peer,
                    node: None,
                    last_seen: Utc::now(),
                    resume_token_id: None,
                    connection: Connection::Live {
                        generation,
                        queue: queue.clone(),
                    },
                },
            );
            info!(peer_id = %peer_id, kind = %kind, generation, "Peer registered");
            self.emit(PeerEvent::Connected { peer_id, kind });
        }

        state.resync(peer_id, &queue);

        Ok(PeerHandle {
            peer_id,
            kind,
            generation,
            resumed: reclaim,
            queue,
        })
    }

    /// Record the `jti` of the resume token just issued to this registration
    pub fn set_resume_token_id(
        &self,
        handle: &PeerHandle,
        token_id: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let mut state = self.state();
        let record = state.owned_record(handle)?;
        record.resume_token_id = Some(token_id.into());
        Ok(())
    }

    /// Move a record onto a refreshed token.
    ///
    /// Only the holder of the record's current token may move it; refreshing
    /// a superseded token leaves the record alone. Returns whether the record
    /// adopted `new_token_id`.
    pub fn adopt_resume_token(
        &self,
        peer_id: Uuid,
        old_token_id: &str,
        new_token_id: &str,
    ) -> bool {
        let mut state = self.state();
        match state.peers.get_mut(&peer_id) {
            Some(record) if record.resume_token_id.as_deref() == Some(old_token_id) => {
                record.resume_token_id = Some(new_token_id.to_string());
                debug!(
                    peer_id = %peer_id,
                    token_id = %new_token_id,
                    "Record adopted refreshed resume token"
                );
                true
            }
            Some(_) => {
                debug!(peer_id = %peer_id, "Refreshed token does not match record, not adopted");
                false
            }
            None => false,
        }
    }

    /// Replace the peer's node and relay it to everyone sharing a tunnel
    pub fn update_node(&self, handle: &PeerHandle, node: Node) -> Result<(), RegistryError> {
        let mut state = self.state();
        let record = state.owned_record(handle)?;
        record.node = Some(node.clone());
        record.last_seen = Utc::now();

        let update = PeerUpdate::node(handle.peer_id, node);
        state.fan_out(handle.peer_id, &update);
        Ok(())
    }

    /// Open a tunnel to `target`.
    ///
    /// Each side is sent the other's current node. Returns the target's node
    /// if it is known.
    pub fn subscribe(
        &self,
        handle: &PeerHandle,
        target: Uuid,
    ) -> Result<Option<Node>, RegistryError> {
        if target == handle.peer_id {
            return Err(RegistryError::SelfTunnel);
        }

        let mut state = self.state();
        state.check_owned(handle)?;

        if state.subscriptions.add(handle.peer_id, target) {
            debug!(peer_id = %handle.peer_id, target = %target, "Tunnel added");
        }

        let target_node = state.peers.get(&target).and_then(|r| r.node.clone());
        if let Some(node) = &target_node {
            handle.queue.push(PeerUpdate::node(target, node.clone()));
        }

        let own_node = state.peers.get(&handle.peer_id).and_then(|r| r.node.clone());
        if let Some(node) = own_node {
            state.enqueue(target, PeerUpdate::node(handle.peer_id, node));
        }

        Ok(target_node)
    }

    /// Close the tunnel to `target`. Returns whether an edge was removed.
    pub fn unsubscribe(&self, handle: &PeerHandle, target: Uuid) -> Result<bool, RegistryError> {
        let mut state = self.state();
        state.check_owned(handle)?;

        let removed = state.subscriptions.remove(handle.peer_id, target);
        if removed && !state.subscriptions.connected(handle.peer_id, target) {
            state.enqueue(
                target,
                PeerUpdate::disconnected(handle.peer_id, "tunnel removed"),
            );
        }
        if removed {
            debug!(peer_id = %handle.peer_id, target = %target, "Tunnel removed");
        }
        Ok(removed)
    }

    /// Tell `target` this peer is ready for the tunnel handshake
    pub fn ready_for_handshake(
        &self,
        handle: &PeerHandle,
        target: Uuid,
    ) -> Result<(), RegistryError> {
        let state = self.state();
        state.check_owned(handle)?;

        if !state.subscriptions.connected(handle.peer_id, target) {
            return Err(RegistryError::NoTunnel(handle.peer_id, target));
        }
        state.enqueue(target, PeerUpdate::ready_for_handshake(handle.peer_id));
        Ok(())
    }

    /// End of a Coordinate stream.
    ///
    /// A handle that no longer owns the record (it was superseded by a
    /// handoff) releases nothing.
    pub fn release(&self, handle: &PeerHandle, disposition: Disposition) {
        let mut state = self.state();
        let peer_id = handle.peer_id;

        let Some(record) = state.peers.get_mut(&peer_id) else {
            return;
        };
        if !record.owned_by(handle) {
            debug!(
                peer_id = %peer_id,
                generation = handle.generation,
                "Release of superseded registration ignored"
            );
            return;
        }

        match disposition {
            Disposition::Graceful => {
                self.evict_locked(
                    &mut state,
                    peer_id,
                    PeerUpdate::disconnected(peer_id, "peer disconnected"),
                    "graceful disconnect",
                );
            }
            Disposition::Dropped if record.resume_token_id.is_some() => {
                handle.queue.close();
                record.connection = Connection::Parked {
                    until: Instant::now() + self.config.resume_grace_period,
                };
                record.last_seen = Utc::now();
                info!(
                    peer_id = %peer_id,
                    grace_secs = self.config.resume_grace_period.as_secs(),
                    "Peer connection dropped, parked for resume"
                );
                self.emit(PeerEvent::Parked { peer_id });
            }
            Disposition::Dropped => {
                self.evict_locked(
                    &mut state,
                    peer_id,
                    PeerUpdate::lost(peer_id, "connection lost"),
                    "connection lost",
                );
            }
        }
    }

    /// Remove a peer and its outgoing tunnels, telling everyone it shared a
    /// tunnel with that it is gone. Returns false if it was not registered.
    pub fn evict(&self, peer_id: Uuid) -> bool {
        let mut state = self.state();
        self.evict_locked(
            &mut state,
            peer_id,
            PeerUpdate::lost(peer_id, "evicted"),
            "evicted",
        )
    }

    fn evict_locked(
        &self,
        state: &mut RegistryState,
        peer_id: Uuid,
        notice: PeerUpdate,
        reason: &str,
    ) -> bool {
        let Some(record) = state.peers.remove(&peer_id) else {
            return false;
        };
        if let Some(queue) = record.live_queue() {
            queue.close();
        }

        state.fan_out(peer_id, &notice);
        state.subscriptions.remove_all_from(peer_id);

        info!(peer_id = %peer_id, kind = %record.peer.kind, reason = %reason, "Peer evicted");
        self.emit(PeerEvent::Evicted {
            peer_id,
            reason: reason.to_string(),
        });
        true
    }

    /// Evict parked peers whose grace window has elapsed
    pub fn sweep_expired(&self) -> Vec<Uuid> {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> Vec<Uuid> {
        let mut state = self.state();
        let expired: Vec<Uuid> = state
            .peers
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(id, _)| *id)
            .collect();

        for peer_id in &expired {
            self.evict_locked(
                &mut state,
                *peer_id,
                PeerUpdate::lost(*peer_id, "resume grace period expired"),
                "resume grace period expired",
            );
        }
        expired
    }

    /// Current node of a registered peer
    pub fn node_of(&self, peer_id: Uuid) -> Option<Node> {
        self.state().peers.get(&peer_id).and_then(|r| r.node.clone())
    }

    pub fn is_registered(&self, peer_id: Uuid) -> bool {
        self.state().peers.contains_key(&peer_id)
    }

    /// Registered with an attached connection (not parked)
    pub fn is_live(&self, peer_id: Uuid) -> bool {
        self.state()
            .peers
            .get(&peer_id)
            .map(PeerRecord::is_live)
            .unwrap_or(false)
    }

    pub fn peer_count(&self) -> usize {
        self.state().peers.len()
    }

    /// Peers `peer_id` holds tunnels to
    pub fn tunnels_of(&self, peer_id: Uuid) -> Vec<Uuid> {
        self.state().subscriptions.targets_of(peer_id)
    }

    /// Per-agent connectivity summary
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let state = self.state();
        let mut agents = BTreeMap::new();
        let mut clients = 0;
        let mut parked = 0;

        for (id, record) in &state.peers {
            if !record.is_live() {
                parked += 1;
            }
            match record.peer.kind {
                PeerKind::Client => clients += 1,
                PeerKind::Agent => {
                    let connected_clients = state
                        .subscriptions
                        .subscribers_of(*id)
                        .iter()
                        .filter(|sub| {
                            state
                                .peers
                                .get(*sub)
                                .map(|r| r.is_live() && r.peer.kind == PeerKind::Client)
                                .unwrap_or(false)
                        })
                        .count();

                    agents.insert(
                        *id,
                        AgentHealth {
                            name: record.peer.name.clone(),
                            connected: record.is_live(),
                            connected_clients,
                            last_seen: record.last_seen,
                        },
                    );
                }
            }
        }

        HealthSnapshot {
            generated_at: Utc::now(),
            agents,
            clients,
            parked,
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}
