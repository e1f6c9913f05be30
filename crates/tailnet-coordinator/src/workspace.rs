//! Workspace update feeds
//!
//! The coordinator does not know about workspaces. It forwards whatever an
//! external [`WorkspaceUpdatesProvider`] yields for the requested owner.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tailnet_proto::{Workspace, WorkspaceAgent, WorkspaceUpdate};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;
use uuid::Uuid;

const UPDATE_CHANNEL_CAPACITY: usize = 128;

#[async_trait]
pub trait WorkspaceUpdatesProvider: Send + Sync {
    /// Updates for one owner: a full snapshot first, then deltas
    async fn subscribe(&self, owner_id: Uuid)
        -> Result<BoxStream<'static, WorkspaceUpdate>, String>;
}

#[derive(Debug, Default)]
struct OwnerState {
    workspaces: BTreeMap<Uuid, Workspace>,
    agents: BTreeMap<Uuid, WorkspaceAgent>,
}

impl OwnerState {
    fn apply(&mut self, update: &WorkspaceUpdate) {
        for id in &update.deleted_workspaces {
            self.workspaces.remove(id);
        }
        for id in &update.deleted_agents {
            self.agents.remove(id);
        }
        for workspace in &update.upserted_workspaces {
            self.workspaces.insert(workspace.id, workspace.clone());
        }
        for agent in &update.upserted_agents {
            self.agents.insert(agent.id, agent.clone());
        }
    }

    fn snapshot(&self) -> WorkspaceUpdate {
        WorkspaceUpdate {
            upserted_workspaces: self.workspaces.values().cloned().collect(),
            upserted_agents: self.agents.values().cloned().collect(),
            ..Default::default()
        }
    }
}

/// Provider backed by updates pushed in-process with [`publish`](Self::publish)
#[derive(Debug)]
pub struct InMemoryWorkspaceUpdates {
    owners: Mutex<HashMap<Uuid, OwnerState>>,
    tx: broadcast::Sender<(Uuid, WorkspaceUpdate)>,
}

impl InMemoryWorkspaceUpdates {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            owners: Mutex::new(HashMap::new()),
            tx,
        }
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<Uuid, OwnerState>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` to the owner's snapshot and forward it to subscribers
    pub fn publish(&self, owner_id: Uuid, update: WorkspaceUpdate) {
        let mut owners = self.owners();
        owners.entry(owner_id).or_default().apply(&update);
        // Sent under the lock so a subscriber never sees a delta twice
        let _ = self.tx.send((owner_id, update));
    }

    pub fn snapshot(&self, owner_id: Uuid) -> WorkspaceUpdate {
        self.owners()
            .get(&owner_id)
            .map(OwnerState::snapshot)
            .unwrap_or_default()
    }
}

impl Default for InMemoryWorkspaceUpdates {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkspaceUpdatesProvider for InMemoryWorkspaceUpdates {
    async fn subscribe(
        &self,
        owner_id: Uuid,
    ) -> Result<BoxStream<'static, WorkspaceUpdate>, String> {
        let (initial, rx) = {
            let owners = self.owners();
            let initial = owners
                .get(&owner_id)
                .map(OwnerState::snapshot)
                .unwrap_or_default();
            (initial, self.tx.subscribe())
        };

        let deltas = BroadcastStream::new(rx).filter_map(move |item| async move {
            match item {
                Ok((owner, update)) if owner == owner_id => Some(update),
                Ok(_) => None,
                Err(e) => {
                    warn!(owner_id = %owner_id, "Workspace update subscriber lagged: {}", e);
                    None
                }
            }
        });

        Ok(stream::once(async move { initial }).chain(deltas).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tailnet_proto::WorkspaceStatus;

    fn workspace(name: &str, status: WorkspaceStatus) -> Workspace {
        Workspace {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status,
        }
    }

    #[tokio::test]
    async fn test_snapshot_then_deltas_for_owner_only() {
        let provider = InMemoryWorkspaceUpdates::new();
        let (owner, other) = (Uuid::new_v4(), Uuid::new_v4());
        let dev = workspace("dev", WorkspaceStatus::Running);

        provider.publish(
            owner,
            WorkspaceUpdate {
                upserted_workspaces: vec![dev.clone()],
                ..Default::default()
            },
        );

        let mut updates = provider.subscribe(owner).await.unwrap();
        let initial = updates.next().await.unwrap();
        assert_eq!(initial.upserted_workspaces, vec![dev.clone()]);

        provider.publish(
            other,
            WorkspaceUpdate {
                upserted_workspaces: vec![workspace("theirs", WorkspaceStatus::Pending)],
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

        let delta = tokio::time::timeout(Duration::from_secs(1), updates.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delta.deleted_workspaces, vec![dev.id]);
        assert!(delta.upserted_workspaces.is_empty());
    }

    #[test]
    fn test_snapshot_applies_deletes() {
        let provider = InMemoryWorkspaceUpdates::new();
        let owner = Uuid::new_v4();
        let ws = workspace("dev", WorkspaceStatus::Starting);
        let agent = WorkspaceAgent {
            id: Uuid::new_v4(),
            workspace_id: ws.id,
            name: "main".to_string(),
        };

        provider.publish(
            owner,
            WorkspaceUpdate {
                upserted_workspaces: vec![ws.clone()],
                upserted_agents: vec![agent.clone()],
                ..Default::default()
            },
        );
        provider.publish(
            owner,
            WorkspaceUpdate {
                deleted_agents: vec![agent.id],
                ..Default::default()
            },
        );

        let snapshot = provider.snapshot(owner);
        assert_eq!(snapshot.upserted_workspaces, vec![ws]);
        assert!(snapshot.upserted_agents.is_empty());
    }
}
