//! Connectivity summary exposed to the surrounding platform

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentHealth {
    pub name: String,
    /// Live connection attached (false while parked for resume)
    pub connected: bool,
    /// Live clients holding a tunnel to this agent
    pub connected_clients: usize,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub agents: BTreeMap<Uuid, AgentHealth>,
    /// Registered clients, live or parked
    pub clients: usize,
    /// Records waiting for a resume
    pub parked: usize,
}

impl HealthSnapshot {
    pub fn agent(&self, id: &Uuid) -> Option<&AgentHealth> {
        self.agents.get(id)
    }

    pub fn connected_agents(&self) -> usize {
        self.agents.values().filter(|a| a.connected).count()
    }
}
