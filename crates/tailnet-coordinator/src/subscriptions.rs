//! Tunnel subscription index
//!
//! Directed edges `src -> dst` ("src wants updates about dst"). Updates flow
//! both ways along an edge, so most lookups ask for every peer sharing an
//! edge with a given peer regardless of direction.

use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    by_src: HashMap<Uuid, BTreeSet<Uuid>>,
    by_dst: HashMap<Uuid, BTreeSet<Uuid>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `src -> dst`. Returns false if the edge already existed.
    pub fn add(&mut self, src: Uuid, dst: Uuid) -> bool {
        let inserted = self.by_src.entry(src).or_default().insert(dst);
        self.by_dst.entry(dst).or_default().insert(src);
        inserted
    }

    /// Remove `src -> dst`. Returns false if there was no such edge.
    pub fn remove(&mut self, src: Uuid, dst: Uuid) -> bool {
        let removed = remove_edge(&mut self.by_src, src, dst);
        remove_edge(&mut self.by_dst, dst, src);
        removed
    }

    /// Remove every edge originating at `src`, returning the former targets
    pub fn remove_all_from(&mut self, src: Uuid) -> Vec<Uuid> {
        let targets = self.by_src.remove(&src).unwrap_or_default();
        for dst in &targets {
            remove_edge(&mut self.by_dst, *dst, src);
        }
        targets.into_iter().collect()
    }

    pub fn contains(&self, src: Uuid, dst: Uuid) -> bool {
        self.by_src
            .get(&src)
            .map(|targets| targets.contains(&dst))
            .unwrap_or(false)
    }

    /// Whether a tunnel exists between two peers in either direction
    pub fn connected(&self, a: Uuid, b: Uuid) -> bool {
        self.contains(a, b) || self.contains(b, a)
    }

    /// Peers subscribed to `dst`
    pub fn subscribers_of(&self, dst: Uuid) -> Vec<Uuid> {
        self.by_dst
            .get(&dst)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Peers `src` is subscribed to
    pub fn targets_of(&self, src: Uuid) -> Vec<Uuid> {
        self.by_src
            .get(&src)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every peer sharing an edge with `id`, in either direction
    pub fn peers_sharing(&self, id: Uuid) -> BTreeSet<Uuid> {
        let mut peers = BTreeSet::new();
        if let Some(targets) = self.by_src.get(&id) {
            peers.extend(targets.iter().copied());
        }
        if let Some(subscribers) = self.by_dst.get(&id) {
            peers.extend(subscribers.iter().copied());
        }
        peers
    }

    pub fn edge_count(&self) -> usize {
        self.by_src.values().map(|s| s.len()).sum()
    }
}

fn remove_edge(map: &mut HashMap<Uuid, BTreeSet<Uuid>>, key: Uuid, value: Uuid) -> bool {
    let Some(set) = map.get_mut(&key) else {
        return false;
    };
    let removed = set.remove(&value);
    if set.is_empty() {
        map.remove(&key);
    }
    removed
}
