// Raft group events
// Published on leadership and membership change, consumed by diagnostics

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::Peer;

/// Snapshot of one group's leadership and membership
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftEvent {
    pub group_id: String,
    pub leader: Option<Peer>,
    pub term: Option<u64>,
    pub members: Vec<Peer>,
    pub timestamp: i64,
}

impl RaftEvent {
    pub fn new(
        group_id: impl Into<String>,
        leader: Option<Peer>,
        term: Option<u64>,
        members: Vec<Peer>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            leader,
            term,
            members,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Broadcasts raft events to any number of subscribers
#[derive(Clone)]
pub struct RaftEventPublisher {
    tx: broadcast::Sender<RaftEvent>,
}

impl RaftEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (tx, _) = broadcast::channel(queue_size);
        Self { tx }
    }

    pub fn publish(&self, event: RaftEvent) {
        debug!(
            group = %event.group_id,
            leader = ?event.leader,
            term = ?event.term,
            "Publishing raft event"
        );
        // No subscriber is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RaftEvent> {
        self.tx.subscribe()
    }
}

impl Default for RaftEventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Latest known view of every group, fed by raft events
#[derive(Debug, Default)]
pub struct RaftMetadata {
    groups: DashMap<String, RaftEvent>,
}

impl RaftMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event; events older than the stored one are ignored
    pub fn update(&self, event: RaftEvent) {
        match self.groups.get_mut(&event.group_id) {
            Some(mut current) => {
                if older_term(event.term, current.term) {
                    return;
                }
                *current = event;
            }
            None => {
                self.groups.insert(event.group_id.clone(), event);
            }
        }
    }

    pub fn get(&self, group: &str) -> Option<RaftEvent> {
        self.groups.get(group).map(|e| e.value().clone())
    }

    pub fn remove(&self, group: &str) {
        self.groups.remove(group);
    }

    pub fn snapshot(&self) -> BTreeMap<String, RaftEvent> {
        self.groups
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

fn older_term(incoming: Option<u64>, current: Option<u64>) -> bool {
    matches!((incoming, current), (Some(i), Some(c)) if i < c)
}
