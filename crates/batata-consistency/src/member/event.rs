// Member change events
// Each event carries the full member list of the host cluster

use std::collections::BTreeSet;

use tokio::sync::broadcast;
use tracing::debug;

use crate::raft::types::Peer;

/// Current members of the host cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberChangeEvent {
    pub members: BTreeSet<Peer>,
    /// Timestamp of the event
    pub timestamp: i64,
}

impl MemberChangeEvent {
    pub fn new(members: impl IntoIterator<Item = Peer>) -> Self {
        Self {
            members: members.into_iter().collect(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Broadcasts member list changes to the raft server and other listeners
#[derive(Clone)]
pub struct MemberChangeNotifier {
    tx: broadcast::Sender<MemberChangeEvent>,
}

impl MemberChangeNotifier {
    pub fn new(queue_size: usize) -> Self {
        let (tx, _) = broadcast::channel(queue_size);
        Self { tx }
    }

    pub fn publish(&self, members: impl IntoIterator<Item = Peer>) {
        let event = MemberChangeEvent::new(members);
        debug!(members = event.members.len(), "Publishing member change event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemberChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for MemberChangeNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_full_member_list() {
        let notifier = MemberChangeNotifier::default();
        let mut rx = notifier.subscribe();

        notifier.publish(vec![Peer::new("127.0.0.1", 9002), Peer::new("127.0.0.1", 9001)]);

        let event = rx.recv().await.unwrap();
        let members: Vec<Peer> = event.members.into_iter().collect();
        assert_eq!(
            members,
            vec![Peer::new("127.0.0.1", 9001), Peer::new("127.0.0.1", 9002)]
        );
    }
}
