// Route table
// Process-wide view of every group's configuration and leader, read lock-free by forwarders

use std::collections::BTreeSet;

use dashmap::DashMap;

use super::types::Peer;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteEntry {
    pub conf: BTreeSet<Peer>,
    pub leader: Option<Peer>,
    pub term: u64,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    groups: DashMap<String, RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_configuration(&self, group: &str, conf: BTreeSet<Peer>) {
        self.groups.entry(group.to_string()).or_default().conf = conf;
    }

    /// Record a leader observed at `term`; an older term never replaces a newer one
    pub fn update_leader(&self, group: &str, leader: Option<Peer>, term: u64) {
        let mut entry = self.groups.entry(group.to_string()).or_default();
        if term < entry.term {
            return;
        }
        entry.leader = leader;
        entry.term = term;
    }

    pub fn select_leader(&self, group: &str) -> Option<Peer> {
        self.groups.get(group).and_then(|e| e.leader.clone())
    }

    pub fn configuration(&self, group: &str) -> BTreeSet<Peer> {
        self.groups
            .get(group)
            .map(|e| e.conf.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, group: &str) -> Option<RouteEntry> {
        self.groups.get(group).map(|e| e.value().clone())
    }

    pub fn remove(&self, group: &str) {
        self.groups.remove(group);
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_term_ordering() {
        let table = RouteTable::new();
        let a = Peer::new("127.0.0.1", 9001);
        let b = Peer::new("127.0.0.1", 9002);

        table.update_leader("config", Some(a.clone()), 2);
        assert_eq!(table.select_leader("config"), Some(a.clone()));

        table.update_leader("config", Some(b.clone()), 1);
        assert_eq!(table.select_leader("config"), Some(a));

        table.update_leader("config", Some(b.clone()), 3);
        assert_eq!(table.select_leader("config"), Some(b));

        table.update_leader("config", None, 4);
        assert_eq!(table.select_leader("config"), None);
    }

    #[test]
    fn test_configuration() {
        let table = RouteTable::new();
        assert!(table.configuration("naming").is_empty());

        let conf: BTreeSet<Peer> = [Peer::new("127.0.0.1", 9001), Peer::new("127.0.0.1", 9002)]
            .into_iter()
            .collect();
        table.update_configuration("naming", conf.clone());
        assert_eq!(table.configuration("naming"), conf);
        assert_eq!(table.groups(), vec!["naming".to_string()]);

        table.remove("naming");
        assert!(table.get("naming").is_none());
    }
}
