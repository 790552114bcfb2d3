// Raft type configuration for openraft
// Defines the type aliases shared by every raft group and the peer address type

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use md5::{Digest, Md5};
use openraft::BasicNode;
use serde::{Deserialize, Serialize};

use super::request::{LogEntry, Response};
use crate::error::ConsistencyError;

/// Node ID type - derived from the peer address
pub type NodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = LogEntry,
        R = Response,
        Node = BasicNode,
        NodeId = NodeId,
);

/// Type alias for the Raft instance
pub type Raft = openraft::Raft<TypeConfig>;

/// Type alias for log entries
pub type Entry = openraft::Entry<TypeConfig>;

/// Type alias for log ID
pub type LogId = openraft::LogId<NodeId>;

/// Type alias for stored membership
pub type StoredMembership = openraft::StoredMembership<NodeId, BasicNode>;

/// Type alias for snapshot metadata
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;

/// Type alias for snapshots
pub type Snapshot = openraft::storage::Snapshot<TypeConfig>;

/// Type alias for metrics
pub type RaftMetrics = openraft::RaftMetrics<NodeId, BasicNode>;

/// Type alias for server state
pub type ServerState = openraft::ServerState;

/// Calculate a node ID from an address.
/// Stable across processes and builds since ids end up in the persisted log.
pub fn calculate_node_id(addr: &str) -> NodeId {
    let digest = Md5::digest(addr.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// A raft peer, addressed as `ip:port`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Peer {
    pub ip: String,
    pub port: u16,
}

impl Peer {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn node_id(&self) -> NodeId {
        calculate_node_id(&self.address())
    }

    pub fn to_node(&self) -> BasicNode {
        BasicNode::new(self.address())
    }

    pub fn from_node(node: &BasicNode) -> Option<Self> {
        node.addr.parse().ok()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Peer {
    type Err = ConsistencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, port) = s
            .rsplit_once(':')
            .filter(|(ip, _)| !ip.is_empty())
            .ok_or_else(|| ConsistencyError::InvalidPeer(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ConsistencyError::InvalidPeer(s.to_string()))?;
        Ok(Peer::new(ip, port))
    }
}

impl TryFrom<String> for Peer {
    type Error = ConsistencyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Peer> for String {
    fn from(peer: Peer) -> Self {
        peer.address()
    }
}

/// Parse a comma separated peer list, rejecting the whole list on any bad entry
pub fn parse_peers(value: &str) -> Result<Vec<Peer>, ConsistencyError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_node_id() {
        let addr1 = "192.168.1.1:7848";
        let addr2 = "192.168.1.2:7848";

        let id1 = calculate_node_id(addr1);
        let id2 = calculate_node_id(addr2);

        assert_eq!(id1, calculate_node_id(addr1));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_peer_parse_and_display() {
        let peer: Peer = "10.0.0.1:7848".parse().unwrap();
        assert_eq!(peer.ip, "10.0.0.1");
        assert_eq!(peer.port, 7848);
        assert_eq!(peer.to_string(), "10.0.0.1:7848");
        assert_eq!(peer.node_id(), calculate_node_id("10.0.0.1:7848"));
        assert_eq!(Peer::from_node(&peer.to_node()), Some(peer));
    }

    #[test]
    fn test_peer_parse_invalid() {
        assert!("10.0.0.1".parse::<Peer>().is_err());
        assert!(":7848".parse::<Peer>().is_err());
        assert!("10.0.0.1:http".parse::<Peer>().is_err());
        assert!("10.0.0.1:70000".parse::<Peer>().is_err());
    }

    #[test]
    fn test_peer_serde_as_string() {
        let peer = Peer::new("127.0.0.1", 9001);
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, "\"127.0.0.1:9001\"");
        let back: Peer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }

    #[test]
    fn test_snapshot_data_is_in_memory() {
        let data: <TypeConfig as openraft::RaftTypeConfig>::SnapshotData = Cursor::new(vec![1, 2]);
        assert_eq!(data.into_inner(), vec![1, 2]);
    }

    #[test]
    fn test_parse_peers() {
        let peers = parse_peers("127.0.0.1:9001, 127.0.0.1:9002,").unwrap();
        assert_eq!(peers.len(), 2);
        assert!(parse_peers("127.0.0.1:9001,bad").is_err());
    }
}
