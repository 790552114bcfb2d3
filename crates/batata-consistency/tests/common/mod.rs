//! In-process raft clusters for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use batata_consistency::raft::{RaftTransport, RpcHandler};
use batata_consistency::{LocalTransport, Peer, RaftConfig, RaftKvStore, RaftServer};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const KV_GROUP: &str = "kv";

pub struct Node {
    pub peer: Peer,
    pub server: Arc<RaftServer>,
    pub kv: RaftKvStore,
    pub dir: TempDir,
}

/// Adjusts the config every node of a cluster starts with
pub type Tune = fn(&mut RaftConfig);

pub struct Cluster {
    pub transport: LocalTransport,
    /// What the nodes send their rpcs through; wraps `transport`
    pub rpc: Arc<dyn RaftTransport>,
    pub nodes: Vec<Node>,
    pub members: Vec<String>,
}

/// Log to the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(dir: &Path, peer: &Peer, members: &[String]) -> RaftConfig {
    RaftConfig {
        data_dir: dir.to_path_buf(),
        self_member: peer.address(),
        members: members.to_vec(),
        election_timeout_ms: 500,
        heartbeat_interval_ms: 100,
        rpc_request_timeout_ms: 2000,
        leader_lookup_timeout_ms: 5000,
        failover_retries: 3,
        ..RaftConfig::default()
    }
}

/// Create a node serving the key-value group, registered on `transport` but not started
pub async fn node(transport: &LocalTransport, peer: Peer, members: &[String]) -> Node {
    node_in(transport, peer, members, tempfile::tempdir().unwrap()).await
}

/// Like `node`, over an existing data directory
pub async fn node_in(
    transport: &LocalTransport,
    peer: Peer,
    members: &[String],
    dir: TempDir,
) -> Node {
    let rpc: Arc<dyn RaftTransport> = Arc::new(transport.clone());
    node_with(transport, rpc, peer, members, dir, |_| {}).await
}

/// Like `node_in`, sending rpcs through `rpc` and with a tuned config
pub async fn node_with(
    transport: &LocalTransport,
    rpc: Arc<dyn RaftTransport>,
    peer: Peer,
    members: &[String],
    dir: TempDir,
    tune: Tune,
) -> Node {
    let mut raft_config = config(dir.path(), &peer, members);
    tune(&mut raft_config);
    let server = RaftServer::new(raft_config, rpc).unwrap();
    let handler: Arc<dyn RpcHandler> = server.clone();
    transport.register(&peer, &handler);
    let kv = RaftKvStore::open(KV_GROUP, &server).await.unwrap();
    Node {
        peer,
        server,
        kv,
        dir,
    }
}

impl Cluster {
    pub async fn start(size: u16, base_port: u16) -> Cluster {
        let cluster = Cluster::new(size, base_port).await;
        cluster.start_all().await;
        cluster
    }

    /// Nodes with the key-value group registered, not started yet
    pub async fn new(size: u16, base_port: u16) -> Cluster {
        let transport = LocalTransport::new();
        let rpc: Arc<dyn RaftTransport> = Arc::new(transport.clone());
        Cluster::with(transport, rpc, size, base_port, |_| {}).await
    }

    /// Nodes sending rpcs through `rpc`, each config adjusted by `tune`
    pub async fn with(
        transport: LocalTransport,
        rpc: Arc<dyn RaftTransport>,
        size: u16,
        base_port: u16,
        tune: Tune,
    ) -> Cluster {
        init_tracing();
        let peers: Vec<Peer> = (0..size)
            .map(|i| Peer::new("127.0.0.1", base_port + i))
            .collect();
        let members: Vec<String> = peers.iter().map(Peer::address).collect();

        let mut nodes = Vec::new();
        for peer in peers {
            let dir = tempfile::tempdir().unwrap();
            nodes.push(node_with(&transport, rpc.clone(), peer, &members, dir, tune).await);
        }
        Cluster {
            transport,
            rpc,
            nodes,
            members,
        }
    }

    pub async fn start_all(&self) {
        for node in &self.nodes {
            node.server.start().await.unwrap();
        }
    }

    pub fn node(&self, peer: &Peer) -> &Node {
        self.nodes.iter().find(|n| &n.peer == peer).unwrap()
    }

    /// Wait until every live node agrees on a leader of `group`
    pub async fn wait_for_leader(&self, group: &str) -> Peer {
        let found = eventually(Duration::from_secs(20), move || async move {
            let leaders: Vec<Option<Peer>> = self
                .nodes
                .iter()
                .map(|n| n.server.leader_of(group))
                .collect();
            match leaders.first() {
                Some(Some(first)) if leaders.iter().all(|l| l.as_ref() == Some(first)) => {
                    let leader = first.clone();
                    self.nodes
                        .iter()
                        .any(|n| n.peer == leader && n.server.is_leader(group))
                        .then_some(leader)
                }
                _ => None,
            }
        })
        .await;
        found.unwrap_or_else(|| panic!("no leader elected for {}", group))
    }

    /// Take a node off the transport and stop it
    pub async fn kill(&mut self, peer: &Peer) -> Node {
        self.transport.unregister(peer);
        let index = self.nodes.iter().position(|n| &n.peer == peer).unwrap();
        let node = self.nodes.remove(index);
        node.server.shutdown().await;
        node
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.server.shutdown().await;
        }
    }
}

/// Poll `check` until it yields a value or `deadline` passes
pub async fn eventually<T, F, Fut>(deadline: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if let Some(value) = check().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}
