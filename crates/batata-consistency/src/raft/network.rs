// Raft network layer
// One transport is shared by every group; each RPC names the group it targets

use std::io;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::request::{LogEntry, Response};
use super::types::{NodeId, Peer, TypeConfig};
use crate::error::{ConsistencyError, RemoteError};

/// Type alias for Raft RPC errors with default infallible application error
pub type RPCErr<E = openraft::error::Infallible> =
    RPCError<NodeId, BasicNode, RaftError<NodeId, E>>;

/// Every call a peer can make to another peer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RaftRpc {
    AppendEntries {
        group: String,
        request: AppendEntriesRequest<TypeConfig>,
    },
    Vote {
        group: String,
        request: VoteRequest<NodeId>,
    },
    InstallSnapshot {
        group: String,
        request: InstallSnapshotRequest<TypeConfig>,
    },
    /// Apply an entry on the leader
    Commit { group: String, entry: LogEntry },
    /// Confirm leadership and return the commit index to read at
    ReadIndex { group: String },
    GetLeader { group: String },
    AddPeer { group: String, peer: Peer },
    RemovePeers { group: String, peers: Vec<Peer> },
    /// Replace the voter set
    ChangePeers { group: String, peers: Vec<Peer> },
    TriggerElection { group: String },
    TriggerSnapshot { group: String },
}

impl RaftRpc {
    pub fn group(&self) -> &str {
        match self {
            RaftRpc::AppendEntries { group, .. }
            | RaftRpc::Vote { group, .. }
            | RaftRpc::InstallSnapshot { group, .. }
            | RaftRpc::Commit { group, .. }
            | RaftRpc::ReadIndex { group }
            | RaftRpc::GetLeader { group }
            | RaftRpc::AddPeer { group, .. }
            | RaftRpc::RemovePeers { group, .. }
            | RaftRpc::ChangePeers { group, .. }
            | RaftRpc::TriggerElection { group }
            | RaftRpc::TriggerSnapshot { group } => group,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RaftRpc::AppendEntries { .. } => "append_entries",
            RaftRpc::Vote { .. } => "vote",
            RaftRpc::InstallSnapshot { .. } => "install_snapshot",
            RaftRpc::Commit { .. } => "commit",
            RaftRpc::ReadIndex { .. } => "read_index",
            RaftRpc::GetLeader { .. } => "get_leader",
            RaftRpc::AddPeer { .. } => "add_peer",
            RaftRpc::RemovePeers { .. } => "remove_peers",
            RaftRpc::ChangePeers { .. } => "change_peers",
            RaftRpc::TriggerElection { .. } => "trigger_election",
            RaftRpc::TriggerSnapshot { .. } => "trigger_snapshot",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpcReply {
    AppendEntries(AppendEntriesResponse<NodeId>),
    Vote(VoteResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),
    Response(Response),
    ReadIndex(Option<u64>),
    Leader(Option<Peer>),
    Done,
    Error(RemoteError),
}

impl RaftRpcReply {
    /// Turn an error reply into a local error; other replies pass through
    pub fn into_result(self, group: &str) -> Result<RaftRpcReply, ConsistencyError> {
        match self {
            RaftRpcReply::Error(e) => Err(e.into_error(group)),
            reply => Ok(reply),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {peer} unreachable: {message}")]
    Unreachable { peer: String, message: String },

    #[error("request to {peer} failed: {message}")]
    Network { peer: String, message: String },
}

impl From<TransportError> for ConsistencyError {
    fn from(e: TransportError) -> Self {
        ConsistencyError::Transport(e.to_string())
    }
}

/// Carries RPCs between peers
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn call(&self, target: &Peer, rpc: RaftRpc) -> Result<RaftRpcReply, TransportError>;

    /// Release connections; calls after close may fail
    async fn close(&self) {}
}

/// Serves RPCs addressed to this node
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, rpc: RaftRpc) -> RaftRpcReply;
}

/// In-process transport; every registered node is reachable by address
#[derive(Clone, Default)]
pub struct LocalTransport {
    routes: Arc<DashMap<String, Weak<dyn RpcHandler>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: &Peer, handler: &Arc<dyn RpcHandler>) {
        self.routes.insert(peer.address(), Arc::downgrade(handler));
    }

    /// Make a peer unreachable, as if its process died
    pub fn unregister(&self, peer: &Peer) {
        self.routes.remove(&peer.address());
    }

    fn route(&self, peer: &Peer) -> Option<Arc<dyn RpcHandler>> {
        self.routes.get(&peer.address()).and_then(|h| h.upgrade())
    }
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn call(&self, target: &Peer, rpc: RaftRpc) -> Result<RaftRpcReply, TransportError> {
        let handler = self
            .route(target)
            .ok_or_else(|| TransportError::Unreachable {
                peer: target.address(),
                message: "no route".to_string(),
            })?;
        Ok(handler.handle(rpc).await)
    }
}

/// Creates engine connections for one group over the shared transport
#[derive(Clone)]
pub struct GroupNetworkFactory {
    group: String,
    transport: Arc<dyn RaftTransport>,
}

impl GroupNetworkFactory {
    pub fn new(group: impl Into<String>, transport: Arc<dyn RaftTransport>) -> Self {
        Self {
            group: group.into(),
            transport,
        }
    }
}

/// An engine connection to one peer of one group
pub struct GroupConnection {
    group: String,
    target_addr: String,
    transport: Arc<dyn RaftTransport>,
}

impl RaftNetworkFactory<TypeConfig> for GroupNetworkFactory {
    type Network = GroupConnection;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        GroupConnection {
            group: self.group.clone(),
            target_addr: node.addr.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl GroupConnection {
    async fn send<E>(&self, rpc: RaftRpc) -> Result<RaftRpcReply, RPCErr<E>>
    where
        E: std::error::Error,
    {
        let peer = Peer::from_str(&self.target_addr)
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;
        let name = rpc.name();

        let reply = self.transport.call(&peer, rpc).await.map_err(|e| match e {
            TransportError::Unreachable { .. } => RPCError::Unreachable(Unreachable::new(&e)),
            TransportError::Network { .. } => RPCError::Network(NetworkError::new(&e)),
        })?;

        match reply {
            RaftRpcReply::Error(remote) => {
                debug!(
                    group = %self.group,
                    peer = %peer,
                    rpc = name,
                    "Remote raft rpc failed: {}",
                    remote.message
                );
                Err(RPCError::Network(NetworkError::new(&io::Error::other(
                    remote.message,
                ))))
            }
            reply => Ok(reply),
        }
    }
}

fn unexpected_reply<E: std::error::Error>(reply: &RaftRpcReply) -> RPCErr<E> {
    RPCError::Network(NetworkError::new(&io::Error::other(format!(
        "unexpected reply: {:?}",
        reply
    ))))
}

impl RaftNetwork<TypeConfig> for GroupConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCErr> {
        let request = RaftRpc::AppendEntries {
            group: self.group.clone(),
            request: rpc,
        };
        match self.send(request).await? {
            RaftRpcReply::AppendEntries(resp) => Ok(resp),
            other => Err(unexpected_reply(&other)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCErr<InstallSnapshotError>> {
        let request = RaftRpc::InstallSnapshot {
            group: self.group.clone(),
            request: rpc,
        };
        match self.send(request).await? {
            RaftRpcReply::InstallSnapshot(resp) => Ok(resp),
            other => Err(unexpected_reply(&other)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCErr> {
        let request = RaftRpc::Vote {
            group: self.group.clone(),
            request: rpc,
        };
        match self.send(request).await? {
            RaftRpcReply::Vote(resp) => Ok(resp),
            other => Err(unexpected_reply(&other)),
        }
    }
}
