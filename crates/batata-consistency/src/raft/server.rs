// Multi-group Raft server
// Hosts one openraft instance per registered processor and routes commits and reads to leaders

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use openraft::error::{CheckIsLeaderError, ClientWriteError, InitializeError, RaftError};
use openraft::{BasicNode, ChangeMembers};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::closure::{FailoverClosure, ResponseFuture, RetryPolicy};
use super::config::{GroupPaths, RaftConfig};
use super::event::{RaftEvent, RaftEventPublisher, RaftMetadata};
use super::log_store::RocksLogStore;
use super::network::{GroupNetworkFactory, RaftRpc, RaftRpcReply, RaftTransport, RpcHandler};
use super::processor::LogProcessor;
use super::request::{LogEntry, ReadRequest, Response};
use super::route::RouteTable;
use super::state_machine::StateMachineAdapter;
use super::types::{NodeId, Peer, Raft, RaftMetrics, ServerState};
use crate::error::{ConsistencyError, Result};
use crate::member::{MemberChangeNotifier, MembershipGate, PeerAdmission};

/// Upper bound of the random delay added to each route refresh
const REFRESH_JITTER_MS: u64 = 5000;

/// Leader lookup asks the other members on every this many polls
const PEER_QUERY_EVERY: u32 = 50;

/// Period of the per-group metrics gauges
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Voters of the group as seen by the local engine
fn members_of(metrics: &RaftMetrics) -> Vec<Peer> {
    let membership = metrics.membership_config.membership();
    membership
        .voter_ids()
        .filter_map(|id| membership.get_node(&id).and_then(Peer::from_node))
        .collect()
}

fn leader_of(metrics: &RaftMetrics) -> Option<Peer> {
    let id = metrics.current_leader?;
    metrics
        .membership_config
        .membership()
        .get_node(&id)
        .and_then(Peer::from_node)
}

/// One hosted raft group
pub struct RaftGroup {
    name: String,
    local: Peer,
    raft: Raft,
    adapter: StateMachineAdapter,
    processor: Arc<dyn LogProcessor>,
    paths: GroupPaths,
    membership_timeout: Duration,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Whether the leader has replicated at least up to `index` to `id`
fn replicated_to(metrics: &RaftMetrics, id: NodeId, index: u64) -> bool {
    metrics
        .replication
        .as_ref()
        .and_then(|r| r.get(&id).copied().flatten())
        .is_some_and(|matched| matched.index >= index)
}

impl RaftGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn adapter(&self) -> &StateMachineAdapter {
        &self.adapter
    }

    pub fn processor(&self) -> &Arc<dyn LogProcessor> {
        &self.processor
    }

    pub fn paths(&self) -> &GroupPaths {
        &self.paths
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.raft.metrics().borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().state == ServerState::Leader
    }

    pub fn leader(&self) -> Option<Peer> {
        leader_of(&self.raft.metrics().borrow())
    }

    pub fn members(&self) -> Vec<Peer> {
        members_of(&self.raft.metrics().borrow())
    }

    fn not_leader(&self) -> ConsistencyError {
        ConsistencyError::NotLeader {
            group: self.name.clone(),
            leader: self.leader().map(|p| p.address()),
        }
    }

    /// Propose an entry through the local engine, which must be leader
    async fn apply_locally(&self, entry: LogEntry) -> Result<Response> {
        if let Some(err) = self.adapter.degraded_error() {
            return Err(err);
        }
        let resp = self
            .raft
            .client_write(entry)
            .await
            .map_err(|e| self.write_error(e))?;

        // Entries at or after a failed apply were not applied by the processor
        match self.adapter.apply_failure() {
            Some((failed, _)) if !resp.data.success && resp.log_id.index >= failed => {
                Err(ConsistencyError::ApplyFailure {
                    group: self.name.clone(),
                    index: resp.log_id.index,
                    message: resp.data.err_msg.unwrap_or_default(),
                })
            }
            _ => Ok(resp.data),
        }
    }

    fn write_error(
        &self,
        e: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>,
    ) -> ConsistencyError {
        match e {
            RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => {
                ConsistencyError::NotLeader {
                    group: self.name.clone(),
                    leader: fwd.leader_node.map(|n| n.addr),
                }
            }
            RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
                ConsistencyError::MembershipFailure {
                    group: self.name.clone(),
                    message: e.to_string(),
                }
            }
            RaftError::Fatal(fatal) => ConsistencyError::Raft(fatal.to_string()),
        }
    }

    /// Confirm leadership with a quorum; returns the index that reads must observe
    async fn read_index_locally(&self) -> Result<Option<u64>> {
        match self.raft.ensure_linearizable().await {
            Ok(log_id) => Ok(log_id.map(|l| l.index)),
            Err(RaftError::APIError(CheckIsLeaderError::ForwardToLeader(fwd))) => {
                Err(ConsistencyError::NotLeader {
                    group: self.name.clone(),
                    leader: fwd.leader_node.map(|n| n.addr),
                })
            }
            Err(e) => Err(ConsistencyError::Raft(e.to_string())),
        }
    }

    /// Run one membership change, failing it once the window has passed
    async fn bounded<T>(&self, what: &str, change: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.membership_timeout, change).await {
            Ok(result) => result,
            Err(_) => Err(ConsistencyError::MembershipFailure {
                group: self.name.clone(),
                message: format!("{} timed out after {:?}", what, self.membership_timeout),
            }),
        }
    }

    /// Add `peer` as a learner and wait until its log has caught up
    async fn add_learner(&self, peer: &Peer) -> Result<()> {
        let id = peer.node_id();
        let resp = self
            .raft
            .add_learner(id, peer.to_node(), false)
            .await
            .map_err(|e| self.write_error(e))?;
        let index = resp.log_id.index;
        self.raft
            .wait(Some(self.membership_timeout))
            .metrics(
                |m| replicated_to(m, id, index),
                format!("learner {} catch up", peer),
            )
            .await
            .map_err(|e| ConsistencyError::MembershipFailure {
                group: self.name.clone(),
                message: format!("learner {} did not catch up: {}", peer, e),
            })?;
        Ok(())
    }

    async fn add_peer_locally(&self, peer: &Peer) -> Result<()> {
        if self.members().contains(peer) {
            return Ok(());
        }
        let id = peer.node_id();
        let result = self
            .bounded("add peer", async {
                self.add_learner(peer).await?;
                self.raft
                    .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
                    .await
                    .map_err(|e| self.write_error(e))
            })
            .await;
        if let Err(e) = result {
            self.drop_learner(id).await;
            return Err(e);
        }
        info!(group = %self.name, peer = %peer, "Peer added to raft group");
        Ok(())
    }

    /// Forget a learner left behind by a failed add; best effort
    async fn drop_learner(&self, id: NodeId) {
        let is_learner = self
            .metrics()
            .membership_config
            .membership()
            .learner_ids()
            .any(|l| l == id);
        if !is_learner || !self.is_leader() {
            return;
        }
        let result = self
            .bounded("drop learner", async {
                self.raft
                    .change_membership(ChangeMembers::RemoveNodes(BTreeSet::from([id])), false)
                    .await
                    .map_err(|e| self.write_error(e))
            })
            .await;
        if let Err(e) = result {
            warn!(group = %self.name, node = id, "Failed to drop learner: {}", e);
        }
    }

    async fn remove_peers_locally(&self, peers: &[Peer]) -> Result<()> {
        let members = self.members();
        let ids: BTreeSet<NodeId> = peers
            .iter()
            .filter(|p| members.contains(p))
            .map(Peer::node_id)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.bounded("remove peers", async {
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(ids), false)
                .await
                .map_err(|e| self.write_error(e))
        })
        .await?;
        info!(group = %self.name, peers = ?peers, "Peers removed from raft group");
        Ok(())
    }

    async fn change_peers_locally(&self, peers: &[Peer]) -> Result<()> {
        if peers.is_empty() {
            return Err(ConsistencyError::MembershipFailure {
                group: self.name.clone(),
                message: "new configuration is empty".to_string(),
            });
        }
        let known: BTreeSet<NodeId> = self
            .metrics()
            .membership_config
            .membership()
            .nodes()
            .map(|(id, _)| *id)
            .collect();
        self.bounded("change peers", async {
            for peer in peers.iter().filter(|p| !known.contains(&p.node_id())) {
                self.add_learner(peer).await?;
            }
            let voters: BTreeSet<NodeId> = peers.iter().map(Peer::node_id).collect();
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(|e| self.write_error(e))
        })
        .await?;
        info!(group = %self.name, peers = ?peers, "Raft group configuration replaced");
        Ok(())
    }

    async fn trigger_election(&self) -> Result<()> {
        self.raft
            .trigger()
            .elect()
            .await
            .map_err(|e| ConsistencyError::Raft(e.to_string()))
    }

    async fn trigger_snapshot(&self) -> Result<()> {
        if !self.adapter.has_snapshot_operations() {
            return Err(ConsistencyError::SnapshotFailure {
                group: self.name.clone(),
                message: "group has no snapshot operations".to_string(),
            });
        }
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| ConsistencyError::Raft(e.to_string()))
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Routes operations of one group to its leader
#[derive(Clone)]
struct Dispatcher {
    group: Arc<RaftGroup>,
    route_table: Arc<RouteTable>,
    transport: Arc<dyn RaftTransport>,
    lookup_timeout: Duration,
    lookup_interval: Duration,
    read_timeout: Duration,
}

impl Dispatcher {
    /// Poll the local engine and the route table until a leader is known
    async fn find_leader(&self) -> Result<Peer> {
        let started = Instant::now();
        let mut polls: u32 = 0;
        loop {
            if let Some(leader) = self.group.leader() {
                return Ok(leader);
            }
            if let Some(leader) = self.route_table.select_leader(&self.group.name) {
                return Ok(leader);
            }
            if polls % PEER_QUERY_EVERY == 0 {
                let members = self.known_members();
                if let Some(leader) =
                    query_leader(&self.group, &members, self.transport.as_ref()).await
                {
                    return Ok(leader);
                }
            }
            polls = polls.wrapping_add(1);
            if started.elapsed() >= self.lookup_timeout {
                return Err(ConsistencyError::NoLeader {
                    group: self.group.name.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.lookup_interval).await;
        }
    }

    /// Engine membership, or the routed configuration while this node has none
    fn known_members(&self) -> Vec<Peer> {
        let members = self.group.members();
        if members.is_empty() {
            self.route_table
                .configuration(&self.group.name)
                .into_iter()
                .collect()
        } else {
            members
        }
    }

    async fn call_leader(&self, rpc: RaftRpc) -> Result<RaftRpcReply> {
        let leader = self.find_leader().await?;
        debug!(group = %self.group.name, leader = %leader, rpc = rpc.name(), "Forwarding to leader");
        self.transport
            .call(&leader, rpc)
            .await?
            .into_result(&self.group.name)
    }

    fn unexpected(&self, reply: RaftRpcReply) -> ConsistencyError {
        ConsistencyError::Transport(format!(
            "unexpected reply for group {}: {:?}",
            self.group.name, reply
        ))
    }

    async fn commit_once(&self, entry: LogEntry) -> Result<Response> {
        if self.group.is_leader() {
            return self.group.apply_locally(entry).await;
        }
        let leader = self.find_leader().await?;
        if leader == self.group.local {
            return self.group.apply_locally(entry).await;
        }
        let rpc = RaftRpc::Commit {
            group: self.group.name.clone(),
            entry,
        };
        match self
            .transport
            .call(&leader, rpc)
            .await?
            .into_result(&self.group.name)?
        {
            RaftRpcReply::Response(response) => Ok(response),
            other => Err(self.unexpected(other)),
        }
    }

    async fn commit(&self, entry: LogEntry, retries: u32) -> Result<Response> {
        RetryPolicy::failover(retries)
            .run("commit", |_| self.commit_once(entry.clone()))
            .await
    }

    /// Wait until the local state machine has caught up with the leader's commit index
    async fn read_index(&self) -> Result<()> {
        if self.group.is_leader() {
            self.group.read_index_locally().await?;
            return Ok(());
        }
        let reply = self
            .call_leader(RaftRpc::ReadIndex {
                group: self.group.name.clone(),
            })
            .await?;
        let index = match reply {
            RaftRpcReply::ReadIndex(index) => index,
            other => return Err(self.unexpected(other)),
        };
        self.group
            .raft
            .wait(Some(self.read_timeout))
            .applied_index_at_least(index, "read index")
            .await
            .map_err(|e| ConsistencyError::Raft(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, request: ReadRequest, retries: u32) -> Result<Response> {
        if let Some(err) = self.group.adapter.degraded_error() {
            return Err(err);
        }
        match self.read_index().await {
            Ok(()) => self
                .group
                .processor
                .on_request(&request)
                .await
                .map_err(|e| ConsistencyError::Rejected {
                    group: self.group.name.clone(),
                    message: format!("{:#}", e),
                }),
            Err(e) => {
                warn!(
                    group = %self.group.name,
                    "Read index failed, reading through the log: {}",
                    e
                );
                let entry = LogEntry::read(&request)?;
                self.commit(entry, retries).await
            }
        }
    }

    async fn add_peer(&self, peer: &Peer) -> Result<()> {
        if self.group.is_leader() {
            return self.group.add_peer_locally(peer).await;
        }
        self.call_leader(RaftRpc::AddPeer {
            group: self.group.name.clone(),
            peer: peer.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn remove_peers(&self, peers: &[Peer]) -> Result<()> {
        if self.group.is_leader() {
            return self.group.remove_peers_locally(peers).await;
        }
        self.call_leader(RaftRpc::RemovePeers {
            group: self.group.name.clone(),
            peers: peers.to_vec(),
        })
        .await
        .map(|_| ())
    }

    async fn change_peers(&self, peers: &[Peer]) -> Result<()> {
        if self.group.is_leader() {
            return self.group.change_peers_locally(peers).await;
        }
        self.call_leader(RaftRpc::ChangePeers {
            group: self.group.name.clone(),
            peers: peers.to_vec(),
        })
        .await
        .map(|_| ())
    }
}

/// Ask the other members who leads `group`
async fn query_leader(
    group: &RaftGroup,
    members: &[Peer],
    transport: &dyn RaftTransport,
) -> Option<Peer> {
    for peer in members.iter().filter(|p| **p != group.local) {
        let rpc = RaftRpc::GetLeader {
            group: group.name.clone(),
        };
        match transport.call(peer, rpc).await {
            Ok(RaftRpcReply::Leader(Some(found))) => return Some(found),
            Ok(_) => {}
            Err(e) => debug!(group = %group.name, peer = %peer, "Leader query failed: {}", e),
        }
    }
    None
}

/// Refresh the route entry of `group` and republish its leadership
async fn refresh_route(
    group: &RaftGroup,
    route_table: &RouteTable,
    transport: &dyn RaftTransport,
    events: &RaftEventPublisher,
) {
    let metrics = group.metrics();
    let mut members = members_of(&metrics);
    if members.is_empty() {
        // Not joined yet; keep the configured members
        members = route_table.configuration(&group.name).into_iter().collect();
    } else {
        route_table.update_configuration(&group.name, members.iter().cloned().collect());
    }

    let mut leader = leader_of(&metrics);
    if leader.is_none() {
        leader = query_leader(group, &members, transport).await;
    }

    route_table.update_leader(&group.name, leader.clone(), metrics.current_term);
    events.publish(RaftEvent::new(
        group.name.clone(),
        leader,
        Some(metrics.current_term),
        members,
    ));
}

/// Process-wide raft orchestrator
pub struct RaftServer {
    config: RaftConfig,
    local: Peer,
    transport: Arc<dyn RaftTransport>,
    groups: DashMap<String, Arc<RaftGroup>>,
    pending: parking_lot::Mutex<Vec<Arc<dyn LogProcessor>>>,
    creating: tokio::sync::Mutex<()>,
    route_table: Arc<RouteTable>,
    events: RaftEventPublisher,
    metadata: Arc<RaftMetadata>,
    gate: parking_lot::Mutex<Option<Arc<MembershipGate>>>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown: AtomicBool,
}

impl RaftServer {
    pub fn new(config: RaftConfig, transport: Arc<dyn RaftTransport>) -> Result<Arc<Self>> {
        let local: Peer = config
            .self_member
            .parse()
            .map_err(|e| ConsistencyError::Startup(format!("invalid self member: {}", e)))?;
        Ok(Arc::new(Self {
            config,
            local,
            transport,
            groups: DashMap::new(),
            pending: parking_lot::Mutex::new(Vec::new()),
            creating: tokio::sync::Mutex::new(()),
            route_table: Arc::new(RouteTable::new()),
            events: RaftEventPublisher::default(),
            metadata: Arc::new(RaftMetadata::new()),
            gate: parking_lot::Mutex::new(None),
            background: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    pub fn route_table(&self) -> &Arc<RouteTable> {
        &self.route_table
    }

    pub fn metadata(&self) -> &Arc<RaftMetadata> {
        &self.metadata
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RaftEvent> {
        self.events.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn group(&self, name: &str) -> Option<Arc<RaftGroup>> {
        self.groups.get(name).map(|g| g.value().clone())
    }

    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|g| g.key().clone()).collect();
        names.sort();
        names
    }

    pub fn leader_of(&self, group: &str) -> Option<Peer> {
        self.group(group).and_then(|g| g.leader())
    }

    pub fn is_leader(&self, group: &str) -> bool {
        self.group(group).is_some_and(|g| g.is_leader())
    }

    pub fn members_of(&self, group: &str) -> Vec<Peer> {
        self.group(group).map(|g| g.members()).unwrap_or_default()
    }

    fn find_group(&self, name: &str) -> Result<Arc<RaftGroup>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ConsistencyError::Shutdown);
        }
        self.group(name)
            .ok_or_else(|| ConsistencyError::NoSuchGroup(name.to_string()))
    }

    fn dispatcher(&self, group: Arc<RaftGroup>) -> Dispatcher {
        Dispatcher {
            group,
            route_table: self.route_table.clone(),
            transport: self.transport.clone(),
            lookup_timeout: self.config.leader_lookup_timeout(),
            lookup_interval: self.config.leader_lookup_interval(),
            read_timeout: self.config.rpc_timeout(),
        }
    }

    /// Register a processor. Before `start` it is queued; afterwards its group starts at once.
    pub async fn register(&self, processor: Arc<dyn LogProcessor>) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ConsistencyError::Shutdown);
        }
        let group = processor.group().to_string();
        let _guard = self.creating.lock().await;
        if self.groups.contains_key(&group) {
            return Err(ConsistencyError::DuplicateGroup(group));
        }
        if !self.is_started() {
            let mut pending = self.pending.lock();
            if pending.iter().any(|p| p.group() == group) {
                return Err(ConsistencyError::DuplicateGroup(group));
            }
            debug!(group = %group, "Raft group queued until start");
            pending.push(processor);
            return Ok(());
        }
        self.create_group(processor).await
    }

    /// Start every queued group. Any failure here is fatal for the node.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ConsistencyError::Shutdown);
        }
        let _guard = self.creating.lock().await;
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut rx = self.events.subscribe();
        let metadata = self.metadata.clone();
        self.background.lock().push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => metadata.update(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Raft event consumer lagged, {} events dropped", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let pending = std::mem::take(&mut *self.pending.lock());
        for processor in pending {
            let group = processor.group().to_string();
            if let Err(e) = self.create_group(processor).await {
                error!(group = %group, "Failed to start raft group: {}", e);
                return Err(e);
            }
        }

        info!(
            local = %self.local,
            groups = ?self.groups(),
            "Raft server started"
        );
        Ok(())
    }

    /// Build storage, state machine and engine of one group. Caller holds `creating`.
    async fn create_group(&self, processor: Arc<dyn LogProcessor>) -> Result<()> {
        let name = processor.group().to_string();
        let paths = self.config.group_paths(&name);
        paths
            .ensure_dirs()
            .map_err(|e| ConsistencyError::Startup(format!("{}: {}", name, e)))?;

        let adapter =
            StateMachineAdapter::open(processor.clone(), &paths.snapshot, self.events.clone())
                .map_err(|e| ConsistencyError::Startup(format!("{}: {}", name, e)))?;
        let snapshots = adapter.has_snapshot_operations();
        let raft_config = Arc::new(self.config.to_openraft_config(&name, snapshots)?);

        let log_store = RocksLogStore::open(&paths.log, &paths.meta)
            .await
            .map_err(|e| ConsistencyError::Startup(format!("{}: {}", name, e)))?;
        let network = GroupNetworkFactory::new(name.clone(), self.transport.clone());

        let raft = Raft::new(
            self.local.node_id(),
            raft_config,
            network,
            log_store,
            adapter.clone(),
        )
        .await
        .map_err(|e| ConsistencyError::Startup(format!("{}: {}", name, e)))?;

        let (initial, bootstrap) = self.initial_members()?;
        if bootstrap {
            self.initialize(&name, &raft, &initial).await?;
        } else {
            info!(group = %name, "Local node is not a configured member, waiting to join");
        }

        let group = Arc::new(RaftGroup {
            name: name.clone(),
            local: self.local.clone(),
            raft,
            adapter,
            processor,
            paths,
            membership_timeout: self.config.membership_timeout(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });
        self.route_table
            .update_configuration(&name, initial.iter().cloned().collect());

        let tasks = self.spawn_group_tasks(&group, snapshots);
        group.tasks.lock().extend(tasks);
        self.groups.insert(name.clone(), group);

        info!(
            group = %name,
            members = ?initial,
            snapshots,
            "Raft group started"
        );
        Ok(())
    }

    /// Configured members plus this node, and whether this node may bootstrap them.
    /// A node left out of a non-empty member list joins through self registration.
    fn initial_members(&self) -> Result<(Vec<Peer>, bool)> {
        let mut members = BTreeSet::new();
        for member in &self.config.members {
            let peer: Peer = member
                .parse()
                .map_err(|e| ConsistencyError::Startup(format!("invalid member: {}", e)))?;
            members.insert(peer);
        }
        let bootstrap = members.is_empty() || members.contains(&self.local);
        if bootstrap {
            members.insert(self.local.clone());
        }
        Ok((members.into_iter().collect(), bootstrap))
    }

    async fn initialize(&self, group: &str, raft: &Raft, members: &[Peer]) -> Result<()> {
        let nodes: BTreeMap<NodeId, BasicNode> =
            members.iter().map(|p| (p.node_id(), p.to_node())).collect();
        match raft.initialize(nodes).await {
            Ok(()) => {
                info!(group = %group, "Raft group initialized");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!(group = %group, "Raft group already initialized");
                Ok(())
            }
            Err(e) => Err(ConsistencyError::Startup(format!("{}: {}", group, e))),
        }
    }

    fn spawn_group_tasks(&self, group: &Arc<RaftGroup>, snapshots: bool) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            self.spawn_route_refresh(group),
            spawn_leadership_watcher(group.clone()),
            spawn_metrics_reporter(group.clone()),
            self.spawn_self_registration(group),
        ];
        if snapshots {
            tasks.push(spawn_snapshot_timer(
                group.clone(),
                self.config.snapshot_interval(),
            ));
        }
        tasks
    }

    fn spawn_route_refresh(&self, group: &Arc<RaftGroup>) -> JoinHandle<()> {
        let group = group.clone();
        let route_table = self.route_table.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let base = self.config.election_timeout();
        tokio::spawn(async move {
            loop {
                let jitter = rand::rng().random_range(0..REFRESH_JITTER_MS);
                tokio::time::sleep(base + Duration::from_millis(jitter)).await;
                refresh_route(&group, &route_table, transport.as_ref(), &events).await;
            }
        })
    }

    /// Ask the leader to add this node until it shows up as a voter.
    /// Ends on the first check for a node that is already a member.
    fn spawn_self_registration(&self, group: &Arc<RaftGroup>) -> JoinHandle<()> {
        let dispatcher = self.dispatcher(group.clone());
        let local = self.local.clone();
        let period = self.config.election_timeout();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if dispatcher.group.members().contains(&local) {
                    debug!(group = %dispatcher.group.name, "Local node is a member");
                    break;
                }
                if let Err(e) = dispatcher.add_peer(&local).await {
                    warn!(
                        group = %dispatcher.group.name,
                        "Self registration failed, will retry: {}",
                        e
                    );
                }
            }
        })
    }

    /// Commit an entry with the configured failover retries
    pub fn commit(&self, entry: LogEntry) -> ResponseFuture {
        self.commit_with_retries(entry, self.config.failover_retries)
    }

    /// Commit an entry; the future resolves once the entry is applied on the leader
    pub fn commit_with_retries(&self, entry: LogEntry, retries: u32) -> ResponseFuture {
        let (closure, future) = FailoverClosure::new(retries);
        let dispatcher = match self.find_group(&entry.group) {
            Ok(group) => self.dispatcher(group),
            Err(e) => {
                closure.resolve(Err(e));
                return future;
            }
        };
        tokio::spawn(async move {
            let retries = closure.retries_left();
            let result = dispatcher.commit(entry, retries).await;
            closure.resolve(result);
        });
        future
    }

    /// Linearizable read with the configured failover retries
    pub fn get(&self, request: ReadRequest) -> ResponseFuture {
        self.get_with_retries(request, self.config.failover_retries)
    }

    /// Linearizable read; falls back to reading through the log when read index fails
    pub fn get_with_retries(&self, request: ReadRequest, retries: u32) -> ResponseFuture {
        let (closure, future) = FailoverClosure::new(retries);
        let dispatcher = match self.find_group(&request.group) {
            Ok(group) => self.dispatcher(group),
            Err(e) => {
                closure.resolve(Err(e));
                return future;
            }
        };
        tokio::spawn(async move {
            let retries = closure.retries_left();
            let result = dispatcher.get(request, retries).await;
            closure.resolve(result);
        });
        future
    }

    fn membership_policy(&self) -> RetryPolicy {
        RetryPolicy::membership(
            self.config.membership_attempts(),
            self.config.membership_retry_delay(),
        )
    }

    fn all_groups(&self) -> Vec<Arc<RaftGroup>> {
        self.groups.iter().map(|g| g.value().clone()).collect()
    }

    /// Add `peer` as a voter of every hosted group. Failures are logged per group.
    pub async fn add_node(&self, peer: &Peer) -> Result<()> {
        let mut last_error = None;
        for group in self.all_groups() {
            if group.members().contains(peer) {
                debug!(group = %group.name, peer = %peer, "Peer already a member");
                continue;
            }
            let dispatcher = self.dispatcher(group.clone());
            let result = self
                .membership_policy()
                .run("add peer", |_| dispatcher.add_peer(peer))
                .await;
            match result {
                Ok(()) => {
                    refresh_route(&group, &self.route_table, self.transport.as_ref(), &self.events)
                        .await
                }
                Err(e) => {
                    error!(group = %group.name, peer = %peer, "Abandoned adding peer: {}", e);
                    last_error = Some(ConsistencyError::MembershipFailure {
                        group: group.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    /// Remove `peer` from every hosted group. Failures are logged per group.
    pub async fn remove_node(&self, peer: &Peer) -> Result<()> {
        let mut last_error = None;
        for group in self.all_groups() {
            if !group.members().contains(peer) {
                debug!(group = %group.name, peer = %peer, "Peer not a member");
                continue;
            }
            let dispatcher = self.dispatcher(group.clone());
            let peers = [peer.clone()];
            let result = self
                .membership_policy()
                .run("remove peer", |_| dispatcher.remove_peers(&peers))
                .await;
            match result {
                Ok(()) => {
                    refresh_route(&group, &self.route_table, self.transport.as_ref(), &self.events)
                        .await
                }
                Err(e) => {
                    error!(group = %group.name, peer = %peer, "Abandoned removing peer: {}", e);
                    last_error = Some(ConsistencyError::MembershipFailure {
                        group: group.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    /// Remove several peers from one group
    pub async fn remove_peers(&self, group: &str, peers: &[Peer]) -> Result<()> {
        let group = self.find_group(group)?;
        let dispatcher = self.dispatcher(group.clone());
        dispatcher.remove_peers(peers).await?;
        refresh_route(&group, &self.route_table, self.transport.as_ref(), &self.events).await;
        Ok(())
    }

    /// Replace the voter set of one group
    pub async fn change_peers(&self, group: &str, peers: &[Peer]) -> Result<()> {
        let group = self.find_group(group)?;
        let dispatcher = self.dispatcher(group.clone());
        dispatcher.change_peers(peers).await?;
        refresh_route(&group, &self.route_table, self.transport.as_ref(), &self.events).await;
        Ok(())
    }

    /// Make `target` campaign for leadership of `group`
    pub async fn transfer_leader(&self, group: &str, target: &Peer) -> Result<()> {
        let group = self.find_group(group)?;
        if !group.members().contains(target) {
            return Err(ConsistencyError::MembershipFailure {
                group: group.name.clone(),
                message: format!("{} is not a member", target),
            });
        }
        if *target == self.local {
            return group.trigger_election().await;
        }
        let rpc = RaftRpc::TriggerElection {
            group: group.name.clone(),
        };
        self.transport
            .call(target, rpc)
            .await?
            .into_result(&group.name)
            .map(|_| ())
    }

    /// Take a snapshot of `group` on `target`, or locally when `target` is `None`
    pub async fn do_snapshot(&self, group: &str, target: Option<&Peer>) -> Result<()> {
        let group = self.find_group(group)?;
        match target {
            Some(peer) if *peer != self.local => {
                let rpc = RaftRpc::TriggerSnapshot {
                    group: group.name.clone(),
                };
                self.transport
                    .call(peer, rpc)
                    .await?
                    .into_result(&group.name)
                    .map(|_| ())
            }
            _ => group.trigger_snapshot().await,
        }
    }

    /// Feed member changes of the host cluster into every group through a probing gate
    pub fn watch_members(self: &Arc<Self>, notifier: &MemberChangeNotifier) {
        let admission: Arc<dyn PeerAdmission> = Arc::new(ServerAdmission {
            server: Arc::downgrade(self),
        });
        let gate = MembershipGate::new(
            admission,
            Duration::from_millis(self.config.probe_timeout_ms),
            Duration::from_millis(self.config.probe_interval_ms),
        );
        if let Some(previous) = self.gate.lock().replace(gate.clone()) {
            previous.stop();
        }

        let mut rx = notifier.subscribe();
        self.background.lock().push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => gate.on_members_changed(event.members).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Member change listener lagged, {} events dropped", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn gate(&self) -> Option<Arc<MembershipGate>> {
        self.gate.lock().clone()
    }

    async fn dispatch_rpc(&self, rpc: RaftRpc) -> Result<RaftRpcReply> {
        let group = self.find_group(rpc.group())?;
        match rpc {
            RaftRpc::AppendEntries { request, .. } => group
                .raft
                .append_entries(request)
                .await
                .map(RaftRpcReply::AppendEntries)
                .map_err(|e| ConsistencyError::Raft(e.to_string())),
            RaftRpc::Vote { request, .. } => group
                .raft
                .vote(request)
                .await
                .map(RaftRpcReply::Vote)
                .map_err(|e| ConsistencyError::Raft(e.to_string())),
            RaftRpc::InstallSnapshot { request, .. } => group
                .raft
                .install_snapshot(request)
                .await
                .map(RaftRpcReply::InstallSnapshot)
                .map_err(|e| ConsistencyError::Raft(e.to_string())),
            RaftRpc::Commit { entry, .. } => {
                if !group.is_leader() {
                    return Err(group.not_leader());
                }
                group.apply_locally(entry).await.map(RaftRpcReply::Response)
            }
            RaftRpc::ReadIndex { .. } => group.read_index_locally().await.map(RaftRpcReply::ReadIndex),
            RaftRpc::GetLeader { .. } => Ok(RaftRpcReply::Leader(group.leader())),
            RaftRpc::AddPeer { peer, .. } => {
                if !group.is_leader() {
                    return Err(group.not_leader());
                }
                group.add_peer_locally(&peer).await?;
                Ok(RaftRpcReply::Done)
            }
            RaftRpc::RemovePeers { peers, .. } => {
                if !group.is_leader() {
                    return Err(group.not_leader());
                }
                group.remove_peers_locally(&peers).await?;
                Ok(RaftRpcReply::Done)
            }
            RaftRpc::ChangePeers { peers, .. } => {
                if !group.is_leader() {
                    return Err(group.not_leader());
                }
                group.change_peers_locally(&peers).await?;
                Ok(RaftRpcReply::Done)
            }
            RaftRpc::TriggerElection { .. } => {
                group.trigger_election().await?;
                Ok(RaftRpcReply::Done)
            }
            RaftRpc::TriggerSnapshot { .. } => {
                group.trigger_snapshot().await?;
                Ok(RaftRpcReply::Done)
            }
        }
    }

    /// Stop the gate, background tasks and every group engine, then close the transport
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(local = %self.local, "Shutting down raft server");

        if let Some(gate) = self.gate.lock().take() {
            gate.stop();
        }
        for task in self.background.lock().drain(..) {
            task.abort();
        }

        let groups = self.all_groups();
        self.groups.clear();
        for group in groups {
            group.abort_tasks();
            if let Err(e) = group.raft.shutdown().await {
                warn!(group = %group.name, "Raft engine shutdown failed: {}", e);
            }
            self.route_table.remove(&group.name);
            self.metadata.remove(&group.name);
            debug!(group = %group.name, "Raft group stopped");
        }

        self.transport.close().await;
        info!(local = %self.local, "Raft server shut down");
    }
}

#[async_trait]
impl RpcHandler for RaftServer {
    async fn handle(&self, rpc: RaftRpc) -> RaftRpcReply {
        let name = rpc.name();
        let group = rpc.group().to_string();
        match self.dispatch_rpc(rpc).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(group = %group, rpc = name, "Raft rpc failed: {}", e);
                RaftRpcReply::Error(e.to_remote())
            }
        }
    }
}

/// Membership gate callbacks routed into the server
struct ServerAdmission {
    server: Weak<RaftServer>,
}

#[async_trait]
impl PeerAdmission for ServerAdmission {
    async fn admit(&self, peer: &Peer) {
        if let Some(server) = self.server.upgrade()
            && let Err(e) = server.add_node(peer).await
        {
            warn!(peer = %peer, "Peer admission incomplete: {}", e);
        }
    }

    async fn remove(&self, peer: &Peer) {
        if let Some(server) = self.server.upgrade()
            && let Err(e) = server.remove_node(peer).await
        {
            warn!(peer = %peer, "Peer removal incomplete: {}", e);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Observed {
    state: ServerState,
    leader: Option<Peer>,
    term: u64,
    members: Vec<Peer>,
}

impl Observed {
    fn of(metrics: &RaftMetrics) -> Self {
        Self {
            state: metrics.state,
            leader: leader_of(metrics),
            term: metrics.current_term,
            members: members_of(metrics),
        }
    }
}

/// Turn engine metrics transitions into leadership callbacks on the adapter
fn spawn_leadership_watcher(group: Arc<RaftGroup>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = group.raft.metrics();
        let mut prev = Observed::of(&rx.borrow());
        let mut fatal_reported = false;

        while rx.changed().await.is_ok() {
            let metrics = rx.borrow().clone();
            let now = Observed::of(&metrics);
            let adapter = &group.adapter;

            let was_leader = prev.state == ServerState::Leader;
            let is_leader = now.state == ServerState::Leader;
            if is_leader && !was_leader {
                adapter.on_leader_start(group.local.clone(), now.term, now.members.clone());
            } else if was_leader && !is_leader {
                adapter.on_leader_stop(now.members.clone());
            }

            if !is_leader && prev.leader != now.leader {
                if let Some(old) = prev.leader.clone().filter(|p| *p != group.local) {
                    adapter.on_stop_following(old, now.members.clone());
                }
                if let Some(new) = now.leader.clone().filter(|p| *p != group.local) {
                    adapter.on_start_following(new, now.term, now.members.clone());
                }
            }

            if !fatal_reported && let Err(fatal) = &metrics.running_state {
                fatal_reported = true;
                adapter.on_error(&ConsistencyError::Raft(fatal.to_string()));
            }

            prev = now;
        }
        debug!(group = %group.name, "Leadership watcher stopped");
    })
}

fn spawn_snapshot_timer(group: Arc<RaftGroup>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            debug!(group = %group.name, "Snapshot timer fired");
            if let Err(e) = group.raft.trigger().snapshot().await {
                warn!(group = %group.name, "Failed to trigger snapshot: {}", e);
            }
        }
    })
}

fn spawn_metrics_reporter(group: Arc<RaftGroup>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_REPORT_INTERVAL);
        loop {
            interval.tick().await;
            let m = group.metrics();
            let name = group.name.clone();
            metrics::gauge!("raft_group_term", "group" => name.clone()).set(m.current_term as f64);
            metrics::gauge!("raft_group_is_leader", "group" => name.clone())
                .set(if m.state == ServerState::Leader { 1.0 } else { 0.0 });
            metrics::gauge!("raft_group_last_applied_index", "group" => name.clone())
                .set(m.last_applied.map_or(0, |l| l.index) as f64);
            metrics::gauge!("raft_group_members", "group" => name)
                .set(members_of(&m).len() as f64);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::network::{LocalTransport, TransportError};
    use std::sync::atomic::AtomicU32;

    struct Noop;

    #[async_trait]
    impl LogProcessor for Noop {
        fn group(&self) -> &str {
            "noop"
        }

        async fn on_request(&self, _request: &ReadRequest) -> anyhow::Result<Response> {
            Ok(Response::success())
        }

        async fn on_apply(&self, _entry: &LogEntry) -> anyhow::Result<Response> {
            Ok(Response::success())
        }
    }

    /// Refuses to apply the key `bad`
    struct Picky;

    #[async_trait]
    impl LogProcessor for Picky {
        fn group(&self) -> &str {
            "picky"
        }

        async fn on_request(&self, _request: &ReadRequest) -> anyhow::Result<Response> {
            Ok(Response::success())
        }

        async fn on_apply(&self, entry: &LogEntry) -> anyhow::Result<Response> {
            if entry.key == "bad" {
                anyhow::bail!("refusing {}", entry.key);
            }
            Ok(Response::success())
        }
    }

    /// Counts forwarded commits and fails them as unreachable
    #[derive(Default)]
    struct CountingTransport {
        commits: AtomicU32,
    }

    #[async_trait]
    impl RaftTransport for CountingTransport {
        async fn call(&self, target: &Peer, rpc: RaftRpc) -> std::result::Result<RaftRpcReply, TransportError> {
            if matches!(rpc, RaftRpc::Commit { .. }) {
                self.commits.fetch_add(1, Ordering::SeqCst);
            }
            Err(TransportError::Unreachable {
                peer: target.address(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn test_config(dir: &std::path::Path, members: &[&str]) -> RaftConfig {
        RaftConfig {
            data_dir: dir.to_path_buf(),
            self_member: "127.0.0.1:7001".to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
            election_timeout_ms: 60_000,
            heartbeat_interval_ms: 1000,
            leader_lookup_timeout_ms: 200,
            ..RaftConfig::default()
        }
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let server =
            RaftServer::new(test_config(dir.path(), &[]), Arc::new(LocalTransport::new())).unwrap();

        server.register(Arc::new(Noop)).await.unwrap();
        assert!(matches!(
            server.register(Arc::new(Noop)).await,
            Err(ConsistencyError::DuplicateGroup(g)) if g == "noop"
        ));
        assert!(server.groups().is_empty());
    }

    #[tokio::test]
    async fn test_register_after_start_creates_group() {
        let dir = tempfile::tempdir().unwrap();
        let server =
            RaftServer::new(test_config(dir.path(), &[]), Arc::new(LocalTransport::new())).unwrap();
        server.start().await.unwrap();

        server.register(Arc::new(Noop)).await.unwrap();
        assert_eq!(server.groups(), vec!["noop".to_string()]);
        assert!(dir.path().join("noop").join("log").is_dir());
        assert!(dir.path().join("noop").join("snapshot").is_dir());
        assert!(dir.path().join("noop").join("meta-data").is_dir());

        assert!(matches!(
            server.register(Arc::new(Noop)).await,
            Err(ConsistencyError::DuplicateGroup(_))
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let dir = tempfile::tempdir().unwrap();
        let server =
            RaftServer::new(test_config(dir.path(), &[]), Arc::new(LocalTransport::new())).unwrap();
        server.start().await.unwrap();

        let result = server.commit(LogEntry::modify("missing", "k", "put")).await;
        assert!(matches!(result, Err(ConsistencyError::NoSuchGroup(_))));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_node_commit_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), &[]);
        config.election_timeout_ms = 300;
        config.heartbeat_interval_ms = 50;
        config.leader_lookup_timeout_ms = 5000;
        let server = RaftServer::new(config, Arc::new(LocalTransport::new())).unwrap();
        server.register(Arc::new(Noop)).await.unwrap();
        server.start().await.unwrap();

        let response = server
            .commit(LogEntry::modify("noop", "k", "put"))
            .await
            .unwrap();
        assert!(response.success);
        assert!(server.is_leader("noop"));
        assert_eq!(server.leader_of("noop"), Some(server.local().clone()));

        let response = server
            .get(ReadRequest::new("noop", Vec::new()))
            .await
            .unwrap();
        assert!(response.success);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_commit_forward_retries_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &["127.0.0.1:7001", "127.0.0.1:7002"]);
        let transport = Arc::new(CountingTransport::default());
        let server = RaftServer::new(config, transport.clone()).unwrap();
        server.register(Arc::new(Noop)).await.unwrap();
        server.start().await.unwrap();

        let fake_leader = Peer::new("127.0.0.1", 7002);
        server
            .route_table()
            .update_leader("noop", Some(fake_leader), 100);

        let result = server
            .commit_with_retries(LogEntry::modify("noop", "k", "put"), 2)
            .await;
        assert!(matches!(result, Err(ConsistencyError::Transport(_))));
        assert_eq!(transport.commits.load(Ordering::SeqCst), 3);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_commit_without_leader_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), &["127.0.0.1:7001", "127.0.0.1:7002"]);
        let server = RaftServer::new(config, Arc::new(CountingTransport::default())).unwrap();
        server.register(Arc::new(Noop)).await.unwrap();
        server.start().await.unwrap();

        let result = server
            .commit_with_retries(LogEntry::modify("noop", "k", "put"), 0)
            .await;
        assert!(matches!(result, Err(ConsistencyError::NoLeader { .. })));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_apply_stops_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), &[]);
        config.election_timeout_ms = 300;
        config.heartbeat_interval_ms = 50;
        config.leader_lookup_timeout_ms = 5000;
        let server = RaftServer::new(config, Arc::new(LocalTransport::new())).unwrap();
        server.register(Arc::new(Picky)).await.unwrap();
        server.start().await.unwrap();

        let response = server
            .commit_with_retries(LogEntry::modify("picky", "a", "put"), 0)
            .await
            .unwrap();
        assert!(response.success);

        let result = server
            .commit_with_retries(LogEntry::modify("picky", "bad", "put"), 0)
            .await;
        match result {
            Err(ConsistencyError::ApplyFailure { group, message, .. }) => {
                assert_eq!(group, "picky");
                assert!(message.contains("refusing bad"), "{}", message);
            }
            other => panic!("expected apply failure, got {:?}", other),
        }

        // Later writes and reads are refused until the group is restarted
        assert!(matches!(
            server
                .commit_with_retries(LogEntry::modify("picky", "c", "put"), 0)
                .await,
            Err(ConsistencyError::ApplyFailure { .. })
        ));
        assert!(matches!(
            server
                .get_with_retries(ReadRequest::new("picky", Vec::new()), 0)
                .await,
            Err(ConsistencyError::ApplyFailure { .. })
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_unreachable_node_fails_in_bounded_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), &[]);
        config.election_timeout_ms = 300;
        config.heartbeat_interval_ms = 50;
        config.leader_lookup_timeout_ms = 5000;
        config.membership_timeout_ms = 500;
        config.membership_retry_delay_ms = 100;
        let server = RaftServer::new(config, Arc::new(LocalTransport::new())).unwrap();
        server.register(Arc::new(Noop)).await.unwrap();
        server.start().await.unwrap();
        assert!(server
            .commit(LogEntry::modify("noop", "k", "put"))
            .await
            .unwrap()
            .success);

        let absent = Peer::new("127.0.0.1", 7009);
        let result = tokio::time::timeout(Duration::from_secs(20), server.add_node(&absent))
            .await
            .expect("add_node must give up on an unreachable peer");
        assert!(matches!(
            result,
            Err(ConsistencyError::MembershipFailure { .. })
        ));
        assert!(!server.members_of("noop").contains(&absent));

        // The group still commits with its single voter
        let response = server
            .commit(LogEntry::modify("noop", "k", "put"))
            .await
            .unwrap();
        assert!(response.success);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_rpc_for_unknown_group_replies_error() {
        let dir = tempfile::tempdir().unwrap();
        let server =
            RaftServer::new(test_config(dir.path(), &[]), Arc::new(LocalTransport::new())).unwrap();
        let reply = server
            .handle(RaftRpc::GetLeader {
                group: "missing".to_string(),
            })
            .await;
        assert!(matches!(
            reply.into_result("missing"),
            Err(ConsistencyError::NoSuchGroup(_))
        ));
    }
}
