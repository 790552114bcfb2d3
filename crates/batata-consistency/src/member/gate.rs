// Membership gate
// New host cluster members must answer a TCP probe before they join raft groups

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::raft::types::Peer;

/// Receives peers that passed or left the gate
#[async_trait]
pub trait PeerAdmission: Send + Sync + 'static {
    async fn admit(&self, peer: &Peer);

    async fn remove(&self, peer: &Peer);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    WaitingProbe,
    Confirmed,
}

pub struct MembershipGate {
    admission: Arc<dyn PeerAdmission>,
    pending: DashMap<Peer, ProbeState>,
    /// `None` until the first member change has been seen
    known: parking_lot::Mutex<Option<BTreeSet<Peer>>>,
    probe_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    probe_timeout: Duration,
    probe_interval: Duration,
}

impl MembershipGate {
    pub fn new(
        admission: Arc<dyn PeerAdmission>,
        probe_timeout: Duration,
        probe_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            admission,
            pending: DashMap::new(),
            known: parking_lot::Mutex::new(None),
            probe_task: parking_lot::Mutex::new(None),
            probe_timeout,
            probe_interval,
        })
    }

    /// React to a new member list. The first list only seeds the known members.
    pub async fn on_members_changed(self: &Arc<Self>, members: BTreeSet<Peer>) {
        let (joined, left) = {
            let mut known = self.known.lock();
            let Some(previous) = known.as_ref() else {
                debug!(members = members.len(), "Initial member list recorded");
                *known = Some(members);
                return;
            };
            let joined: Vec<Peer> = members.difference(previous).cloned().collect();
            let left: Vec<Peer> = previous.difference(&members).cloned().collect();
            *known = Some(members);
            (joined, left)
        };

        for peer in &left {
            self.withdraw(peer);
            info!(peer = %peer, "Member left, removing from raft groups");
            self.admission.remove(peer).await;
        }

        if !joined.is_empty() {
            self.submit(joined);
        }
    }

    /// Queue peers for probing, replacing any running probe task
    pub fn submit(self: &Arc<Self>, peers: impl IntoIterator<Item = Peer>) {
        for peer in peers {
            debug!(peer = %peer, "Peer waiting for probe");
            self.pending.insert(peer, ProbeState::WaitingProbe);
        }

        let gate = self.clone();
        let task = tokio::spawn(async move { gate.run().await });
        if let Some(previous) = self.probe_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Drop a peer that has not been admitted yet
    pub fn withdraw(&self, peer: &Peer) -> bool {
        self.pending.remove(peer).is_some()
    }

    pub fn pending(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.pending.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    pub fn state(&self, peer: &Peer) -> Option<ProbeState> {
        self.pending.get(peer).map(|s| *s.value())
    }

    async fn run(&self) {
        while !self.pending.is_empty() {
            self.probe_cycle().await;
            if self.pending.is_empty() {
                break;
            }
            tokio::time::sleep(self.probe_interval).await;
        }
    }

    /// Probe every waiting peer once and admit the ones that answered
    pub async fn probe_cycle(&self) -> Vec<Peer> {
        let waiting: Vec<Peer> = self
            .pending
            .iter()
            .filter(|e| *e.value() == ProbeState::WaitingProbe)
            .map(|e| e.key().clone())
            .collect();

        let results = join_all(waiting.iter().map(|peer| probe(peer, self.probe_timeout))).await;

        let mut confirmed = Vec::new();
        for (peer, reachable) in waiting.into_iter().zip(results) {
            // Withdrawn while the probe was in flight
            if reachable && let Some(mut state) = self.pending.get_mut(&peer) {
                *state = ProbeState::Confirmed;
                confirmed.push(peer);
            }
        }

        let mut guard = AdmissionGuard {
            pending: &self.pending,
            remaining: confirmed.clone(),
        };
        for peer in &confirmed {
            info!(peer = %peer, "Peer reachable, adding to raft groups");
            self.admission.admit(peer).await;
            self.pending.remove(peer);
            guard.remaining.retain(|p| p != peer);
        }
        confirmed
    }

    pub fn stop(&self) {
        if let Some(task) = self.probe_task.lock().take() {
            task.abort();
        }
        self.pending.clear();
    }
}

/// Puts confirmed peers back to probing when their admission is dropped
/// before it finished, e.g. by a superseding `submit`
struct AdmissionGuard<'a> {
    pending: &'a DashMap<Peer, ProbeState>,
    remaining: Vec<Peer>,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        for peer in &self.remaining {
            if let Some(mut state) = self.pending.get_mut(peer) {
                *state = ProbeState::WaitingProbe;
            }
        }
    }
}

async fn probe(peer: &Peer, window: Duration) -> bool {
    match timeout(window, TcpStream::connect((peer.ip.as_str(), peer.port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(peer = %peer, "Probe failed: {}", e);
            false
        }
        Err(_) => {
            debug!(peer = %peer, "Probe timed out");
            false
        }
    }
}
