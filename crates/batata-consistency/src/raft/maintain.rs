// Raft maintenance operations
// Administrative commands keyed by name, applied to one group or to every group

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::server::RaftServer;
use super::types::{Peer, parse_peers};
use crate::error::{ConsistencyError, Result};

pub const GROUP_ID: &str = "groupId";
pub const COMMAND: &str = "command";
pub const VALUE: &str = "value";

const PARAMETER_ERROR: i32 = 400;
const SERVER_ERROR: i32 = 500;

/// REST API result type with convenient builder methods
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestResult<T> {
    pub code: i32,
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> RestResult<T> {
    pub fn ok(data: Option<T>) -> Self {
        RestResult {
            code: 0,
            message: Some("success".to_string()),
            data,
        }
    }

    pub fn err(code: i32, message: &str) -> Self {
        RestResult {
            code,
            message: Some(message.to_string()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaintainCommand {
    TransferLeader,
    ResetRaftCluster,
    DoSnapshot,
    RemovePeer,
    RemovePeers,
    ChangePeers,
}

impl FromStr for MaintainCommand {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transferLeader" => Ok(MaintainCommand::TransferLeader),
            "resetRaftCluster" => Ok(MaintainCommand::ResetRaftCluster),
            "doSnapshot" => Ok(MaintainCommand::DoSnapshot),
            "removePeer" => Ok(MaintainCommand::RemovePeer),
            "removePeers" => Ok(MaintainCommand::RemovePeers),
            "changePeers" => Ok(MaintainCommand::ChangePeers),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

/// Argument errors answer with a parameter error, everything else with a server error
fn error_code(e: &ConsistencyError) -> i32 {
    match e {
        ConsistencyError::InvalidPeer(_) | ConsistencyError::NoSuchGroup(_) => PARAMETER_ERROR,
        _ => SERVER_ERROR,
    }
}

fn required(value: Option<&str>) -> Result<&str> {
    value.ok_or_else(|| ConsistencyError::InvalidPeer(format!("{} is required", VALUE)))
}

fn required_peers(value: Option<&str>) -> Result<Vec<Peer>> {
    let peers = parse_peers(required(value)?)?;
    if peers.is_empty() {
        return Err(ConsistencyError::InvalidPeer(format!("{} is empty", VALUE)));
    }
    Ok(peers)
}

pub struct RaftMaintainService {
    server: Arc<RaftServer>,
}

impl RaftMaintainService {
    pub fn new(server: Arc<RaftServer>) -> Self {
        Self { server }
    }

    /// Run an administrative command. Without `groupId` it applies to every group
    /// and stops at the first failure.
    pub async fn execute(&self, args: &HashMap<String, String>) -> RestResult<String> {
        let Some(command) = args.get(COMMAND) else {
            return RestResult::err(PARAMETER_ERROR, "command is required");
        };
        let command = match command.parse::<MaintainCommand>() {
            Ok(command) => command,
            Err(message) => return RestResult::err(PARAMETER_ERROR, &message),
        };

        let groups = match args.get(GROUP_ID).map(|g| g.trim()).filter(|g| !g.is_empty()) {
            Some(group) => vec![group.to_string()],
            None => self.server.groups(),
        };
        let value = args.get(VALUE).map(|v| v.trim()).filter(|v| !v.is_empty());

        for group in &groups {
            if let Err(e) = self.execute_on(group, command, value).await {
                warn!(group = %group, command = ?command, "Raft maintain command failed: {}", e);
                return RestResult::err(error_code(&e), &e.to_string());
            }
            info!(group = %group, command = ?command, value = ?value, "Raft maintain command executed");
        }
        RestResult::ok(None)
    }

    async fn execute_on(
        &self,
        group: &str,
        command: MaintainCommand,
        value: Option<&str>,
    ) -> Result<()> {
        if self.server.group(group).is_none() {
            return Err(ConsistencyError::NoSuchGroup(group.to_string()));
        }

        match command {
            MaintainCommand::TransferLeader => {
                let peer: Peer = required(value)?.parse()?;
                self.ensure_member(group, &peer)?;
                self.server.transfer_leader(group, &peer).await
            }
            MaintainCommand::DoSnapshot => {
                let peer = value.map(str::parse::<Peer>).transpose()?;
                if let Some(peer) = &peer {
                    self.ensure_member(group, peer)?;
                }
                self.server.do_snapshot(group, peer.as_ref()).await
            }
            MaintainCommand::ResetRaftCluster | MaintainCommand::ChangePeers => {
                let peers = required_peers(value)?;
                self.server.change_peers(group, &peers).await
            }
            MaintainCommand::RemovePeer => {
                let peer: Peer = required(value)?.parse()?;
                self.ensure_member(group, &peer)?;
                self.server.remove_peers(group, &[peer]).await
            }
            MaintainCommand::RemovePeers => {
                let peers = required_peers(value)?;
                for peer in &peers {
                    self.ensure_member(group, peer)?;
                }
                self.server.remove_peers(group, &peers).await
            }
        }
    }

    fn ensure_member(&self, group: &str, peer: &Peer) -> Result<()> {
        if self.server.members_of(group).contains(peer) {
            Ok(())
        } else {
            Err(ConsistencyError::InvalidPeer(format!(
                "{} is not a member of group {}",
                peer, group
            )))
        }
    }
}
