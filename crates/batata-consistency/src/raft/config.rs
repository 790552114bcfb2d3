// Raft configuration
// Shared by every raft group hosted on this node; each group clones it at start

use std::path::{Path, PathBuf};
use std::time::Duration;

use openraft::SnapshotPolicy;

use crate::error::{ConsistencyError, Result};

const CONFIG_PREFIX: &str = "batata.core.protocol.raft.data";

/// Configuration for the multi-group Raft protocol
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Election timeout in milliseconds (default: 5000ms)
    /// Also the base period of the route table refresh task
    pub election_timeout_ms: u64,

    /// Heartbeat interval in milliseconds (default: 1000ms)
    pub heartbeat_interval_ms: u64,

    /// Snapshot interval in seconds (default: 1800s = 30 minutes)
    pub snapshot_interval_secs: u64,

    /// Number of log entries since the last snapshot before the engine builds one
    pub snapshot_threshold: u64,

    /// Log entries kept once covered by a snapshot (default: 1000)
    pub snapshot_logs_to_keep: u64,

    /// RPC request timeout in milliseconds (default: 5000ms)
    pub rpc_request_timeout_ms: u64,

    /// Maximum entries per append request (default: 300)
    pub max_payload_entries: u64,

    /// Protocol root; every group gets `<data_dir>/<group>/{log,snapshot,meta-data}`
    pub data_dir: PathBuf,

    /// Maximum size of a single log entry in bytes (default: 4MB)
    pub max_entry_size: u64,

    /// Extra attempts for commits and reads that hit a leader change
    pub failover_retries: u32,

    /// Deadline for discovering a group leader before forwarding
    pub leader_lookup_timeout_ms: u64,

    /// Poll interval while waiting for a leader to appear
    pub leader_lookup_interval_ms: u64,

    /// Backoff between membership change attempts
    pub membership_retry_delay_ms: u64,

    /// Upper bound of one membership change attempt, learner catch-up included
    pub membership_timeout_ms: u64,

    /// TCP connect window of one membership probe
    pub probe_timeout_ms: u64,

    /// Pause between membership probe cycles
    pub probe_interval_ms: u64,

    /// Address of this node, `ip:port`
    pub self_member: String,

    /// Initial cluster members, `ip:port` each. A node missing from a non-empty list
    /// starts uninitialized and asks the leader to add it
    pub members: Vec<String>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            snapshot_interval_secs: 1800,
            snapshot_threshold: 10000,
            snapshot_logs_to_keep: 1000,
            rpc_request_timeout_ms: 5000,
            max_payload_entries: 300,
            data_dir: PathBuf::from("./data/protocol/raft"),
            max_entry_size: 4 * 1024 * 1024, // 4MB
            failover_retries: 1,
            leader_lookup_timeout_ms: 5000,
            leader_lookup_interval_ms: 10,
            membership_retry_delay_ms: 500,
            membership_timeout_ms: 10_000,
            probe_timeout_ms: 500,
            probe_interval_ms: 1000,
            self_member: "127.0.0.1:8848".to_string(),
            members: Vec::new(),
        }
    }
}

impl RaftConfig {
    /// Create configuration from application configuration.
    /// Missing keys keep their defaults.
    pub fn from_config(config: &config::Config) -> Self {
        let mut raft_config = Self::default();

        let int = |name: &str| {
            config
                .get_int(&format!("{}.{}", CONFIG_PREFIX, name))
                .ok()
                .filter(|v| *v >= 0)
                .map(|v| v as u64)
        };

        if let Some(val) = int("election_timeout_ms") {
            raft_config.election_timeout_ms = val;
        }
        if let Some(val) = int("heartbeat_interval_ms") {
            raft_config.heartbeat_interval_ms = val;
        }
        if let Some(val) = int("snapshot_interval_secs") {
            raft_config.snapshot_interval_secs = val;
        }
        if let Some(val) = int("snapshot_threshold") {
            raft_config.snapshot_threshold = val;
        }
        if let Some(val) = int("snapshot_logs_to_keep") {
            raft_config.snapshot_logs_to_keep = val;
        }
        if let Some(val) = int("rpc_request_timeout_ms") {
            raft_config.rpc_request_timeout_ms = val;
        }
        if let Some(val) = int("max_payload_entries") {
            raft_config.max_payload_entries = val;
        }
        if let Some(val) = int("max_entry_size") {
            raft_config.max_entry_size = val;
        }
        if let Some(val) = int("failover_retries") {
            raft_config.failover_retries = val as u32;
        }
        if let Some(val) = int("leader_lookup_timeout_ms") {
            raft_config.leader_lookup_timeout_ms = val;
        }
        if let Some(val) = int("leader_lookup_interval_ms") {
            raft_config.leader_lookup_interval_ms = val;
        }
        if let Some(val) = int("membership_retry_delay_ms") {
            raft_config.membership_retry_delay_ms = val;
        }
        if let Some(val) = int("membership_timeout_ms") {
            raft_config.membership_timeout_ms = val;
        }
        if let Some(val) = int("probe_timeout_ms") {
            raft_config.probe_timeout_ms = val;
        }
        if let Some(val) = int("probe_interval_ms") {
            raft_config.probe_interval_ms = val;
        }

        if let Ok(val) = config.get_string(&format!("{}.data_dir", CONFIG_PREFIX)) {
            raft_config.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = config.get_string(&format!("{}.self_member", CONFIG_PREFIX)) {
            raft_config.self_member = val.trim().to_string();
        }
        if let Ok(val) = config.get_string(&format!("{}.members", CONFIG_PREFIX)) {
            raft_config.members = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        raft_config
    }

    /// Get election timeout as Duration
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Get RPC timeout as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_request_timeout_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn leader_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_lookup_timeout_ms)
    }

    pub fn leader_lookup_interval(&self) -> Duration {
        Duration::from_millis(self.leader_lookup_interval_ms.max(1))
    }

    pub fn membership_retry_delay(&self) -> Duration {
        Duration::from_millis(self.membership_retry_delay_ms)
    }

    pub fn membership_timeout(&self) -> Duration {
        Duration::from_millis(self.membership_timeout_ms)
    }

    /// Attempts for a membership change: never fewer than three
    pub fn membership_attempts(&self) -> u32 {
        self.failover_retries.max(3)
    }

    /// Storage paths of one group
    pub fn group_paths(&self, group: &str) -> GroupPaths {
        GroupPaths::new(self.data_dir.join(group))
    }

    /// Convert to openraft Config.
    /// Groups without snapshot operations never compact their log.
    pub fn to_openraft_config(&self, group: &str, snapshots: bool) -> Result<openraft::Config> {
        let snapshot_policy = if snapshots {
            SnapshotPolicy::LogsSinceLast(self.snapshot_threshold)
        } else {
            SnapshotPolicy::Never
        };

        let config = openraft::Config {
            cluster_name: format!("batata-{}", group),
            election_timeout_min: self.election_timeout_ms,
            election_timeout_max: self.election_timeout_ms * 2,
            heartbeat_interval: self.heartbeat_interval_ms,
            install_snapshot_timeout: self.rpc_request_timeout_ms,
            snapshot_policy,
            max_in_snapshot_log_to_keep: self.snapshot_logs_to_keep,
            max_payload_entries: self.max_payload_entries,
            ..Default::default()
        };

        config
            .validate()
            .map_err(|e| ConsistencyError::Startup(format!("invalid raft config: {}", e)))
    }
}

/// The three sibling directories a group persists into
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupPaths {
    pub root: PathBuf,
    pub log: PathBuf,
    pub snapshot: PathBuf,
    pub meta: PathBuf,
}

impl GroupPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            log: root.join("log"),
            snapshot: root.join("snapshot"),
            meta: root.join("meta-data"),
            root,
        }
    }

    /// Ensure all group directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.log)?;
        std::fs::create_dir_all(&self.snapshot)?;
        std::fs::create_dir_all(&self.meta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RaftConfig::default();
        assert_eq!(config.election_timeout_ms, 5000);
        assert_eq!(config.heartbeat_interval_ms, 1000);
        assert_eq!(config.snapshot_interval_secs, 1800);
        assert_eq!(config.snapshot_threshold, 10000);
        assert_eq!(config.snapshot_logs_to_keep, 1000);
        assert_eq!(config.rpc_request_timeout_ms, 5000);
        assert_eq!(config.max_payload_entries, 300);
        assert_eq!(config.leader_lookup_timeout(), Duration::from_secs(5));
        assert_eq!(config.leader_lookup_interval(), Duration::from_millis(10));
        assert_eq!(config.membership_retry_delay(), Duration::from_millis(500));
        assert_eq!(config.membership_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_membership_attempts_floor() {
        let mut config = RaftConfig::default();
        assert_eq!(config.membership_attempts(), 3);
        config.failover_retries = 7;
        assert_eq!(config.membership_attempts(), 7);
    }

    #[test]
    fn test_group_paths() {
        let config = RaftConfig {
            data_dir: PathBuf::from("/tmp/raft"),
            ..Default::default()
        };
        let paths = config.group_paths("naming_persistent_service");
        assert_eq!(
            paths.log,
            PathBuf::from("/tmp/raft/naming_persistent_service/log")
        );
        assert_eq!(
            paths.snapshot,
            PathBuf::from("/tmp/raft/naming_persistent_service/snapshot")
        );
        assert_eq!(
            paths.meta,
            PathBuf::from("/tmp/raft/naming_persistent_service/meta-data")
        );
    }

    #[test]
    fn test_ensure_dirs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = GroupPaths::new(temp_dir.path().join("config"));

        assert!(paths.ensure_dirs().is_ok());
        assert!(paths.log.exists());
        assert!(paths.snapshot.exists());
        assert!(paths.meta.exists());
    }

    #[test]
    fn test_to_openraft_config() {
        let config = RaftConfig::default();
        let openraft_config = config.to_openraft_config("config", true).unwrap();

        assert_eq!(openraft_config.cluster_name, "batata-config");
        assert_eq!(openraft_config.election_timeout_min, 5000);
        assert_eq!(openraft_config.election_timeout_max, 10000);
        assert_eq!(openraft_config.heartbeat_interval, 1000);
        assert_eq!(openraft_config.max_payload_entries, 300);
        assert_eq!(openraft_config.max_in_snapshot_log_to_keep, 1000);
        assert!(matches!(
            openraft_config.snapshot_policy,
            SnapshotPolicy::LogsSinceLast(10000)
        ));

        let no_snapshot = config.to_openraft_config("lock", false).unwrap();
        assert!(matches!(no_snapshot.snapshot_policy, SnapshotPolicy::Never));
    }

    #[test]
    fn test_invalid_openraft_config() {
        let config = RaftConfig {
            heartbeat_interval_ms: 10_000,
            ..Default::default()
        };
        assert!(matches!(
            config.to_openraft_config("config", true),
            Err(ConsistencyError::Startup(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let source = config::Config::builder()
            .set_override("batata.core.protocol.raft.data.election_timeout_ms", 3000)
            .unwrap()
            .set_override("batata.core.protocol.raft.data.failover_retries", 2)
            .unwrap()
            .set_override("batata.core.protocol.raft.data.membership_timeout_ms", 4000)
            .unwrap()
            .set_override("batata.core.protocol.raft.data.data_dir", "/data/raft")
            .unwrap()
            .set_override(
                "batata.core.protocol.raft.data.members",
                "10.0.0.1:7848, 10.0.0.2:7848,",
            )
            .unwrap()
            .build()
            .unwrap();

        let config = RaftConfig::from_config(&source);
        assert_eq!(config.election_timeout_ms, 3000);
        assert_eq!(config.failover_retries, 2);
        assert_eq!(config.membership_timeout(), Duration::from_secs(4));
        assert_eq!(config.heartbeat_interval_ms, 1000);
        assert_eq!(config.data_dir, PathBuf::from("/data/raft"));
        assert_eq!(
            config.members,
            vec!["10.0.0.1:7848".to_string(), "10.0.0.2:7848".to_string()]
        );
    }
}
