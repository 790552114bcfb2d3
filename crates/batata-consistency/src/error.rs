//! Error types for the consistency layer

use serde::{Deserialize, Serialize};

/// Errors raised by the multi-group Raft orchestration layer
#[derive(Debug, thiserror::Error)]
pub enum ConsistencyError {
    /// Transport, storage or engine construction failed while starting
    #[error("startup failed: {0}")]
    Startup(String),

    #[error("raft group already registered: {0}")]
    DuplicateGroup(String),

    #[error("raft group not found: {0}")]
    NoSuchGroup(String),

    /// Leader lookup exceeded its deadline
    #[error("no leader for group {group} within {waited_ms}ms")]
    NoLeader { group: String, waited_ms: u64 },

    /// The contacted peer is no longer leader of the group
    #[error("not leader of group {group}, known leader: {leader:?}")]
    NotLeader {
        group: String,
        leader: Option<String>,
    },

    /// The processor rejected a committed entry
    #[error("apply failed for group {group} at index {index}: {message}")]
    ApplyFailure {
        group: String,
        index: u64,
        message: String,
    },

    #[error("snapshot failed for group {group}: {message}")]
    SnapshotFailure { group: String, message: String },

    #[error("membership change failed for group {group}: {message}")]
    MembershipFailure { group: String, message: String },

    #[error("invalid peer address: {0}")]
    InvalidPeer(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("raft error: {0}")]
    Raft(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The processor answered with an unsuccessful response
    #[error("request rejected by group {group}: {message}")]
    Rejected { group: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("server is shut down")]
    Shutdown,
}

impl ConsistencyError {
    /// Transient failures that a failover retry may recover from
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsistencyError::NoLeader { .. }
                | ConsistencyError::NotLeader { .. }
                | ConsistencyError::Transport(_)
        )
    }

    pub fn to_remote(&self) -> RemoteError {
        let code = match self {
            ConsistencyError::NoLeader { .. } => RemoteErrorCode::NoLeader,
            ConsistencyError::NotLeader { .. } => RemoteErrorCode::NotLeader,
            ConsistencyError::NoSuchGroup(_) => RemoteErrorCode::NoSuchGroup,
            ConsistencyError::ApplyFailure { .. } => RemoteErrorCode::ApplyFailure,
            ConsistencyError::Transport(_) => RemoteErrorCode::Transport,
            ConsistencyError::Rejected { .. } => RemoteErrorCode::Rejected,
            ConsistencyError::Shutdown => RemoteErrorCode::Shutdown,
            _ => RemoteErrorCode::Internal,
        };
        RemoteError {
            code,
            message: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsistencyError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorCode {
    NoLeader,
    NotLeader,
    NoSuchGroup,
    ApplyFailure,
    Transport,
    Rejected,
    Shutdown,
    Internal,
}

/// Error carried back over the transport by a remote peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
}

impl RemoteError {
    /// Rebuild a local error for `group`. Retry classification survives the hop.
    pub fn into_error(self, group: &str) -> ConsistencyError {
        match self.code {
            RemoteErrorCode::NoLeader => ConsistencyError::NoLeader {
                group: group.to_string(),
                waited_ms: 0,
            },
            RemoteErrorCode::NotLeader => ConsistencyError::NotLeader {
                group: group.to_string(),
                leader: None,
            },
            RemoteErrorCode::NoSuchGroup => ConsistencyError::NoSuchGroup(group.to_string()),
            RemoteErrorCode::ApplyFailure => ConsistencyError::ApplyFailure {
                group: group.to_string(),
                index: 0,
                message: self.message,
            },
            RemoteErrorCode::Transport => ConsistencyError::Transport(self.message),
            RemoteErrorCode::Rejected => ConsistencyError::Rejected {
                group: group.to_string(),
                message: self.message,
            },
            RemoteErrorCode::Shutdown => ConsistencyError::Transport(self.message),
            RemoteErrorCode::Internal => ConsistencyError::Raft(self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConsistencyError::DuplicateGroup("naming".to_string());
        assert_eq!(err.to_string(), "raft group already registered: naming");

        let err = ConsistencyError::NoLeader {
            group: "config".to_string(),
            waited_ms: 5000,
        };
        assert_eq!(err.to_string(), "no leader for group config within 5000ms");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            ConsistencyError::NotLeader {
                group: "g".to_string(),
                leader: None
            }
            .is_retryable()
        );
        assert!(ConsistencyError::Transport("refused".to_string()).is_retryable());
        assert!(
            !ConsistencyError::ApplyFailure {
                group: "g".to_string(),
                index: 3,
                message: "bad payload".to_string()
            }
            .is_retryable()
        );
        assert!(!ConsistencyError::DuplicateGroup("g".to_string()).is_retryable());
    }

    #[test]
    fn test_remote_error_keeps_retry_class() {
        let remote = ConsistencyError::NotLeader {
            group: "g".to_string(),
            leader: Some("127.0.0.1:9001".to_string()),
        }
        .to_remote();
        assert_eq!(remote.code, RemoteErrorCode::NotLeader);
        assert!(remote.into_error("g").is_retryable());

        let remote = ConsistencyError::ApplyFailure {
            group: "g".to_string(),
            index: 1,
            message: "boom".to_string(),
        }
        .to_remote();
        let err = remote.into_error("g");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("boom"));
    }
}
