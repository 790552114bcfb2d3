//! Batata Consistency - multi-group Raft protocol
//!
//! This crate provides:
//! - One raft group per registered log processor, sharing a transport and route table
//! - Leader forwarding with failover retries and linearizable reads
//! - Snapshot bridging between processors and the engine
//! - A probing gate that admits new cluster members into every group
//! - A replicated key-value store built on the above

#![allow(clippy::result_large_err)]

pub mod error;
pub mod kv;
pub mod member;
pub mod raft;

pub use error::{ConsistencyError, Result};

// Re-export the server and processor contract
pub use raft::{
    LocalTransport, LogEntry, LogProcessor, Peer, RaftConfig, RaftServer, ReadRequest, Response,
    SnapshotOperation,
};

// Re-export the key-value store
pub use kv::{KvLogProcessor, RaftKvStore};

// Re-export membership types
pub use member::{MemberChangeEvent, MemberChangeNotifier, MembershipGate};
