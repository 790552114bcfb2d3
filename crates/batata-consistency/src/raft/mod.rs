// Multi-group Raft protocol
// Each registered processor gets its own raft group, log and snapshot directory

pub mod closure;
pub mod config;
pub mod event;
pub mod http;
pub mod log_store;
pub mod maintain;
pub mod network;
pub mod processor;
pub mod request;
pub mod route;
pub mod server;
pub mod snapshot;
pub mod state_machine;
pub mod types;

// Re-export commonly used types
pub use closure::{FailoverClosure, ResponseFuture, RetryPolicy};
pub use config::{GroupPaths, RaftConfig};
pub use event::{RaftEvent, RaftEventPublisher, RaftMetadata};
pub use http::HttpTransport;
pub use maintain::{RaftMaintainService, RestResult};
pub use network::{LocalTransport, RaftRpc, RaftRpcReply, RaftTransport, RpcHandler};
pub use processor::{LogProcessor, SnapshotOperation};
pub use request::{LogEntry, OperationKind, ReadRequest, Response};
pub use route::RouteTable;
pub use server::{RaftGroup, RaftServer};
pub use snapshot::{LocalFileMeta, SNAPSHOT_MANIFEST, SnapshotReader, SnapshotWriter};
pub use state_machine::StateMachineAdapter;
pub use types::{NodeId, Peer, Raft, RaftMetrics, ServerState, TypeConfig, calculate_node_id};
