// Log processor contract
// Each business supplies one processor; it owns the group's replicated state

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use super::request::{LogEntry, ReadRequest, Response};
use super::snapshot::{SnapshotReader, SnapshotWriter};
use crate::error::ConsistencyError;

/// Business logic behind one raft group
#[async_trait]
pub trait LogProcessor: Send + Sync + 'static {
    /// Business id; unique among the groups of one server
    fn group(&self) -> &str;

    /// Answer a read from local state
    async fn on_request(&self, request: &ReadRequest) -> anyhow::Result<Response>;

    /// Apply a committed mutation.
    /// Returning an error stops the batch and degrades the group.
    async fn on_apply(&self, entry: &LogEntry) -> anyhow::Result<Response>;

    /// Called when the group hits an unrecoverable engine error
    fn on_error(&self, err: &ConsistencyError) {
        error!(group = %self.group(), "Raft group error: {}", err);
    }

    /// Named snapshot save/load pairs; none disables snapshots for the group
    fn snapshot_operations(&self) -> Vec<Arc<dyn SnapshotOperation>> {
        Vec::new()
    }
}

/// One save/load pair contributing files to a group snapshot
pub trait SnapshotOperation: Send + Sync {
    fn name(&self) -> &str;

    /// Write files under `writer.path()` and register each with `add_file`
    fn on_snapshot_save(&self, writer: &mut SnapshotWriter) -> anyhow::Result<()>;

    fn on_snapshot_load(&self, reader: &SnapshotReader) -> anyhow::Result<()>;
}
