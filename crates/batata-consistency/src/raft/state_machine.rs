// Raft state machine adapter
// Bridges openraft's state machine callbacks to a registered LogProcessor

// Allow large error types - StorageError is from openraft and follows their design patterns
#![allow(clippy::result_large_err)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{EntryPayload, ErrorSubject, ErrorVerb, OptionalSend, StorageError};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::event::{RaftEvent, RaftEventPublisher};
use super::processor::{LogProcessor, SnapshotOperation};
use super::request::{LogEntry, OperationKind, Response};
use super::snapshot::{SnapshotManifest, SnapshotReader, SnapshotStore, SnapshotWriter};
use super::types::{
    Entry, LogId, NodeId, Peer, Snapshot, SnapshotMeta, StoredMembership, TypeConfig,
};
use crate::error::{ConsistencyError, Result};

fn sm_error(e: impl std::fmt::Display, verb: ErrorVerb) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

fn snapshot_error(
    meta: &SnapshotMeta,
    e: impl std::fmt::Display,
    verb: ErrorVerb,
) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Snapshot(Some(meta.signature())),
        verb,
        std::io::Error::other(e.to_string()),
    )
}

/// Result of applying one batch of committed entries
#[derive(Debug)]
pub(crate) enum ApplyOutcome {
    Complete(Vec<Response>),
    /// Entries up to `last_applied` stay applied; `failed` and the rest are not
    Rollback {
        applied: Vec<Response>,
        last_applied: Option<LogId>,
        failed: LogId,
        error: anyhow::Error,
    },
}

#[derive(Debug, Default)]
struct AppliedState {
    last_applied: Option<LogId>,
    last_membership: StoredMembership,
    current_snapshot: Option<SnapshotMeta>,
}

#[derive(Clone, Debug, Default)]
struct Leadership {
    leader: Option<Peer>,
    term: Option<u64>,
}

struct AdapterInner {
    group: String,
    processor: Arc<dyn LogProcessor>,
    operations: Vec<Arc<dyn SnapshotOperation>>,
    store: SnapshotStore,
    state: RwLock<AppliedState>,
    leadership: parking_lot::RwLock<Leadership>,
    events: RaftEventPublisher,
    apply_failure: parking_lot::Mutex<Option<(u64, String)>>,
    snapshot_failures: AtomicU64,
    error_reported: AtomicBool,
}

/// State machine of one raft group; cheap to clone, clones share state
#[derive(Clone)]
pub struct StateMachineAdapter {
    inner: Arc<AdapterInner>,
}

impl StateMachineAdapter {
    /// Create the adapter and restore the group's local snapshot, if any
    pub fn open(
        processor: Arc<dyn LogProcessor>,
        snapshot_dir: &Path,
        events: RaftEventPublisher,
    ) -> Result<Self> {
        let operations = processor.snapshot_operations();
        let adapter = Self {
            inner: Arc::new(AdapterInner {
                group: processor.group().to_string(),
                processor,
                operations,
                store: SnapshotStore::new(snapshot_dir),
                state: RwLock::new(AppliedState::default()),
                leadership: parking_lot::RwLock::new(Leadership::default()),
                events,
                apply_failure: parking_lot::Mutex::new(None),
                snapshot_failures: AtomicU64::new(0),
                error_reported: AtomicBool::new(false),
            }),
        };
        adapter.load_local_snapshot()?;
        Ok(adapter)
    }

    fn load_local_snapshot(&self) -> Result<()> {
        let Some(manifest) = self.inner.store.read_manifest()? else {
            return Ok(());
        };

        let reader = SnapshotReader::new(self.inner.store.current_dir(), manifest.files.clone());
        if !self.load_snapshot(&reader) {
            return Err(ConsistencyError::SnapshotFailure {
                group: self.inner.group.clone(),
                message: format!("failed to load local snapshot {}", manifest.meta.snapshot_id),
            });
        }

        info!(
            group = %self.inner.group,
            snapshot_id = %manifest.meta.snapshot_id,
            "Loaded local snapshot"
        );

        // Nothing else can hold the lock before the adapter is handed out
        if let Ok(mut state) = self.inner.state.try_write() {
            state.last_applied = manifest.meta.last_log_id;
            state.last_membership = manifest.meta.last_membership.clone();
            state.current_snapshot = Some(manifest.meta);
        }
        Ok(())
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn has_snapshot_operations(&self) -> bool {
        !self.inner.operations.is_empty()
    }

    pub async fn last_applied(&self) -> Option<LogId> {
        self.inner.state.read().await.last_applied
    }

    pub fn leader(&self) -> Option<Peer> {
        self.inner.leadership.read().leader.clone()
    }

    pub fn term(&self) -> Option<u64> {
        self.inner.leadership.read().term
    }

    /// Number of snapshot saves or loads that failed since start
    pub fn snapshot_failures(&self) -> u64 {
        self.inner.snapshot_failures.load(Ordering::Relaxed)
    }

    /// Index and message of the apply failure that degraded this group
    pub fn apply_failure(&self) -> Option<(u64, String)> {
        self.inner.apply_failure.lock().clone()
    }

    /// Set once an apply failed; the group stops applying until restarted
    pub fn is_degraded(&self) -> bool {
        self.inner.apply_failure.lock().is_some()
    }

    /// Error for callers of a degraded group
    pub(crate) fn degraded_error(&self) -> Option<ConsistencyError> {
        self.apply_failure()
            .map(|(index, message)| ConsistencyError::ApplyFailure {
                group: self.inner.group.clone(),
                index,
                message,
            })
    }

    /// Apply entries in order, stopping at the first processor failure
    pub(crate) async fn apply_batch(&self, entries: Vec<Entry>) -> ApplyOutcome {
        let mut responses = Vec::with_capacity(entries.len());
        let mut last_applied = self.inner.state.read().await.last_applied;

        for entry in entries {
            let log_id = entry.log_id;

            let response = match entry.payload {
                EntryPayload::Normal(log_entry) => match self.dispatch(&log_entry).await {
                    Ok(response) => response,
                    Err(error) => {
                        return ApplyOutcome::Rollback {
                            applied: responses,
                            last_applied,
                            failed: log_id,
                            error,
                        };
                    }
                },
                EntryPayload::Membership(membership) => {
                    self.inner.state.write().await.last_membership =
                        StoredMembership::new(Some(log_id), membership);
                    Response::success()
                }
                EntryPayload::Blank => Response::success(),
            };

            self.inner.state.write().await.last_applied = Some(log_id);
            last_applied = Some(log_id);
            responses.push(response);
        }

        ApplyOutcome::Complete(responses)
    }

    async fn dispatch(&self, entry: &LogEntry) -> anyhow::Result<Response> {
        match entry.kind {
            OperationKind::Read => {
                let request = entry.read_request()?;
                self.inner.processor.on_request(&request).await
            }
            OperationKind::Modify => self.inner.processor.on_apply(entry).await,
        }
    }

    fn load_snapshot(&self, reader: &SnapshotReader) -> bool {
        for operation in &self.inner.operations {
            if let Err(e) = operation.on_snapshot_load(reader) {
                self.inner.snapshot_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    group = %self.inner.group,
                    operation = operation.name(),
                    "Snapshot load failed: {:#}",
                    e
                );
                return false;
            }
        }
        true
    }

    /// Run every save operation into a staging directory, commit it as the
    /// current snapshot and return the engine payload
    fn save_snapshot(&self, meta: &SnapshotMeta) -> Result<Vec<u8>> {
        let failure = |message: String| ConsistencyError::SnapshotFailure {
            group: self.inner.group.clone(),
            message,
        };

        if self.inner.operations.is_empty() {
            return Err(failure("no snapshot operations registered".to_string()));
        }

        let staging = self.inner.store.save_staging()?;
        let mut writer = SnapshotWriter::new(&staging);
        for operation in &self.inner.operations {
            operation
                .on_snapshot_save(&mut writer)
                .map_err(|e| failure(format!("{} save failed: {:#}", operation.name(), e)))?;
        }

        let manifest = SnapshotManifest {
            meta: meta.clone(),
            files: writer.into_files(),
        };
        self.inner.store.commit(&staging, &manifest)?;
        let data = SnapshotStore::pack(&self.inner.store.current_dir(), &manifest.files)?;

        info!(
            group = %self.inner.group,
            snapshot_id = %meta.snapshot_id,
            files = manifest.files.len(),
            bytes = data.len(),
            "Saved snapshot"
        );
        Ok(data)
    }

    async fn current_snapshot(&self) -> std::result::Result<Option<Snapshot>, StorageError<NodeId>> {
        if self.inner.state.read().await.current_snapshot.is_none() {
            return Ok(None);
        }
        let Some(manifest) = self
            .inner
            .store
            .read_manifest()
            .map_err(|e| sm_error(e, ErrorVerb::Read))?
        else {
            return Ok(None);
        };

        let data = SnapshotStore::pack(&self.inner.store.current_dir(), &manifest.files)
            .map_err(|e| snapshot_error(&manifest.meta, e, ErrorVerb::Read))?;
        Ok(Some(Snapshot {
            meta: manifest.meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }

    fn publish(&self, members: Vec<Peer>) {
        let leadership = self.inner.leadership.read().clone();
        self.inner.events.publish(RaftEvent::new(
            self.inner.group.clone(),
            leadership.leader,
            leadership.term,
            members,
        ));
    }

    pub fn on_leader_start(&self, local: Peer, term: u64, members: Vec<Peer>) {
        info!(group = %self.inner.group, term, "Became leader");
        *self.inner.leadership.write() = Leadership {
            leader: Some(local),
            term: Some(term),
        };
        self.inner.error_reported.store(false, Ordering::Release);
        self.publish(members);
    }

    pub fn on_leader_stop(&self, members: Vec<Peer>) {
        info!(group = %self.inner.group, "Stepped down as leader");
        self.inner.leadership.write().leader = None;
        self.publish(members);
    }

    pub fn on_start_following(&self, leader: Peer, term: u64, members: Vec<Peer>) {
        info!(group = %self.inner.group, leader = %leader, term, "Start following");
        *self.inner.leadership.write() = Leadership {
            leader: Some(leader),
            term: Some(term),
        };
        self.inner.error_reported.store(false, Ordering::Release);
        self.publish(members);
    }

    pub fn on_stop_following(&self, leader: Peer, members: Vec<Peer>) {
        debug!(group = %self.inner.group, leader = %leader, "Stop following");
        self.inner.leadership.write().leader = None;
        self.publish(members);
    }

    /// Report an unrecoverable error to the processor once per degradation
    pub fn on_error(&self, err: &ConsistencyError) {
        if !self.inner.error_reported.swap(true, Ordering::AcqRel) {
            self.inner.processor.on_error(err);
        }
    }
}

/// Holds a snapshot saved on the state machine worker until the engine asks for it
pub struct GroupSnapshotBuilder {
    adapter: StateMachineAdapter,
    built: Option<Result<Snapshot>>,
}

impl RaftSnapshotBuilder<TypeConfig> for GroupSnapshotBuilder {
    async fn build_snapshot(&mut self) -> std::result::Result<Snapshot, StorageError<NodeId>> {
        let failure = match self.built.take() {
            Some(Ok(snapshot)) => return Ok(snapshot),
            Some(Err(e)) => e,
            None => ConsistencyError::SnapshotFailure {
                group: self.adapter.group().to_string(),
                message: "snapshot already handed out".to_string(),
            },
        };

        // Keep the group running: hand back the previous snapshot, which the
        // engine ignores as not newer than what it has
        self.adapter
            .inner
            .snapshot_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(group = %self.adapter.group(), "Snapshot save failed: {}", failure);

        if let Some(previous) = self.adapter.current_snapshot().await? {
            return Ok(previous);
        }
        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: None,
                last_membership: StoredMembership::default(),
                snapshot_id: format!("{}-empty", self.adapter.group()),
            },
            snapshot: Box::new(Cursor::new(Vec::new())),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineAdapter {
    type SnapshotBuilder = GroupSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> std::result::Result<(Option<LogId>, StoredMembership), StorageError<NodeId>> {
        let state = self.inner.state.read().await;
        Ok((state.last_applied, state.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> std::result::Result<Vec<Response>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let entries: Vec<Entry> = entries.into_iter().collect();
        let total = entries.len();

        // The engine needs one response per entry; a degraded group answers
        // with failures and leaves its applied index where it stopped
        if let Some((index, _)) = self.apply_failure() {
            let skipped = format!("not applied, group stopped at index {}", index);
            return Ok(vec![Response::failure(skipped); total]);
        }

        match self.apply_batch(entries).await {
            ApplyOutcome::Complete(responses) => Ok(responses),
            ApplyOutcome::Rollback {
                mut applied,
                last_applied,
                failed,
                error,
            } => {
                let message = format!("{:#}", error);
                let err = ConsistencyError::ApplyFailure {
                    group: self.inner.group.clone(),
                    index: failed.index,
                    message: message.clone(),
                };
                error!(
                    group = %self.inner.group,
                    last_applied = ?last_applied.map(|l| l.index),
                    failed = failed.index,
                    "Apply failed, rolling back the rest of the batch: {:#}",
                    error
                );
                *self.inner.apply_failure.lock() = Some((failed.index, message.clone()));
                self.on_error(&err);

                applied.push(Response::failure(message));
                let skipped = format!("not applied, group stopped at index {}", failed.index);
                applied.resize(total, Response::failure(skipped));
                Ok(applied)
            }
        }
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let meta = {
            let state = self.inner.state.read().await;
            SnapshotMeta {
                last_log_id: state.last_applied,
                last_membership: state.last_membership.clone(),
                snapshot_id: format!(
                    "{}-{}-{}",
                    self.inner.group,
                    state.last_applied.map(|l| l.index).unwrap_or(0),
                    chrono::Utc::now().timestamp_millis()
                ),
            }
        };

        let built = self.save_snapshot(&meta).map(|data| Snapshot {
            meta: meta.clone(),
            snapshot: Box::new(Cursor::new(data)),
        });
        if built.is_ok() {
            self.inner.state.write().await.current_snapshot = Some(meta);
        }

        GroupSnapshotBuilder {
            adapter: self.clone(),
            built: Some(built),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        let staging = self
            .inner
            .store
            .install_staging()
            .map_err(|e| snapshot_error(meta, e, ErrorVerb::Write))?;
        let files = SnapshotStore::unpack(&data, &staging)
            .map_err(|e| snapshot_error(meta, e, ErrorVerb::Read))?;

        let reader = SnapshotReader::new(&staging, files.clone());
        if !self.load_snapshot(&reader) {
            return Err(snapshot_error(
                meta,
                format!("group {} rejected snapshot", self.inner.group),
                ErrorVerb::Read,
            ));
        }

        let manifest = SnapshotManifest {
            meta: meta.clone(),
            files,
        };
        self.inner
            .store
            .commit(&staging, &manifest)
            .map_err(|e| snapshot_error(meta, e, ErrorVerb::Write))?;

        let mut state = self.inner.state.write().await;
        state.last_applied = meta.last_log_id;
        state.last_membership = meta.last_membership.clone();
        state.current_snapshot = Some(meta.clone());

        info!(group = %self.inner.group, snapshot_id = %meta.snapshot_id, "Snapshot installed");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot>, StorageError<NodeId>> {
        self.current_snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::request::ReadRequest;
    use crate::raft::snapshot::LocalFileMeta;
    use async_trait::async_trait;
    use openraft::CommittedLeaderId;

    #[derive(Default)]
    struct Recorder {
        applied: parking_lot::Mutex<Vec<String>>,
        errors: parking_lot::Mutex<Vec<String>>,
        fail_key: Option<String>,
        with_snapshot: bool,
    }

    struct RecorderSnapshot(Arc<Recorder>);

    impl SnapshotOperation for RecorderSnapshot {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_snapshot_save(&self, writer: &mut SnapshotWriter) -> anyhow::Result<()> {
            let data = serde_json::to_vec(&*self.0.applied.lock())?;
            std::fs::write(writer.path().join("applied.json"), data)?;
            writer.add_file("applied.json", LocalFileMeta::new().append("kind", "list"));
            Ok(())
        }

        fn on_snapshot_load(&self, reader: &SnapshotReader) -> anyhow::Result<()> {
            anyhow::ensure!(
                reader.file_meta("applied.json").and_then(|m| m.get("kind")) == Some("list"),
                "missing applied.json"
            );
            let bytes = std::fs::read(reader.path().join("applied.json"))?;
            *self.0.applied.lock() = serde_json::from_slice(&bytes)?;
            Ok(())
        }
    }

    struct RecorderProcessor(Arc<Recorder>);

    #[async_trait]
    impl LogProcessor for RecorderProcessor {
        fn group(&self) -> &str {
            "recorder"
        }

        async fn on_request(&self, _request: &ReadRequest) -> anyhow::Result<Response> {
            let applied = self.0.applied.lock().join(",");
            Ok(Response::success_with_data(applied.into_bytes()))
        }

        async fn on_apply(&self, entry: &LogEntry) -> anyhow::Result<Response> {
            if self.0.fail_key.as_deref() == Some(entry.key.as_str()) {
                anyhow::bail!("refusing {}", entry.key);
            }
            self.0.applied.lock().push(entry.key.clone());
            Ok(Response::success())
        }

        fn on_error(&self, err: &ConsistencyError) {
            self.0.errors.lock().push(err.to_string());
        }

        fn snapshot_operations(&self) -> Vec<Arc<dyn SnapshotOperation>> {
            if self.0.with_snapshot {
                vec![Arc::new(RecorderSnapshot(self.0.clone()))]
            } else {
                Vec::new()
            }
        }
    }

    fn entry(index: u64, key: &str) -> Entry {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(LogEntry::modify("recorder", key, "PUT")),
        }
    }

    fn adapter(recorder: &Arc<Recorder>, dir: &Path) -> StateMachineAdapter {
        StateMachineAdapter::open(
            Arc::new(RecorderProcessor(recorder.clone())),
            dir,
            RaftEventPublisher::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut sm = adapter(&recorder, dir.path());

        let responses = sm
            .apply(vec![entry(1, "a"), entry(2, "b"), entry(3, "c")])
            .await
            .unwrap();

        assert_eq!(responses.len(), 3);
        assert!(responses.iter().all(|r| r.success));
        assert_eq!(*recorder.applied.lock(), vec!["a", "b", "c"]);
        assert_eq!(sm.last_applied().await.map(|l| l.index), Some(3));
    }

    #[tokio::test]
    async fn test_partial_rollback_keeps_applied_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder {
            fail_key: Some("bad".to_string()),
            ..Default::default()
        });
        let sm = adapter(&recorder, dir.path());

        let outcome = sm
            .apply_batch(vec![entry(1, "a"), entry(2, "bad"), entry(3, "c")])
            .await;

        match outcome {
            ApplyOutcome::Rollback {
                applied,
                last_applied,
                failed,
                ..
            } => {
                assert_eq!(applied.len(), 1);
                assert_eq!(last_applied.map(|l| l.index), Some(1));
                assert_eq!(failed.index, 2);
            }
            ApplyOutcome::Complete(_) => panic!("expected rollback"),
        }
        assert_eq!(*recorder.applied.lock(), vec!["a"]);
        assert_eq!(sm.last_applied().await.map(|l| l.index), Some(1));
    }

    #[tokio::test]
    async fn test_apply_failure_reports_error_once() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder {
            fail_key: Some("bad".to_string()),
            ..Default::default()
        });
        let mut sm = adapter(&recorder, dir.path());

        assert!(!sm.apply(vec![entry(1, "bad")]).await.unwrap()[0].success);
        assert!(!sm.apply(vec![entry(2, "c")]).await.unwrap()[0].success);

        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(recorder.applied.lock().is_empty());
        assert!(sm.is_degraded());
        let (index, message) = sm.apply_failure().unwrap();
        assert_eq!(index, 1);
        assert!(message.contains("refusing bad"));
    }

    #[tokio::test]
    async fn test_failed_batch_answers_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder {
            fail_key: Some("bad".to_string()),
            ..Default::default()
        });
        let mut sm = adapter(&recorder, dir.path());

        let responses = sm
            .apply(vec![entry(1, "a"), entry(2, "b"), entry(3, "bad"), entry(4, "d")])
            .await
            .unwrap();

        assert_eq!(responses.len(), 4);
        assert!(responses[0].success);
        assert!(responses[1].success);
        assert!(responses[2].err_msg.as_deref().unwrap().contains("refusing bad"));
        assert!(!responses[3].success);
        assert_eq!(*recorder.applied.lock(), vec!["a", "b"]);
        assert_eq!(sm.last_applied().await.map(|l| l.index), Some(2));
        assert_eq!(sm.apply_failure().map(|(index, _)| index), Some(3));
    }

    #[tokio::test]
    async fn test_read_entry_dispatches_to_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut sm = adapter(&recorder, dir.path());

        let read = LogEntry::read(&ReadRequest::new("recorder", vec![])).unwrap();
        let responses = sm
            .apply(vec![
                entry(1, "a"),
                Entry {
                    log_id: LogId::new(CommittedLeaderId::new(1, 1), 2),
                    payload: EntryPayload::Normal(read),
                },
            ])
            .await
            .unwrap();

        assert_eq!(responses[1].data.as_deref(), Some(b"a".as_slice()));
        assert_eq!(*recorder.applied.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_snapshot_save_then_install_elsewhere() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Recorder {
            with_snapshot: true,
            ..Default::default()
        });
        let mut sm = adapter(&source, source_dir.path());
        sm.apply(vec![entry(1, "a"), entry(2, "b")]).await.unwrap();

        let mut builder = sm.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id.map(|l| l.index), Some(2));
        assert!(sm.get_current_snapshot().await.unwrap().is_some());

        let target_dir = tempfile::tempdir().unwrap();
        let target = Arc::new(Recorder {
            with_snapshot: true,
            ..Default::default()
        });
        let mut other = adapter(&target, target_dir.path());
        other
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(*target.applied.lock(), vec!["a", "b"]);
        assert_eq!(other.last_applied().await.map(|l| l.index), Some(2));
    }

    #[tokio::test]
    async fn test_local_snapshot_loaded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let recorder = Arc::new(Recorder {
                with_snapshot: true,
                ..Default::default()
            });
            let mut sm = adapter(&recorder, dir.path());
            sm.apply(vec![entry(1, "x"), entry(2, "y")]).await.unwrap();
            sm.get_snapshot_builder().await.build_snapshot().await.unwrap();
        }

        let restored = Arc::new(Recorder {
            with_snapshot: true,
            ..Default::default()
        });
        let sm = adapter(&restored, dir.path());
        assert_eq!(*restored.applied.lock(), vec!["x", "y"]);
        assert_eq!(sm.last_applied().await.map(|l| l.index), Some(2));
    }

    #[tokio::test]
    async fn test_snapshot_without_operations_keeps_group_running() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut sm = adapter(&recorder, dir.path());
        sm.apply(vec![entry(1, "a")]).await.unwrap();

        let snapshot = sm.get_snapshot_builder().await.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id, None);
        assert_eq!(sm.snapshot_failures(), 1);
        assert!(sm.get_current_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leadership_callbacks_publish_events() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let publisher = RaftEventPublisher::default();
        let mut rx = publisher.subscribe();
        let sm = StateMachineAdapter::open(
            Arc::new(RecorderProcessor(recorder)),
            dir.path(),
            publisher,
        )
        .unwrap();

        let local = Peer::new("127.0.0.1", 9001);
        sm.on_leader_start(local.clone(), 3, vec![local.clone()]);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.leader, Some(local.clone()));
        assert_eq!(event.term, Some(3));
        assert_eq!(sm.leader(), Some(local));

        sm.on_leader_stop(vec![]);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.leader, None);
        assert_eq!(sm.term(), Some(3));
    }
}
