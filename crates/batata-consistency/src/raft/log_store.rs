// RocksDB-based log storage for one raft group
// Entries live in `log/`; vote, committed and purge marks live in `meta-data/`

// Allow large error types - StorageError is from openraft and follows their design patterns
#![allow(clippy::result_large_err)]

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{ErrorSubject, ErrorVerb, OptionalSend, RaftLogReader, StorageError, Vote};
use rocksdb::{BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, DB, Options};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{Entry, LogId, NodeId, TypeConfig};

const CF_LOGS: &str = "logs";

const RAFT_META_FILE: &str = "raft_meta.json";

// RocksDB tuning; one instance per group so kept smaller than a single shared store
const WRITE_BUFFER_SIZE: usize = 16 * 1024 * 1024;
const MAX_WRITE_BUFFER_NUMBER: i32 = 3;
const BLOCK_CACHE_SIZE: usize = 32 * 1024 * 1024;
const BLOOM_FILTER_BITS_PER_KEY: f64 = 10.0;

fn vote_error(e: impl std::fmt::Display, verb: ErrorVerb) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Vote,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

fn logs_error(e: impl std::fmt::Display, verb: ErrorVerb) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Logs,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

/// Persistent raft metadata of a group
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RaftMeta {
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId>,
    last_purged: Option<LogId>,
}

/// Write-then-rename file holding `RaftMeta`
#[derive(Debug)]
struct RaftMetaFile {
    path: PathBuf,
    state: RaftMeta,
}

impl RaftMetaFile {
    fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(RAFT_META_FILE);
        let state = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes).map_err(std::io::Error::other)?
        } else {
            RaftMeta::default()
        };
        Ok(Self { path, state })
    }

    fn persist(&self) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(&self.state).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)
    }
}

/// RocksDB-based log store for one raft group
#[derive(Clone)]
pub struct RocksLogStore {
    db: Arc<DB>,
    meta: Arc<RwLock<RaftMetaFile>>,
    /// Cached last log ID
    last_log_id: Arc<RwLock<Option<LogId>>>,
}

impl RocksLogStore {
    /// Open the log store of a group
    pub async fn open(log_dir: &Path, meta_dir: &Path) -> Result<Self, StorageError<NodeId>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(WRITE_BUFFER_SIZE);
        db_opts.set_max_write_buffer_number(MAX_WRITE_BUFFER_NUMBER);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = BlockBasedOptions::default();
        let cache = rocksdb::Cache::new_lru_cache(BLOCK_CACHE_SIZE);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(BLOOM_FILTER_BITS_PER_KEY, false);

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(WRITE_BUFFER_SIZE);
        cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        cf_opts.set_block_based_table_factory(&block_opts);

        let cfs = vec![ColumnFamilyDescriptor::new(CF_LOGS, cf_opts)];

        let db = DB::open_cf_descriptors(&db_opts, log_dir, cfs)
            .map_err(|e| logs_error(e, ErrorVerb::Read))?;
        let meta = RaftMetaFile::open(meta_dir).map_err(|e| vote_error(e, ErrorVerb::Read))?;

        let store = Self {
            db: Arc::new(db),
            meta: Arc::new(RwLock::new(meta)),
            last_log_id: Arc::new(RwLock::new(None)),
        };

        let last_log_id = store.calculate_last_log_id()?;
        *store.last_log_id.write().await = last_log_id;

        info!(path = %log_dir.display(), "RocksDB log store initialized");
        Ok(store)
    }

    fn cf_logs(&self) -> Result<&ColumnFamily, StorageError<NodeId>> {
        self.db
            .cf_handle(CF_LOGS)
            .ok_or_else(|| logs_error("missing column family: logs", ErrorVerb::Read))
    }

    /// Encode log index to bytes (big-endian for proper ordering)
    fn encode_log_index(index: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        // Writing into a Vec cannot fail
        let _ = buf.write_u64::<BigEndian>(index);
        buf
    }

    fn decode_log_index(bytes: &[u8]) -> Result<u64, StorageError<NodeId>> {
        let mut cursor = std::io::Cursor::new(bytes);
        cursor
            .read_u64::<BigEndian>()
            .map_err(|e| logs_error(e, ErrorVerb::Read))
    }

    fn serialize_entry(entry: &Entry) -> Result<Vec<u8>, StorageError<NodeId>> {
        serde_json::to_vec(entry).map_err(|e| logs_error(e, ErrorVerb::Write))
    }

    fn deserialize_entry(bytes: &[u8]) -> Result<Entry, StorageError<NodeId>> {
        serde_json::from_slice(bytes).map_err(|e| logs_error(e, ErrorVerb::Read))
    }

    /// Calculate the last log ID by scanning the log store
    fn calculate_last_log_id(&self) -> Result<Option<LogId>, StorageError<NodeId>> {
        let mut iter = self.db.raw_iterator_cf(self.cf_logs()?);
        iter.seek_to_last();

        if iter.valid()
            && let Some(value) = iter.value()
        {
            let entry = Self::deserialize_entry(value)?;
            return Ok(Some(entry.log_id));
        }

        Ok(None)
    }

    /// Delete every entry with index in `[from, to)`
    fn delete_range(&self, from: u64, to: Option<u64>) -> Result<usize, StorageError<NodeId>> {
        let cf = self.cf_logs()?;
        let mut batch = rocksdb::WriteBatch::default();
        let mut removed = 0;
        let mut iter = self.db.raw_iterator_cf(cf);
        iter.seek(Self::encode_log_index(from));

        while iter.valid() {
            if let Some(key) = iter.key() {
                if let Some(to) = to
                    && Self::decode_log_index(key)? >= to
                {
                    break;
                }
                batch.delete_cf(cf, key);
                removed += 1;
            }
            iter.next();
        }

        self.db
            .write(batch)
            .map_err(|e| logs_error(e, ErrorVerb::Delete))?;
        Ok(removed)
    }
}

impl RocksLogStore {
    /// Persist entries in one batch and advance the cached last log id
    async fn write_entries<I>(&self, entries: I) -> Result<usize, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry>,
    {
        let (count, last_log_id) = self.write_batch(entries)?;
        if let Some(log_id) = last_log_id {
            *self.last_log_id.write().await = Some(log_id);
        }
        Ok(count)
    }

    fn write_batch<I>(&self, entries: I) -> Result<(usize, Option<LogId>), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry>,
    {
        let cf = self.cf_logs()?;
        let mut batch = rocksdb::WriteBatch::default();
        let mut last_log_id = None;
        let mut count = 0;

        for entry in entries {
            let key = Self::encode_log_index(entry.log_id.index);
            let value = Self::serialize_entry(&entry)?;
            batch.put_cf(cf, &key, &value);
            last_log_id = Some(entry.log_id);
            count += 1;
        }

        if count > 0 {
            self.db
                .write(batch)
                .map_err(|e| logs_error(e, ErrorVerb::Write))?;
        }
        Ok((count, last_log_id))
    }
}

impl RaftLogReader<TypeConfig> for RocksLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => 0,
        };

        let end = match range.end_bound() {
            Bound::Included(&n) => Some(n + 1),
            Bound::Excluded(&n) => Some(n),
            Bound::Unbounded => None,
        };

        let mut entries = Vec::new();
        let mut iter = self.db.raw_iterator_cf(self.cf_logs()?);
        iter.seek(Self::encode_log_index(start));

        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                if let Some(end) = end
                    && Self::decode_log_index(key)? >= end
                {
                    break;
                }
                entries.push(Self::deserialize_entry(value)?);
            }
            iter.next();
        }

        debug!("Read {} log entries from range {:?}", entries.len(), range);
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for RocksLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = self.meta.read().await.state.last_purged;
        let last_log_id = (*self.last_log_id.read().await).or(last_purged);

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut meta = self.meta.write().await;
        meta.state.vote = Some(*vote);
        meta.persist()
            .map_err(|e| vote_error(e, ErrorVerb::Write))?;
        debug!("Saved vote: {:?}", vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.meta.read().await.state.vote)
    }

    async fn save_committed(&mut self, committed: Option<LogId>) -> Result<(), StorageError<NodeId>> {
        let mut meta = self.meta.write().await;
        meta.state.committed = committed;
        meta.persist()
            .map_err(|e| logs_error(e, ErrorVerb::Write))
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, StorageError<NodeId>> {
        Ok(self.meta.read().await.state.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let count = self.write_entries(entries).await?;
        debug!("Appended {} log entries", count);
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        // Removes log_id itself and everything after it
        let removed = self.delete_range(log_id.index, None)?;

        let last = self.calculate_last_log_id()?;
        let last_purged = self.meta.read().await.state.last_purged;
        *self.last_log_id.write().await = last.or(last_purged);

        debug!("Truncated {} logs since index {}", removed, log_id.index);
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        {
            let mut meta = self.meta.write().await;
            meta.state.last_purged = Some(log_id);
            meta.persist()
                .map_err(|e| logs_error(e, ErrorVerb::Write))?;
        }

        let removed = self.delete_range(0, Some(log_id.index + 1))?;

        let mut last_log_id = self.last_log_id.write().await;
        if last_log_id.map_or(true, |last| last.index < log_id.index) {
            *last_log_id = Some(log_id);
        }

        debug!("Purged {} logs up to index {}", removed, log_id.index);
        Ok(())
    }
}
