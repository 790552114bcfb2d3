// Key-value log processor
// Applies PUT/REMOVE entries to an in-memory map and answers typed reads from it

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    LOAD_COMMAND, PUT_COMMAND, READ_ALL_KEYS, READ_BATCH_GET, READ_CONTAINS, READ_GET_ALL,
    READ_GET_BY_KEY, READ_GET_CHECKSUM, READ_GET_ITEM_BY_BATCH, READ_GET_ITEM_BY_KEY, READ_TYPE,
    REMOVE_COMMAND,
};
use crate::raft::processor::{LogProcessor, SnapshotOperation};
use crate::raft::request::{LogEntry, ReadRequest, Response};
use crate::raft::snapshot::{LocalFileMeta, SnapshotReader, SnapshotWriter};

pub const KV_SNAPSHOT_FILE: &str = "kv_store.json";
const CHECKSUM_PROP: &str = "checksum";

/// A stored value with the type it was written as
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub bytes: Vec<u8>,
    pub type_hint: Option<String>,
}

pub fn checksum(bytes: &[u8]) -> String {
    const_hex::encode(Md5::digest(bytes))
}

type KvData = RwLock<BTreeMap<String, Item>>;

/// Saves and restores the whole map as `kv_store.json`
pub struct KvSnapshotOperation {
    data: Arc<KvData>,
}

impl SnapshotOperation for KvSnapshotOperation {
    fn name(&self) -> &str {
        "kv_store"
    }

    fn on_snapshot_save(&self, writer: &mut SnapshotWriter) -> anyhow::Result<()> {
        let content = serde_json::to_vec(&*self.data.read())?;
        let path = writer.path().join(KV_SNAPSHOT_FILE);
        fs::write(&path, &content).with_context(|| format!("writing {}", path.display()))?;

        let meta = LocalFileMeta::new().append(CHECKSUM_PROP, checksum(&content));
        if !writer.add_file(KV_SNAPSHOT_FILE, meta) {
            bail!("snapshot file {} already registered", KV_SNAPSHOT_FILE);
        }
        Ok(())
    }

    fn on_snapshot_load(&self, reader: &SnapshotReader) -> anyhow::Result<()> {
        let Some(meta) = reader.file_meta(KV_SNAPSHOT_FILE) else {
            bail!("snapshot has no {}", KV_SNAPSHOT_FILE);
        };
        let path = reader.path().join(KV_SNAPSHOT_FILE);
        let content = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;

        if let Some(expected) = meta.get(CHECKSUM_PROP) {
            let actual = checksum(&content);
            if actual != expected {
                bail!("checksum mismatch for {}: {} != {}", KV_SNAPSHOT_FILE, actual, expected);
            }
        }

        let items: BTreeMap<String, Item> = serde_json::from_slice(&content)?;
        info!(items = items.len(), "Loaded key-value snapshot");
        *self.data.write() = items;
        Ok(())
    }
}

pub struct KvLogProcessor {
    group: String,
    data: Arc<KvData>,
    snapshot: Arc<KvSnapshotOperation>,
}

impl KvLogProcessor {
    pub fn new(group: impl Into<String>) -> Self {
        let data = Arc::new(RwLock::new(BTreeMap::new()));
        Self {
            group: group.into(),
            snapshot: Arc::new(KvSnapshotOperation { data: data.clone() }),
            data,
        }
    }

    /// Local view, no consistency guarantee
    pub fn local_items(&self) -> BTreeMap<String, Item> {
        self.data.read().clone()
    }

    fn read(&self, kind: &str, keys: &[String]) -> anyhow::Result<Vec<u8>> {
        let data = self.data.read();
        let first = || keys.first().with_context(|| format!("{} needs a key", kind));

        let bytes = match kind {
            READ_CONTAINS => serde_json::to_vec(&data.contains_key(first()?))?,
            READ_GET_BY_KEY => serde_json::to_vec(&data.get(first()?).map(|i| &i.bytes))?,
            READ_GET_ITEM_BY_KEY => serde_json::to_vec(&data.get(first()?))?,
            READ_BATCH_GET => {
                let found: BTreeMap<&String, &Vec<u8>> = keys
                    .iter()
                    .filter_map(|k| data.get(k).map(|i| (k, &i.bytes)))
                    .collect();
                serde_json::to_vec(&found)?
            }
            READ_GET_ITEM_BY_BATCH => {
                let found: BTreeMap<&String, &Item> = keys
                    .iter()
                    .filter_map(|k| data.get(k).map(|i| (k, i)))
                    .collect();
                serde_json::to_vec(&found)?
            }
            READ_GET_CHECKSUM => {
                serde_json::to_vec(&data.get(first()?).map(|i| checksum(&i.bytes)))?
            }
            READ_ALL_KEYS => serde_json::to_vec(&data.keys().collect::<Vec<_>>())?,
            READ_GET_ALL => serde_json::to_vec(&*data)?,
            other => bail!("unknown read type: {}", other),
        };
        Ok(bytes)
    }
}

#[async_trait]
impl LogProcessor for KvLogProcessor {
    fn group(&self) -> &str {
        &self.group
    }

    async fn on_request(&self, request: &ReadRequest) -> anyhow::Result<Response> {
        let kind = request
            .extend_info
            .get(READ_TYPE)
            .map(String::as_str)
            .unwrap_or_default();
        let keys: Vec<String> = if request.data.is_empty() {
            Vec::new()
        } else {
            match serde_json::from_slice(&request.data) {
                Ok(keys) => keys,
                Err(e) => return Ok(Response::failure(format!("invalid read keys: {}", e))),
            }
        };

        match self.read(kind, &keys) {
            Ok(bytes) => Ok(Response::success_with_data(bytes)),
            Err(e) => Ok(Response::failure(e.to_string())),
        }
    }

    async fn on_apply(&self, entry: &LogEntry) -> anyhow::Result<Response> {
        if entry.operation.eq_ignore_ascii_case(PUT_COMMAND) {
            let item = Item {
                bytes: entry.data.clone(),
                type_hint: entry.type_hint.clone(),
            };
            self.data.write().insert(entry.key.clone(), item);
            debug!(group = %self.group, key = %entry.key, "Put applied");
            return Ok(Response::success());
        }
        if entry.operation.eq_ignore_ascii_case(LOAD_COMMAND) {
            let items: BTreeMap<String, Item> = match serde_json::from_slice(&entry.data) {
                Ok(items) => items,
                Err(e) => return Ok(Response::failure(format!("invalid load data: {}", e))),
            };
            let count = items.len();
            self.data.write().extend(items);
            debug!(group = %self.group, items = count, "Load applied");
            return Ok(Response::success());
        }
        if entry.operation.eq_ignore_ascii_case(REMOVE_COMMAND) {
            self.data.write().remove(&entry.key);
            debug!(group = %self.group, key = %entry.key, "Remove applied");
            return Ok(Response::success());
        }
        Ok(Response::failure(format!("unknown operation: {}", entry.operation)))
    }

    fn snapshot_operations(&self) -> Vec<Arc<dyn SnapshotOperation>> {
        vec![self.snapshot.clone()]
    }
}
