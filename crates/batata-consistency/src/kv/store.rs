// Raft backed key-value store
// Writes go through the group log; reads go through the linearizable read path

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::processor::{Item, KvLogProcessor};
use super::{
    LOAD_COMMAND, PUT_COMMAND, READ_ALL_KEYS, READ_BATCH_GET, READ_CONTAINS, READ_GET_ALL,
    READ_GET_BY_KEY, READ_GET_CHECKSUM, READ_GET_ITEM_BY_BATCH, READ_GET_ITEM_BY_KEY, READ_TYPE,
    REMOVE_COMMAND,
};
use crate::error::{ConsistencyError, Result};
use crate::raft::request::{LogEntry, ReadRequest, Response};
use crate::raft::server::RaftServer;

pub struct RaftKvStore {
    group: String,
    server: Arc<RaftServer>,
    processor: Arc<KvLogProcessor>,
}

impl RaftKvStore {
    /// Create the store and register its processor for `group`
    pub async fn open(group: impl Into<String>, server: &Arc<RaftServer>) -> Result<Self> {
        let group = group.into();
        let processor = Arc::new(KvLogProcessor::new(group.clone()));
        server.register(processor.clone()).await?;
        Ok(Self {
            group,
            server: server.clone(),
            processor,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let entry = LogEntry::modify(&self.group, key, PUT_COMMAND).with_data(bytes);
        self.submit(entry).await.map(|_| ())
    }

    /// Store `value` as JSON, recording its type name
    pub async fn put_value<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let entry = LogEntry::modify(&self.group, key, PUT_COMMAND)
            .with_data(serde_json::to_vec(value)?)
            .with_type_hint(std::any::type_name::<T>());
        self.submit(entry).await.map(|_| ())
    }

    /// Put every item in a single log entry; all of them apply or none do
    pub async fn load(&self, items: &BTreeMap<String, Item>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let entry = LogEntry::modify(&self.group, "", LOAD_COMMAND)
            .with_data(serde_json::to_vec(items)?);
        self.submit(entry).await.map(|_| ())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let entry = LogEntry::modify(&self.group, key, REMOVE_COMMAND);
        self.submit(entry).await.map(|_| ())
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        self.read(READ_CONTAINS, &[key]).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.read(READ_GET_BY_KEY, &[key]).await
    }

    /// Read a value written by `put_value`
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get_item(&self, key: &str) -> Result<Option<Item>> {
        self.read(READ_GET_ITEM_BY_KEY, &[key]).await
    }

    /// Values of the keys that exist
    pub async fn batch_get(&self, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>> {
        self.read(READ_BATCH_GET, keys).await
    }

    /// Values written by `put_value` for the keys that exist
    pub async fn batch_get_values<T: DeserializeOwned>(
        &self,
        keys: &[&str],
    ) -> Result<BTreeMap<String, T>> {
        let mut values = BTreeMap::new();
        for (key, bytes) in self.batch_get(keys).await? {
            let value = serde_json::from_slice(&bytes)?;
            values.insert(key, value);
        }
        Ok(values)
    }

    pub async fn get_items(&self, keys: &[&str]) -> Result<BTreeMap<String, Item>> {
        self.read(READ_GET_ITEM_BY_BATCH, keys).await
    }

    /// md5 hex of the stored value
    pub async fn checksum(&self, key: &str) -> Result<Option<String>> {
        self.read(READ_GET_CHECKSUM, &[key]).await
    }

    pub async fn all_keys(&self) -> Result<Vec<String>> {
        self.read(READ_ALL_KEYS, &[]).await
    }

    pub async fn get_all(&self) -> Result<BTreeMap<String, Item>> {
        self.read(READ_GET_ALL, &[]).await
    }

    /// Local replica contents without a read barrier
    pub fn local_items(&self) -> BTreeMap<String, Item> {
        self.processor.local_items()
    }

    async fn submit(&self, entry: LogEntry) -> Result<Response> {
        let response = self.server.commit(entry).await?;
        self.check(response)
    }

    async fn read<R: DeserializeOwned>(&self, kind: &str, keys: &[&str]) -> Result<R> {
        let request = ReadRequest::new(&self.group, serde_json::to_vec(keys)?)
            .with_extend_info(READ_TYPE, kind);
        let response = self.check(self.server.get(request).await?)?;
        let data = response.data.unwrap_or_default();
        Ok(serde_json::from_slice(&data)?)
    }

    fn check(&self, response: Response) -> Result<Response> {
        if response.success {
            Ok(response)
        } else {
            Err(ConsistencyError::Rejected {
                group: self.group.clone(),
                message: response.err_msg.unwrap_or_default(),
            })
        }
    }
}
