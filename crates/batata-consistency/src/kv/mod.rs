// Replicated key-value store
// A ready-made processor plus a client facade over one raft group

pub mod processor;
pub mod store;

pub use processor::{Item, KvLogProcessor, KvSnapshotOperation};
pub use store::RaftKvStore;

pub const PUT_COMMAND: &str = "PUT";
pub const REMOVE_COMMAND: &str = "REMOVE";
/// Puts a JSON map of items in one entry
pub const LOAD_COMMAND: &str = "LOAD";

/// Extend info key selecting the local accessor of a read
pub const READ_TYPE: &str = "type";

pub const READ_CONTAINS: &str = "contains";
pub const READ_GET_BY_KEY: &str = "getByKey";
pub const READ_GET_ITEM_BY_KEY: &str = "getItemByKey";
pub const READ_BATCH_GET: &str = "batchGet";
pub const READ_GET_ITEM_BY_BATCH: &str = "getItemByBatch";
pub const READ_GET_CHECKSUM: &str = "getCheckSum";
pub const READ_ALL_KEYS: &str = "allKeys";
pub const READ_GET_ALL: &str = "getAll";
