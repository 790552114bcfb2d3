// Raft request and response types
// Log entries carry an opaque business payload; the operation kind drives dispatch

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a committed entry is dispatched to its processor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// A read replicated through the log, answered by `LogProcessor::on_request`
    Read,
    /// A mutation, answered by `LogProcessor::on_apply`
    Modify,
}

/// One replicated entry, immutable once submitted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Business id of the owning raft group
    pub group: String,
    pub kind: OperationKind,
    pub key: String,
    /// Processor defined sub-operation, e.g. `PUT` or `REMOVE`
    pub operation: String,
    pub data: Vec<u8>,
    pub type_hint: Option<String>,
    pub extend_info: BTreeMap<String, String>,
}

impl LogEntry {
    pub fn modify(
        group: impl Into<String>,
        key: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: OperationKind::Modify,
            key: key.into(),
            operation: operation.into(),
            data: Vec::new(),
            type_hint: None,
            extend_info: BTreeMap::new(),
        }
    }

    /// Wrap a read so it goes through the log; used when the read index path fails
    pub fn read(request: &ReadRequest) -> Result<Self, serde_json::Error> {
        Ok(Self {
            group: request.group.clone(),
            kind: OperationKind::Read,
            key: String::new(),
            operation: String::new(),
            data: serde_json::to_vec(request)?,
            type_hint: None,
            extend_info: BTreeMap::new(),
        })
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_type_hint(mut self, type_hint: impl Into<String>) -> Self {
        self.type_hint = Some(type_hint.into());
        self
    }

    pub fn with_extend_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extend_info.insert(key.into(), value.into());
        self
    }

    /// Decode the read request carried by a `Read` entry
    pub fn read_request(&self) -> Result<ReadRequest, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

/// A read against one group's processor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub group: String,
    pub data: Vec<u8>,
    pub extend_info: BTreeMap<String, String>,
}

impl ReadRequest {
    pub fn new(group: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            group: group.into(),
            data,
            extend_info: BTreeMap::new(),
        }
    }

    pub fn with_extend_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extend_info.insert(key.into(), value.into());
        self
    }
}

/// Result of applying an entry or answering a read
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub data: Option<Vec<u8>>,
    pub err_msg: Option<String>,
}

impl Response {
    /// Create a successful response
    pub fn success() -> Self {
        Self {
            success: true,
            data: None,
            err_msg: None,
        }
    }

    /// Create a successful response with data
    pub fn success_with_data(data: Vec<u8>) -> Self {
        Self {
            success: true,
            data: Some(data),
            err_msg: None,
        }
    }

    /// Create a failed response with message
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            err_msg: Some(message.into()),
        }
    }
}
