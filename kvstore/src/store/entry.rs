//! Wire form of a proposed mutation.
//!
//! Entries travel through the replicated log as opaque bytes. The operation is
//! carried as a string tag so that a replica running older code decodes an
//! operation it does not know as a no-op instead of failing.

use serde_derive::{Deserialize, Serialize};

use super::error::StoreError;

/// The effect an entry has on the state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Set,
    Delete,
    Noop,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Set => "SET",
            Operation::Delete => "DEL",
            Operation::Noop => "NOOP",
        }
    }
}

impl From<String> for Operation {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "SET" => Operation::Set,
            "DEL" => Operation::Delete,
            _ => Operation::Noop,
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

/// A single key-value mutation as it is replicated through the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
    pub op: Operation,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, op: Operation) -> Self {
        Entry {
            key: key.into(),
            value: value.into(),
            op,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(self).map_err(StoreError::EncodeEntry)
    }

    pub fn decode(data: &[u8]) -> Result<Entry, StoreError> {
        bincode::deserialize(data).map_err(StoreError::DecodeEntry)
    }
}
