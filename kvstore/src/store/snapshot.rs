//! Snapshot capture and restore for the state table, and the contract of the
//! store that persists snapshots between restarts.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::{SnapshotError, StoreError};
use super::table::StateTable;
use crate::metrics::SNAPSHOT_COUNTER_VEC;

/// Log position a snapshot was taken at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub term: u64,
    pub index: u64,
}

/// Complete serialization of the state table at a log position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub position: Position,
    pub payload: Vec<u8>,
}

/// Persists and loads the latest snapshot.
///
/// `load` reports [`SnapshotError::NotFound`] when nothing has been saved yet;
/// any other error means the stored snapshot cannot be trusted.
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<Snapshot, SnapshotError>;
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;
}

/// Serializes the state table on demand.
#[derive(Debug, Clone)]
pub struct SnapshotBridge {
    table: Arc<StateTable>,
}

impl SnapshotBridge {
    pub fn new(table: Arc<StateTable>) -> Self {
        SnapshotBridge { table }
    }

    /// Serializes the whole table under the exclusive lock.
    pub fn capture(&self) -> Result<Vec<u8>, StoreError> {
        let data = self
            .table
            .exclusive(|kv| serde_json::to_vec(kv))
            .map_err(StoreError::EncodeSnapshot)?;
        SNAPSHOT_COUNTER_VEC.with_label_values(&["capture"]).inc();
        Ok(data)
    }
}

/// Decodes a payload produced by [`SnapshotBridge::capture`] into a fresh map.
pub fn restore(payload: &[u8]) -> Result<HashMap<String, String>, StoreError> {
    serde_json::from_slice(payload).map_err(StoreError::DecodeSnapshot)
}
