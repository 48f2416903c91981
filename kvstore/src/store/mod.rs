//! Replicated key-value store
//!
//! This module holds the state machine side of the replica:
//! - `table`: the committed key-value pairs and their locking discipline
//! - `entry`: the wire form of proposed mutations
//! - `apply`: the loop applying the commit feed to the table
//! - `snapshot`: snapshot capture/restore and the snapshot store contract

pub mod apply;
pub mod entry;
pub mod error;
pub mod snapshot;
pub mod table;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use apply::{ApplyLoop, Commit, CommitSignal, Phase};
pub use entry::{Entry, Operation};
pub use error::{SnapshotError, StoreError};
pub use snapshot::{Position, Snapshot, SnapshotBridge, SnapshotStore};
pub use table::StateTable;

/// Handle to a key-value store backed by the replicated log.
///
/// Reads are served from the local table. Writes are proposed to the
/// consensus layer and only become visible once they come back through the
/// commit feed, so a lookup right after a propose may still see the old value.
#[derive(Clone)]
pub struct KvStore {
    table: Arc<StateTable>,
    proposals: mpsc::Sender<Vec<u8>>,
}

impl KvStore {
    /// Replays the commit feed into `table` until the consensus layer signals
    /// that replay is done, then keeps applying it on a background task.
    ///
    /// The returned handle resolves when the feed closes; an `Err` there is
    /// fatal for the process.
    pub async fn open(
        table: Arc<StateTable>,
        proposals: mpsc::Sender<Vec<u8>>,
        commits: mpsc::Receiver<CommitSignal>,
        errors: mpsc::Receiver<anyhow::Error>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Result<(KvStore, JoinHandle<Result<(), StoreError>>), StoreError> {
        let mut apply = ApplyLoop::new(table.clone(), snapshots, commits, errors);
        apply.replay().await?;
        if apply.phase() == Phase::Stopped {
            log::warn!("commit feed closed before replay completed");
        }
        let handle = tokio::spawn(apply.run());
        Ok((KvStore { table, proposals }, handle))
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.table.lookup(key)
    }

    /// Sends the mutation to the consensus layer without waiting for it to
    /// commit. Blocks only while the propose sink is full.
    pub async fn propose(&self, key: &str, value: &str, op: Operation) -> Result<(), StoreError> {
        let data = Entry::new(key, value, op).encode()?;
        self.proposals
            .send(data)
            .await
            .map_err(|_| StoreError::ProposeClosed)
    }
}
