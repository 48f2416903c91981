//! Apply loop
//!
//! Consumes the commit feed produced by the consensus layer and applies it to
//! the state table, one entry at a time and strictly in feed order. A sentinel
//! (`None`) on the feed means "replay is done or a snapshot was installed":
//! the loop then reloads the latest snapshot from the snapshot store.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};

use super::entry::{Entry, Operation};
use super::error::{SnapshotError, StoreError};
use super::snapshot::{restore, SnapshotStore};
use super::table::StateTable;
use crate::metrics::{APPLIED_COUNTER_VEC, SNAPSHOT_COUNTER_VEC};

/// A batch of committed entries.
#[derive(Debug, Default)]
pub struct Commit {
    /// Encoded entries, in log order.
    pub entries: Vec<Vec<u8>>,
    /// Fired once every entry of the batch is visible in the table.
    pub applied: Option<oneshot::Sender<()>>,
}

impl Commit {
    pub fn new(entries: Vec<Vec<u8>>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let commit = Commit {
            entries,
            applied: Some(tx),
        };
        (commit, rx)
    }
}

/// Item of the commit feed. `None` is the snapshot sentinel.
pub type CommitSignal = Option<Commit>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Replaying,
    Live,
    Stopped,
}

pub struct ApplyLoop {
    table: Arc<StateTable>,
    snapshots: Arc<dyn SnapshotStore>,
    commits: mpsc::Receiver<CommitSignal>,
    errors: mpsc::Receiver<anyhow::Error>,
    phase: Phase,
}

impl ApplyLoop {
    pub fn new(
        table: Arc<StateTable>,
        snapshots: Arc<dyn SnapshotStore>,
        commits: mpsc::Receiver<CommitSignal>,
        errors: mpsc::Receiver<anyhow::Error>,
    ) -> Self {
        ApplyLoop {
            table,
            snapshots,
            commits,
            errors,
            phase: Phase::Replaying,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Applies the feed until the first sentinel has been handled.
    pub async fn replay(&mut self) -> Result<(), StoreError> {
        while self.phase == Phase::Replaying {
            self.step().await?;
        }
        Ok(())
    }

    /// Applies the feed until it closes. Any error returned is fatal: the
    /// table can no longer be trusted to match the log.
    pub async fn run(mut self) -> Result<(), StoreError> {
        while self.phase != Phase::Stopped {
            self.step().await?;
        }
        info!("apply loop stopped");
        Ok(())
    }

    async fn step(&mut self) -> Result<(), StoreError> {
        let result = match self.commits.recv().await {
            Some(Some(commit)) => self.apply_commit(commit),
            Some(None) => self.on_sentinel(),
            None => self.on_closed().await,
        };
        if result.is_err() {
            self.phase = Phase::Stopped;
        }
        result
    }

    fn apply_commit(&mut self, commit: Commit) -> Result<(), StoreError> {
        for data in &commit.entries {
            self.apply_entry(data)?;
        }
        if let Some(applied) = commit.applied {
            let _ = applied.send(());
        }
        Ok(())
    }

    fn apply_entry(&self, data: &[u8]) -> Result<(), StoreError> {
        let entry = Entry::decode(data)?;
        debug!("do commit {} {} {}", entry.op.as_str(), entry.key, entry.value);
        match entry.op {
            Operation::Set => self.table.set(entry.key, entry.value),
            Operation::Delete => self.table.delete(&entry.key),
            Operation::Noop => {}
        }
        APPLIED_COUNTER_VEC
            .with_label_values(&[entry.op.as_str()])
            .inc();
        Ok(())
    }

    fn on_sentinel(&mut self) -> Result<(), StoreError> {
        match self.snapshots.load() {
            Ok(snapshot) => {
                info!(
                    "loading snapshot at term {} and index {}",
                    snapshot.position.term, snapshot.position.index
                );
                let kv = restore(&snapshot.payload)?;
                self.table.replace(kv);
                SNAPSHOT_COUNTER_VEC.with_label_values(&["restore"]).inc();
                info!("restored {} keys from snapshot", self.table.len());
            }
            Err(SnapshotError::NotFound) => debug!("no snapshot to load"),
            Err(e) => return Err(e.into()),
        }
        if self.phase == Phase::Replaying {
            info!("replay complete");
            self.phase = Phase::Live;
        }
        Ok(())
    }

    async fn on_closed(&mut self) -> Result<(), StoreError> {
        self.phase = Phase::Stopped;
        match self.errors.recv().await {
            Some(err) => Err(StoreError::Upstream(err)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::snapshot::tests::MemSnapshotStore;
    use crate::store::snapshot::{Position, Snapshot, SnapshotBridge};
    use anyhow::anyhow;

    struct Harness {
        table: Arc<StateTable>,
        commits: mpsc::Sender<CommitSignal>,
        errors: mpsc::Sender<anyhow::Error>,
        apply: ApplyLoop,
    }

    fn harness(snapshots: MemSnapshotStore) -> Harness {
        let table = Arc::new(StateTable::new());
        let (commits, commit_rx) = mpsc::channel(64);
        let (errors, error_rx) = mpsc::channel(1);
        let apply = ApplyLoop::new(table.clone(), Arc::new(snapshots), commit_rx, error_rx);
        Harness {
            table,
            commits,
            errors,
            apply,
        }
    }

    fn set(key: &str, value: &str) -> Vec<u8> {
        Entry::new(key, value, Operation::Set).encode().unwrap()
    }

    fn del(key: &str) -> Vec<u8> {
        Entry::new(key, "", Operation::Delete).encode().unwrap()
    }

    fn payload(pairs: &[(&str, &str)]) -> Vec<u8> {
        let table = Arc::new(StateTable::new());
        for (k, v) in pairs {
            table.set(k.to_string(), v.to_string());
        }
        SnapshotBridge::new(table).capture().unwrap()
    }

    async fn close(h: Harness) -> (Arc<StateTable>, Result<(), StoreError>) {
        let Harness {
            table,
            commits,
            errors,
            apply,
        } = h;
        drop(commits);
        drop(errors);
        (table, apply.run().await)
    }

    #[tokio::test]
    async fn test_apply_in_order() {
        let h = harness(MemSnapshotStore::default());
        let (commit, applied) = Commit::new(vec![set("/a", "1"), set("/b", "2"), set("/a", "3")]);
        h.commits.send(Some(commit)).await.unwrap();
        h.commits
            .send(Some(Commit {
                entries: vec![del("/b"), set("/c", "4")],
                applied: None,
            }))
            .await
            .unwrap();

        let (table, result) = close(h).await;
        result.unwrap();
        applied.await.unwrap();
        assert_eq!(table.lookup("/a"), Some("3".to_string()));
        assert_eq!(table.lookup("/b"), None);
        assert_eq!(table.lookup("/c"), Some("4".to_string()));
    }

    #[tokio::test]
    async fn test_delete_twice() {
        let h = harness(MemSnapshotStore::default());
        let (commit, _) = Commit::new(vec![set("/a", "1"), del("/a"), del("/a")]);
        h.commits.send(Some(commit)).await.unwrap();

        let (table, result) = close(h).await;
        result.unwrap();
        assert_eq!(table.lookup("/a"), None);
    }

    #[tokio::test]
    async fn test_noop_leaves_table() {
        let h = harness(MemSnapshotStore::default());
        let noop = Entry::new("/a", "x", Operation::Noop).encode().unwrap();
        let (commit, _) = Commit::new(vec![set("/a", "1"), noop]);
        h.commits.send(Some(commit)).await.unwrap();

        let (table, result) = close(h).await;
        result.unwrap();
        assert_eq!(table.lookup("/a"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_replay_goes_live_without_snapshot() {
        let mut h = harness(MemSnapshotStore::default());
        let (commit, _) = Commit::new(vec![set("/a", "1")]);
        h.commits.send(Some(commit)).await.unwrap();
        h.commits.send(None).await.unwrap();

        assert_eq!(h.apply.phase(), Phase::Replaying);
        h.apply.replay().await.unwrap();
        assert_eq!(h.apply.phase(), Phase::Live);
        assert_eq!(h.table.lookup("/a"), Some("1".to_string()));

        let (_, result) = close(h).await;
        result.unwrap();
    }

    #[tokio::test]
    async fn test_sentinel_restores_snapshot() {
        let snapshot = Snapshot {
            position: Position { term: 3, index: 42 },
            payload: payload(&[("/a", "snap"), ("/b", "2")]),
        };
        let mut h = harness(MemSnapshotStore::with(snapshot));
        let (commit, _) = Commit::new(vec![set("/a", "stale"), set("/z", "gone")]);
        h.commits.send(Some(commit)).await.unwrap();
        h.commits.send(None).await.unwrap();
        let (commit, _) = Commit::new(vec![set("/b", "newer")]);
        h.commits.send(Some(commit)).await.unwrap();

        h.apply.replay().await.unwrap();
        assert_eq!(h.table.lookup("/a"), Some("snap".to_string()));
        assert_eq!(h.table.lookup("/z"), None);

        let (table, result) = close(h).await;
        result.unwrap();
        assert_eq!(table.lookup("/a"), Some("snap".to_string()));
        assert_eq!(table.lookup("/b"), Some("newer".to_string()));
    }

    #[tokio::test]
    async fn test_live_sentinel_reloads() {
        let store = MemSnapshotStore::default();
        let mut h = harness(store);
        h.commits.send(None).await.unwrap();
        h.apply.replay().await.unwrap();

        let (commit, _) = Commit::new(vec![set("/a", "1")]);
        h.commits.send(Some(commit)).await.unwrap();
        h.commits.send(None).await.unwrap();

        let (table, result) = close(h).await;
        result.unwrap();
        assert_eq!(table.lookup("/a"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_decode_error_is_fatal() {
        let h = harness(MemSnapshotStore::default());
        let (commit, applied) = Commit::new(vec![set("/a", "1"), vec![0xff, 0xff, 0xff]]);
        h.commits.send(Some(commit)).await.unwrap();
        let (commit, _) = Commit::new(vec![set("/b", "2")]);
        h.commits.send(Some(commit)).await.unwrap();

        let (table, result) = close(h).await;
        assert!(matches!(result, Err(StoreError::DecodeEntry(_))));
        assert!(applied.await.is_err());
        assert_eq!(table.lookup("/b"), None);
    }

    #[tokio::test]
    async fn test_snapshot_store_error_is_fatal() {
        let mut h = harness(MemSnapshotStore::broken());
        h.commits.send(None).await.unwrap();
        let result = h.apply.replay().await;
        assert!(matches!(
            result,
            Err(StoreError::Snapshot(SnapshotError::Corrupt(_)))
        ));
        assert_eq!(h.apply.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_payload_is_fatal() {
        let snapshot = Snapshot {
            position: Position { term: 1, index: 5 },
            payload: b"not json".to_vec(),
        };
        let mut h = harness(MemSnapshotStore::with(snapshot));
        h.table.set("/a".to_string(), "1".to_string());
        h.commits.send(None).await.unwrap();

        let result = h.apply.replay().await;
        assert!(matches!(result, Err(StoreError::DecodeSnapshot(_))));
        assert_eq!(h.table.lookup("/a"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_upstream_error_is_fatal() {
        let Harness {
            commits,
            errors,
            apply,
            ..
        } = harness(MemSnapshotStore::default());
        errors.send(anyhow!("raft storage failed")).await.unwrap();
        drop(errors);
        drop(commits);

        let result = apply.run().await;
        assert!(matches!(result, Err(StoreError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_feed_closed_during_replay() {
        let Harness {
            commits,
            errors,
            mut apply,
            ..
        } = harness(MemSnapshotStore::default());
        drop(commits);
        drop(errors);

        apply.replay().await.unwrap();
        assert_eq!(apply.phase(), Phase::Stopped);
        apply.run().await.unwrap();
    }
}
