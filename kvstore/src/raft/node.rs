//! Raft node implementation
//! This module drives a raft-rs `RawNode`: it steps peer messages, proposes
//! entries and configuration changes, persists ready state and publishes
//! committed entries on the commit feed consumed by the key-value store.

#![allow(clippy::field_reassign_with_default)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use slog::Drain;
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use protobuf::Message as PbMessage;
use raft::{prelude::*, Storage};

use crate::raft::StateMachine;
use crate::store::{Commit, CommitSignal, StoreError};
use slog::o;

use super::storage::{FileSnapshotStore, RaftStorage};

// Constants
const TICK_INTERVAL: Duration = Duration::from_millis(100); // Interval for raft tick
const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer

/// Default Raft configuration
/// Creates a new Raft configuration with default values
fn default_config(id: u64, applied: u64) -> Config {
    Config {
        id,
        election_tick: 10, // Number of ticks before starting election
        heartbeat_tick: 3, // Number of ticks between heartbeats
        applied,
        max_size_per_msg: 1024 * 1024,
        max_inflight_msgs: 256,
        ..Default::default()
    }
}

/// Empty normal entries are appended by a new leader. An empty
/// `EntryConfChangeV2` is not one: it leaves a joint configuration.
fn is_leader_noop(entry: &Entry) -> bool {
    entry.get_entry_type() == EntryType::EntryNormal && entry.data.is_empty()
}

/// Transport addresses of the peers, keyed by node id. Updated as
/// membership changes are applied.
pub type PeerBook = Arc<RwLock<HashMap<u64, String>>>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),
    #[error("protobuf error: {0}")]
    Protobuf(#[from] protobuf::ProtobufError),
    #[error("state machine error: {0}")]
    Store(#[from] StoreError),
    #[error("commit feed closed")]
    CommitFeedClosed,
}

/// Static settings of a node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub id: u64,
    pub voters: Vec<u64>,
    pub join: bool,
    /// Entries applied between two snapshots.
    pub snapshot_count: u64,
    /// Entries kept in the log after compaction so slow followers can catch
    /// up without a snapshot.
    pub snapshot_catch_up_entries: u64,
}

/// Channels connecting the node to the transport and the key-value store.
pub struct NodeChannels {
    pub my_mailbox: Receiver<Message>,
    pub out_mailbox: Sender<Message>,
    pub proposals: Receiver<Vec<u8>>,
    pub conf_changes: Receiver<ConfChange>,
    pub commits: Sender<CommitSignal>,
    pub errors: Sender<anyhow::Error>,
}

/// Builds the slog logger raft-rs logs through.
pub fn raft_logger() -> slog::Logger {
    #[cfg(feature = "slog-term")]
    {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        slog::Logger::root(drain, o!())
    }
    #[cfg(not(feature = "slog-term"))]
    {
        let _ = LOGGER_CHANNEL_SIZE;
        slog::Logger::root(slog::Discard, o!())
    }
}

/// Raft node implementation
/// This struct represents a Raft node with its associated state and components
pub struct Node<S: StateMachine> {
    raft_group: RawNode<RaftStorage>, // The core Raft node implementation
    out_mailbox: Sender<Message>,     // Channel for sending messages to other nodes
    my_mailbox: Receiver<Message>,    // Channel for receiving messages from other nodes
    proposals: Receiver<Vec<u8>>,     // Channel for receiving proposals
    conf_changes: Receiver<ConfChange>,
    commits: Sender<CommitSignal>, // Channel publishing committed entries
    errors: Sender<anyhow::Error>,
    state_machine: S, // Captures state machine snapshots
    peers: PeerBook,
    conf_state: ConfState,
    snapshot_index: u64,
    options: NodeOptions,
}

impl<S: StateMachine + Send + 'static> Node<S> {
    fn create(
        options: NodeOptions,
        channels: NodeChannels,
        state_machine: S,
        snapshots: Arc<FileSnapshotStore>,
        peers: PeerBook,
        logger: &slog::Logger,
    ) -> Result<Self, NodeError> {
        let logger = logger.new(o!("tag" => format!("peer_{}", options.id)));
        let storage = RaftStorage::open(snapshots, options.voters.clone(), options.join)?;
        let conf_state = storage.initial_state()?.conf_state;
        let snapshot_index = storage.first_index()? - 1;
        let cfg = default_config(options.id, snapshot_index);
        let raft_group = RawNode::new(&cfg, storage, &logger)?;

        Ok(Node {
            raft_group,
            out_mailbox: channels.out_mailbox,
            my_mailbox: channels.my_mailbox,
            proposals: channels.proposals,
            conf_changes: channels.conf_changes,
            commits: channels.commits,
            errors: channels.errors,
            state_machine,
            peers,
            conf_state,
            snapshot_index,
            options,
        })
    }

    /// Start a new raft node
    /// The node runs on its own task until the propose channel closes or a
    /// fatal error is reported on the error feed. Either way it closes the
    /// commit feed when it exits.
    pub fn start_raft(
        options: NodeOptions,
        channels: NodeChannels,
        state_machine: S,
        snapshots: Arc<FileSnapshotStore>,
        peers: PeerBook,
        logger: &slog::Logger,
    ) -> Result<JoinHandle<()>, NodeError> {
        let node = Node::create(options, channels, state_machine, snapshots, peers, logger)?;
        Ok(tokio::spawn(node.run_background_tasks()))
    }

    /// Run background tasks for the raft node
    /// Main event loop that handles messages, proposals, and periodic tasks
    async fn run_background_tasks(mut self) {
        // Nothing to replay from a write-ahead log: tell the store to pick up
        // whatever snapshot it has.
        if self.commits.send(None).await.is_err() {
            return;
        }

        let mut ticker = time::interval(TICK_INTERVAL);
        let mut mailbox_open = true;
        let mut conf_changes_open = true;

        loop {
            let raft_group = &mut self.raft_group;
            tokio::select! {
                msg = self.my_mailbox.recv(), if mailbox_open => match msg {
                    Some(msg) => {
                        // Process incoming messages
                        Self::step(raft_group, msg);
                        while let Ok(msg) = self.my_mailbox.try_recv() {
                            Self::step(raft_group, msg);
                        }
                    }
                    None => mailbox_open = false,
                },
                proposal = self.proposals.recv() => match proposal {
                    Some(data) => {
                        Self::propose(raft_group, data);
                        while let Ok(data) = self.proposals.try_recv() {
                            Self::propose(raft_group, data);
                        }
                    }
                    None => {
                        log::info!("propose channel closed, stopping raft node");
                        break;
                    }
                },
                cc = self.conf_changes.recv(), if conf_changes_open => match cc {
                    Some(cc) => Self::propose_conf_change(raft_group, cc),
                    None => conf_changes_open = false,
                },
                _ = ticker.tick() => {
                    raft_group.tick();
                }
            }

            // Process ready state
            if let Err(e) = self.on_ready().await {
                log::error!("raft node failed: {}", e);
                let _ = self.errors.send(e.into()).await;
                break;
            }
        }
    }

    fn step(raft_group: &mut RawNode<RaftStorage>, msg: Message) {
        if let Err(e) = raft_group.step(msg) {
            log::debug!("failed to step raft message: {}", e);
        }
    }

    /// Propose a new entry to the raft group
    /// Followers forward the proposal to the leader; without a known leader
    /// it is dropped, which callers tolerate since proposals are not acked.
    fn propose(raft_group: &mut RawNode<RaftStorage>, data: Vec<u8>) {
        if let Err(e) = raft_group.propose(vec![], data) {
            log::warn!("proposal dropped: {}", e);
        }
    }

    fn propose_conf_change(raft_group: &mut RawNode<RaftStorage>, cc: ConfChange) {
        if let Err(e) = raft_group.propose_conf_change(vec![], cc) {
            log::warn!("conf change dropped: {}", e);
        }
    }

    /// Process raft ready state
    /// Handles the ready state of the Raft node, including message processing,
    /// snapshot handling, and state persistence
    async fn on_ready(&mut self) -> Result<(), NodeError> {
        if !self.raft_group.has_ready() {
            return Ok(());
        }

        let mut ready = self.raft_group.ready();

        // Step 1: Handle messages
        if !ready.messages().is_empty() {
            Self::handle_out_messages(&self.out_mailbox, &ready.take_messages());
        }

        // Step 2: Handle snapshot if any
        if *ready.snapshot() != Snapshot::default() {
            self.handle_snapshot(ready.snapshot().clone()).await?;
        }

        // Step 3: Handle committed entries
        self.handle_committed_entries(ready.take_committed_entries())
            .await?;

        // Step 4: Persist raft state
        Self::persist_raft_state(&mut self.raft_group, &ready)?;
        if !ready.persisted_messages().is_empty() {
            Self::handle_out_messages(&self.out_mailbox, &ready.take_persisted_messages());
        }

        // Step 5: Advance raft state
        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.raft.raft_log.store.set_commit(commit);
        }
        Self::handle_out_messages(&self.out_mailbox, light_rd.messages());
        self.handle_committed_entries(light_rd.take_committed_entries())
            .await?;
        self.raft_group.advance_apply();

        self.maybe_trigger_snapshot()
    }

    /// Handle raft messages
    /// Sends messages to other nodes in the cluster
    fn handle_out_messages(sender: &Sender<Message>, messages: &[Message]) {
        for msg in messages {
            if let Err(e) = sender.try_send(msg.clone()) {
                log::error!("Failed to send raft message {:?}, Raft will retry", e);
            }
        }
    }

    /// Installs a snapshot sent by the leader, then signals the store to
    /// reload its state from it.
    async fn handle_snapshot(&mut self, snapshot: Snapshot) -> Result<(), NodeError> {
        let metadata = snapshot.get_metadata().clone();
        log::info!(
            "installing snapshot at term {} and index {}",
            metadata.term,
            metadata.index
        );
        self.raft_group
            .raft
            .raft_log
            .store
            .apply_snapshot(&snapshot)?;
        self.conf_state = metadata.get_conf_state().clone();
        self.snapshot_index = metadata.index;
        self.commits
            .send(None)
            .await
            .map_err(|_| NodeError::CommitFeedClosed)
    }

    /// Process committed entries
    /// Applies configuration changes in place and publishes normal entries on
    /// the commit feed, waiting until the store has applied them.
    async fn handle_committed_entries(&mut self, entries: Vec<Entry>) -> Result<(), NodeError> {
        let mut data = Vec::new();
        for entry in entries {
            if is_leader_noop(&entry) {
                continue;
            }

            match entry.get_entry_type() {
                EntryType::EntryConfChange => {
                    let mut cc = ConfChange::default();
                    cc.merge_from_bytes(&entry.data)?;
                    self.apply_conf_change(&cc)?;
                }
                EntryType::EntryConfChangeV2 => {
                    let mut cc = ConfChangeV2::default();
                    cc.merge_from_bytes(&entry.data)?;
                    let cs = self.raft_group.apply_conf_change(&cc)?;
                    self.raft_group.raft.raft_log.store.set_conf_state(cs.clone());
                    self.conf_state = cs;
                }
                EntryType::EntryNormal => data.push(entry.data.to_vec()),
            }
        }

        if data.is_empty() {
            return Ok(());
        }
        let (commit, applied) = Commit::new(data);
        self.commits
            .send(Some(commit))
            .await
            .map_err(|_| NodeError::CommitFeedClosed)?;
        applied.await.map_err(|_| NodeError::CommitFeedClosed)
    }

    fn apply_conf_change(&mut self, cc: &ConfChange) -> Result<(), NodeError> {
        let cs = self.raft_group.apply_conf_change(cc)?;
        self.raft_group.raft.raft_log.store.set_conf_state(cs.clone());
        self.conf_state = cs;

        match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if cc.node_id != self.options.id && !cc.context.is_empty() {
                    let addr = String::from_utf8_lossy(&cc.context).to_string();
                    log::info!("add peer {} at {}", cc.node_id, addr);
                    self.peers.write().insert(cc.node_id, addr);
                }
            }
            ConfChangeType::RemoveNode => {
                if cc.node_id == self.options.id {
                    log::warn!("this node has been removed from the cluster");
                }
                self.peers.write().remove(&cc.node_id);
            }
        }
        Ok(())
    }

    /// Persist raft state to storage
    /// Saves the current Raft state to persistent storage
    fn persist_raft_state(
        raft_group: &mut RawNode<RaftStorage>,
        ready: &Ready,
    ) -> Result<(), NodeError> {
        let store = &mut raft_group.raft.raft_log.store;

        // Persist entries
        store.append_entries(ready.entries())?;

        // Persist hard state
        if let Some(hs) = ready.hs() {
            store.set_hardstate(hs.clone());
        }
        Ok(())
    }

    /// Captures the state machine once enough entries were applied since the
    /// last snapshot, then compacts the in-memory log.
    fn maybe_trigger_snapshot(&mut self) -> Result<(), NodeError> {
        let applied = self.raft_group.raft.raft_log.applied();
        if applied <= self.snapshot_index + self.options.snapshot_count {
            return Ok(());
        }

        log::info!(
            "start snapshot [applied index: {} | last snapshot index: {}]",
            applied,
            self.snapshot_index
        );
        let data = self.state_machine.snapshot()?;
        let store = &mut self.raft_group.raft.raft_log.store;
        store.save_snapshot(data, applied, self.conf_state.clone())?;

        if applied > self.options.snapshot_catch_up_entries {
            let compact_index = applied - self.options.snapshot_catch_up_entries;
            store.compact(compact_index)?;
            log::info!("compacted log at index {}", compact_index);
        }
        self.snapshot_index = applied;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, Operation, SnapshotBridge, SnapshotStore, StateTable};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Cluster {
        store: KvStore,
        conf_changes: mpsc::Sender<ConfChange>,
        peers: PeerBook,
        node: JoinHandle<()>,
        apply: JoinHandle<Result<(), StoreError>>,
        _in_mailbox: mpsc::Sender<Message>,
        _out_mailbox: mpsc::Receiver<Message>,
    }

    async fn single_node(dir: &TempDir, snapshot_count: u64) -> Cluster {
        let snapshots = Arc::new(FileSnapshotStore::new(dir.path()).unwrap());
        let table = Arc::new(StateTable::new());
        let (in_mailbox, my_mailbox) = mpsc::channel(64);
        let (out_tx, out_mailbox) = mpsc::channel(64);
        let (propose_tx, propose_rx) = mpsc::channel(64);
        let (conf_tx, conf_rx) = mpsc::channel(8);
        let (commit_tx, commit_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(1);
        let peers: PeerBook = Arc::new(RwLock::new(HashMap::new()));

        let logger = slog::Logger::root(slog::Discard, o!());
        let node = Node::start_raft(
            NodeOptions {
                id: 1,
                voters: vec![1],
                join: false,
                snapshot_count,
                snapshot_catch_up_entries: 2,
            },
            NodeChannels {
                my_mailbox,
                out_mailbox: out_tx,
                proposals: propose_rx,
                conf_changes: conf_rx,
                commits: commit_tx,
                errors: error_tx,
            },
            SnapshotBridge::new(table.clone()),
            snapshots.clone(),
            peers.clone(),
            &logger,
        )
        .unwrap();

        let (store, apply) = KvStore::open(table, propose_tx, commit_rx, error_rx, snapshots)
            .await
            .unwrap();
        Cluster {
            store,
            conf_changes: conf_tx,
            peers,
            node,
            apply,
            _in_mailbox: in_mailbox,
            _out_mailbox: out_mailbox,
        }
    }

    /// Proposals made before the first election are dropped, so keep
    /// proposing until the value shows up.
    async fn put_until_visible(store: &KvStore, key: &str, value: &str) {
        for _ in 0..100 {
            store.propose(key, value, Operation::Set).await.unwrap();
            for _ in 0..10 {
                if store.lookup(key).as_deref() == Some(value) {
                    return;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        }
        panic!("{} was never committed", key);
    }

    async fn wait_until<F: Fn() -> bool>(f: F) {
        for _ in 0..500 {
            if f() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn test_single_node_commit() {
        let dir = TempDir::new().unwrap();
        let cluster = single_node(&dir, 10000).await;

        put_until_visible(&cluster.store, "/a", "1").await;

        cluster
            .store
            .propose("/a", "", Operation::Delete)
            .await
            .unwrap();
        wait_until(|| cluster.store.lookup("/a").is_none()).await;

        let Cluster {
            store, node, apply, ..
        } = cluster;
        drop(store);
        node.await.unwrap();
        apply.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_triggered_and_recovered() {
        let dir = TempDir::new().unwrap();
        {
            let cluster = single_node(&dir, 3).await;
            put_until_visible(&cluster.store, "/warmup", "0").await;
            for i in 0..10 {
                cluster
                    .store
                    .propose(&format!("/k{}", i), &i.to_string(), Operation::Set)
                    .await
                    .unwrap();
            }
            wait_until(|| cluster.store.lookup("/k9").is_some()).await;

            let snapshots = FileSnapshotStore::new(dir.path()).unwrap();
            wait_until(|| snapshots.load().is_ok()).await;

            let Cluster {
                store, node, apply, ..
            } = cluster;
            drop(store);
            node.await.unwrap();
            apply.await.unwrap().unwrap();
        }

        // A restarted replica recovers what its snapshot covers.
        let snapshots = FileSnapshotStore::new(dir.path()).unwrap();
        let covered = crate::store::snapshot::restore(&snapshots.load().unwrap().payload).unwrap();
        assert!(covered.contains_key("/warmup"));

        let cluster = single_node(&dir, 3).await;
        for (key, value) in &covered {
            assert_eq!(cluster.store.lookup(key).as_ref(), Some(value));
        }
    }

    #[test]
    fn test_only_empty_normal_entries_skipped() {
        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryNormal);
        assert!(is_leader_noop(&entry));

        entry.data = b"x".to_vec().into();
        assert!(!is_leader_noop(&entry));

        let mut leave_joint = Entry::default();
        leave_joint.set_entry_type(EntryType::EntryConfChangeV2);
        assert!(!is_leader_noop(&leave_joint));

        let mut cc = Entry::default();
        cc.set_entry_type(EntryType::EntryConfChange);
        assert!(!is_leader_noop(&cc));
    }

    #[tokio::test]
    async fn test_conf_change_updates_peers() {
        let dir = TempDir::new().unwrap();
        let cluster = single_node(&dir, 10000).await;
        put_until_visible(&cluster.store, "/a", "1").await;

        let mut cc = ConfChange::default();
        cc.node_id = 2;
        cc.set_change_type(ConfChangeType::AddLearnerNode);
        cc.context = b"http://127.0.0.1:22379".to_vec().into();
        cluster.conf_changes.send(cc).await.unwrap();

        let peers = cluster.peers.clone();
        wait_until(|| peers.read().contains_key(&2)).await;
        assert_eq!(
            peers.read().get(&2).map(String::as_str),
            Some("http://127.0.0.1:22379")
        );
    }
}
