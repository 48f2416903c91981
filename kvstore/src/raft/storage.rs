use protobuf::Message;
use raft::eraftpb::Entry;
use raft::eraftpb::HardState;
use raft::eraftpb::Snapshot;
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage};
use raft_proto::eraftpb::ConfState;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::store::{Position, SnapshotError, SnapshotStore};

const SNAPSHOT_FILE: &str = "snapshot";
const SNAPSHOT_TEMP_FILE: &str = "snapshot.tmp";

fn store_error<E>(e: E) -> raft::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    raft::Error::Store(raft::StorageError::Other(Box::new(e)))
}

/// Builds a raft snapshot carrying a state machine payload.
pub fn raft_snapshot(position: Position, conf_state: ConfState, data: Vec<u8>) -> Snapshot {
    let mut snapshot = Snapshot::default();
    snapshot.data = data.into();
    let metadata = snapshot.mut_metadata();
    metadata.index = position.index;
    metadata.term = position.term;
    metadata.set_conf_state(conf_state);
    snapshot
}

/// Keeps the latest snapshot in a single file under `base_path`.
///
/// A new snapshot is written to a temporary file first and renamed over the
/// old one, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct FileSnapshotStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSnapshotStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> std::io::Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(FileSnapshotStore {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn load_raft(&self) -> std::result::Result<Snapshot, SnapshotError> {
        let data = match fs::read(self.base_path.join(SNAPSHOT_FILE)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let mut snapshot = Snapshot::default();
        snapshot
            .merge_from_bytes(&data)
            .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
        Ok(snapshot)
    }

    pub fn save_raft(&self, snapshot: &Snapshot) -> std::result::Result<(), SnapshotError> {
        let _guard = self.write_lock.lock();
        let snapshot_path = self.base_path.join(SNAPSHOT_FILE);
        let temp_path = self.base_path.join(SNAPSHOT_TEMP_FILE);

        let snapshot_data = snapshot
            .write_to_bytes()
            .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
        fs::write(&temp_path, &snapshot_data)?;
        fs::rename(&temp_path, &snapshot_path)?;
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> std::result::Result<crate::store::Snapshot, SnapshotError> {
        let snapshot = self.load_raft()?;
        let metadata = snapshot.get_metadata();
        Ok(crate::store::Snapshot {
            position: Position {
                term: metadata.term,
                index: metadata.index,
            },
            payload: snapshot.get_data().to_vec(),
        })
    }

    /// Keeps the membership recorded by the previous snapshot, if any.
    fn save(&self, snapshot: &crate::store::Snapshot) -> std::result::Result<(), SnapshotError> {
        let conf_state = match self.load_raft() {
            Ok(previous) => previous.get_metadata().get_conf_state().clone(),
            Err(SnapshotError::NotFound) => ConfState::default(),
            Err(e) => return Err(e),
        };
        self.save_raft(&raft_snapshot(
            snapshot.position,
            conf_state,
            snapshot.payload.clone(),
        ))
    }
}

/// Raft log storage: entries and hard state live in memory, snapshots are
/// persisted through [`FileSnapshotStore`] and served to lagging followers.
pub struct RaftStorage {
    mem_storage: MemStorage,
    snapshots: Arc<FileSnapshotStore>,
}

impl RaftStorage {
    /// Starts from the persisted snapshot if there is one. Otherwise a fresh
    /// cluster is bootstrapped with `voters`, unless the node is joining an
    /// existing cluster and waits to be caught up by the leader.
    pub fn open(snapshots: Arc<FileSnapshotStore>, voters: Vec<u64>, join: bool) -> Result<Self> {
        let mem_storage = match snapshots.load_raft() {
            Ok(snapshot) => {
                let mem_storage = MemStorage::new();
                mem_storage.wl().apply_snapshot(snapshot)?;
                mem_storage
            }
            Err(SnapshotError::NotFound) if join => MemStorage::new(),
            Err(SnapshotError::NotFound) => {
                MemStorage::new_with_conf_state((voters, Vec::<u64>::new()))
            }
            Err(e) => return Err(store_error(e)),
        };

        Ok(RaftStorage {
            mem_storage,
            snapshots,
        })
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        self.mem_storage.wl().append(entries)
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.mem_storage.wl().set_conf_state(conf_state)
    }

    pub fn set_hardstate(&mut self, hs: HardState) {
        self.mem_storage.wl().set_hardstate(hs);
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.mem_storage.wl().mut_hard_state().set_commit(commit);
    }

    /// Installs a snapshot received from the leader.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots.save_raft(snapshot).map_err(store_error)?;
        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;
        Ok(())
    }

    /// Persists a snapshot of the state machine taken at `applied`.
    pub fn save_snapshot(
        &mut self,
        data: Vec<u8>,
        applied: u64,
        conf_state: ConfState,
    ) -> Result<()> {
        let position = Position {
            term: self.term(applied)?,
            index: applied,
        };
        let snapshot = raft_snapshot(position, conf_state, data);
        self.snapshots.save_raft(&snapshot).map_err(store_error)
    }

    /// Drops log entries before `compact_index`.
    pub fn compact(&mut self, compact_index: u64) -> Result<()> {
        self.mem_storage.wl().compact(compact_index)
    }
}

impl Storage for RaftStorage {
    /// Implements the Storage trait.
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    /// Implements the Storage trait.
    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    /// Implements the Storage trait.
    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    /// Implements the Storage trait.
    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    /// Implements the Storage trait.
    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    /// Serves the last persisted snapshot, which carries the state machine
    /// payload the in-memory storage does not have.
    fn snapshot(&self, request_index: u64, _to: u64) -> Result<Snapshot> {
        match self.snapshots.load_raft() {
            Ok(snapshot) if snapshot.get_metadata().index >= request_index => Ok(snapshot),
            Ok(_) | Err(SnapshotError::NotFound) => Err(raft::Error::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable,
            )),
            Err(e) => Err(store_error(e)),
        }
    }
}
