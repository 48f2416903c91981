use thiserror::Error;

/// Errors raised by the snapshot store collaborator.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// No snapshot has been saved yet. Expected on a first-ever start.
    #[error("no available snapshot")]
    NotFound,
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not decode message ({0})")]
    DecodeEntry(#[source] bincode::Error),
    #[error("could not encode proposal ({0})")]
    EncodeEntry(#[source] bincode::Error),
    #[error("could not decode snapshot payload ({0})")]
    DecodeSnapshot(#[source] serde_json::Error),
    #[error("could not encode snapshot payload ({0})")]
    EncodeSnapshot(#[source] serde_json::Error),
    #[error("snapshot store failed: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("propose sink closed")]
    ProposeClosed,
    #[error("consensus layer failed: {0}")]
    Upstream(anyhow::Error),
}
