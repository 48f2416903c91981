//! Consensus collaborator
//!
//! Drives a raft-rs `RawNode` and talks to the key-value store only through
//! channels: proposals and configuration changes come in, committed entries,
//! snapshot sentinels and fatal errors go out.

use crate::store::StoreError;

pub mod node;
pub mod storage;

/// What the consensus layer needs from the state machine: a serialized copy
/// of its state to compact the log with.
pub trait StateMachine {
    fn snapshot(&self) -> Result<Vec<u8>, StoreError>;
}

impl StateMachine for crate::store::SnapshotBridge {
    fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        self.capture()
    }
}
