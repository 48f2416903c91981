//! The in-memory key-value mapping shared between the apply loop and readers.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Committed key-value pairs.
///
/// Reads take the shared lock. Every mutation, whole-table replacement and
/// snapshot capture takes the exclusive lock, so a reader sees either the
/// state before or after an applied entry, never anything in between.
#[derive(Debug, Default)]
pub struct StateTable {
    kv: RwLock<HashMap<String, String>>,
}

impl StateTable {
    pub fn new() -> Self {
        StateTable {
            kv: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.kv.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.kv.read().len()
    }

    pub(crate) fn set(&self, key: String, value: String) {
        self.kv.write().insert(key, value);
    }

    /// Removing an absent key is a no-op.
    pub(crate) fn delete(&self, key: &str) {
        self.kv.write().remove(key);
    }

    pub(crate) fn replace(&self, table: HashMap<String, String>) {
        *self.kv.write() = table;
    }

    /// Runs `f` over the whole mapping while holding the exclusive lock.
    pub(crate) fn exclusive<R>(&self, f: impl FnOnce(&HashMap<String, String>) -> R) -> R {
        let guard = self.kv.write();
        f(&guard)
    }
}
