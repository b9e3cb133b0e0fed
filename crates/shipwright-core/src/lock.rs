//! Per-key exclusion for deployments.
//!
//! Acquisition never blocks: a key that is already held is refused and the
//! caller tells the user to wait. Nothing is queued.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::debug;

#[derive(Debug, Default)]
pub struct DeployLocks {
    held: Mutex<HashSet<String>>,
}

impl DeployLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked mid-insert.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `key` as held. Returns false, leaving state untouched, if
    /// someone already holds it.
    pub fn try_acquire(&self, key: &str) -> bool {
        let acquired = self.held().insert(key.to_string());
        debug!(key, acquired, "deploy lock acquire");
        acquired
    }

    /// Drop `key` unconditionally.
    pub fn release(&self, key: &str) {
        self.held().remove(key);
        debug!(key, "deploy lock released");
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held().contains(key)
    }

    /// Scoped form of [`try_acquire`](Self::try_acquire): the key is released
    /// when the guard drops, on every exit path.
    pub fn try_lock(self: &Arc<Self>, key: &str) -> Option<DeployGuard> {
        self.try_acquire(key).then(|| DeployGuard {
            locks: Arc::clone(self),
            key: key.to_string(),
        })
    }
}

#[must_use = "the key is released as soon as the guard is dropped"]
pub struct DeployGuard {
    locks: Arc<DeployLocks>,
    key: String,
}

impl DeployGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DeployGuard {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}
