use crate::credentials::ScopeKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-(user, scope) refresh serialization within one process.
///
/// Only one task at a time may run the refresh protocol for a given key;
/// others wait and then re-read the record the winner committed. An entry
/// exists only while some task holds or waits for its lock.
#[derive(Default)]
pub struct RefreshLocks {
    locks: DashMap<ScopeKey, Arc<Mutex<()>>>,
}

/// Exclusive refresh rights on one key. Dropping it releases the lock and
/// prunes the entry when nobody else is waiting.
pub struct RefreshGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: ScopeKey,
    locks: &'a DashMap<ScopeKey, Arc<Mutex<()>>>,
}

impl RefreshLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive refresh rights on `key`.
    pub async fn acquire(&self, key: &ScopeKey) -> RefreshGuard<'_> {
        // Clone the Arc out so the DashMap shard lock is released before awaiting
        let lock = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let guard = lock.lock_owned().await;

        RefreshGuard {
            guard: Some(guard),
            key: key.clone(),
            locks: &self.locks,
        }
    }

    /// Number of keys currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        // Release first: the owned guard holds a reference to the mutex
        self.guard.take();

        // Waiters hold their own clone, so a count of one means only the map
        // refers to it. The shard lock keeps this atomic with `acquire`.
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
