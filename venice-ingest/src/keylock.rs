//! Key-Level Lock Manager (§4.C): short-lived locks keyed by record key
//! bytes, used to serialize read-modify-write across overlapping mini-batches
//! and the A/A single-key path. Advisory — correctness depends on every
//! writer of a partition going through this manager (§4.C contract).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    refcount: usize,
}

/// A held set of key locks, sorted by key byte order at acquisition time.
/// Dropping this without calling [`KeyLockManager::release`] still releases
/// the underlying locks (the guards' `Drop` runs), but leaves the refcount
/// bookkeeping stale until the next `acquire_many` touches the same keys —
/// always prefer `release`.
pub struct MultiKeyGuard {
    keys: Vec<Bytes>,
    guards: Vec<OwnedMutexGuard<()>>,
}

/// A single held key lock, for the A/A single-key path (§4.C).
pub struct SingleKeyGuard {
    key: Bytes,
    guard: Option<OwnedMutexGuard<()>>,
}

#[derive(Debug, Default)]
pub struct KeyLockManager {
    table: SyncMutex<HashMap<Bytes, Entry>>,
}

impl KeyLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_for(&self, key: &Bytes) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock();
        let entry = table.entry(key.clone()).or_insert_with(|| Entry {
            lock: Arc::new(AsyncMutex::new(())),
            refcount: 0,
        });
        entry.refcount += 1;
        entry.lock.clone()
    }

    /// Decrements the key's refcount and drops its table entry once no
    /// holder or waiter remains. Returns `true` when the key just went cold,
    /// so callers can evict anything keyed on it from a side cache (§9).
    fn release_entry(&self, key: &Bytes) -> bool {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                table.remove(key);
                return true;
            }
        }
        false
    }

    /// Deduplicates `keys`, sorts them by byte order (so overlapping batches
    /// always acquire in the same order, avoiding deadlock), and acquires
    /// each lock in that order.
    pub async fn acquire_many(&self, keys: Vec<Bytes>) -> MultiKeyGuard {
        let mut unique: Vec<Bytes> = keys;
        unique.sort();
        unique.dedup();

        let mut guards = Vec::with_capacity(unique.len());
        for key in &unique {
            let lock = self.entry_for(key);
            guards.push(lock.lock_owned().await);
        }
        MultiKeyGuard {
            keys: unique,
            guards,
        }
    }

    /// Releases a [`MultiKeyGuard`] in reverse acquisition order, decrements
    /// refcounts, and deletes the table entry for any key whose refcount
    /// returns to zero. Returns the keys that went cold, i.e. no longer have
    /// a holder or waiter, for cache eviction (§9).
    pub fn release(&self, mut handle: MultiKeyGuard) -> Vec<Bytes> {
        while handle.guards.pop().is_some() {
            // dropping the guard releases the lock
        }
        handle
            .keys
            .iter()
            .rev()
            .filter(|key| self.release_entry(key))
            .cloned()
            .collect()
    }

    /// Single-key variant for the A/A path (§4.C).
    pub async fn acquire_one(&self, key: Bytes) -> SingleKeyGuard {
        let lock = self.entry_for(&key);
        let guard = lock.lock_owned().await;
        SingleKeyGuard {
            key,
            guard: Some(guard),
        }
    }

    /// Returns `true` if `handle`'s key went cold, i.e. no longer has a
    /// holder or waiter, for cache eviction (§9).
    pub fn release_one(&self, mut handle: SingleKeyGuard) -> bool {
        handle.guard.take();
        self.release_entry(&handle.key)
    }

    #[cfg(test)]
    fn live_entry_count(&self) -> usize {
        self.table.lock().len()
    }
}
