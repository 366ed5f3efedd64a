//! A refcounted table of per-key async locks.
//!
//! Bucket updates lock the keys and merkle leaves they touch, always in sorted order, so
//! that concurrent batches touching overlapping key sets serialize instead of deadlocking.
//! Locks are created on demand and dropped again once the last holder releases them, keeping
//! the table bounded by the number of in-flight operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct MultiLock {
    locks: Mutex<HashMap<Vec<u8>, LockSlot>>,
}

struct LockSlot {
    lock: Arc<AsyncMutex<()>>,
    holders: usize,
}

/// A held lock on one key; releasing happens on drop.
pub struct MultiLockGuard<'a> {
    owner: &'a MultiLock,
    key: Vec<u8>,
    _guard: OwnedMutexGuard<()>,
}

impl MultiLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the given key, waiting for any current holder to release it.
    ///
    /// Callers locking multiple keys must acquire them in sorted key order.
    pub async fn lock(&self, key: &[u8]) -> MultiLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let slot = locks.entry(key.to_vec()).or_insert_with(|| LockSlot {
                lock: Arc::new(AsyncMutex::new(())),
                holders: 0,
            });
            slot.holders += 1;
            slot.lock.clone()
        };
        let guard = lock.lock_owned().await;
        MultiLockGuard { owner: self, key: key.to_vec(), _guard: guard }
    }
}

impl Drop for MultiLockGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = locks.get_mut(&self.key) {
            slot.holders -= 1;
            if slot.holders == 0 {
                locks.remove(&self.key);
            }
        }
    }
}
