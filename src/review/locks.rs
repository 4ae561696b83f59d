//! Per-record async locks.
//!
//! Operations on the same record run one at a time; different records do
//! not contend. Entries are dropped from the map once nobody holds or waits
//! on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type LockMap = HashMap<Uuid, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct RecordLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: Uuid) -> RecordGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(id).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        RecordGuard {
            id,
            map: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of records with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held for the duration of one record operation.
pub struct RecordGuard {
    id: Uuid,
    map: Arc<Mutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        // Clones are only taken under the map lock, so a count of one means
        // no other task holds or is waiting on this entry.
        if map
            .get(&self.id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            map.remove(&self.id);
        }
    }
}
