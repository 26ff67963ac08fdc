//! Per-`(tenant_id, job_key)` async locks
//!
//! An entry lives only while some handle for its key exists; the last
//! handle to drop removes it, including handles dropped while still waiting.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

type LockMap = DashMap<(String, String), Arc<Mutex<()>>>;

#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    locks: LockMap,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn handle(&self, tenant_id: &str, job_key: &str) -> KeyLockHandle<'_> {
        let key = (tenant_id.to_string(), job_key.to_string());
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyLockHandle {
            locks: &self.locks,
            key,
            lock,
        }
    }

    /// Keys with a run in progress or waiting
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

pub(crate) struct KeyLockHandle<'a> {
    locks: &'a LockMap,
    key: (String, String),
    lock: Arc<Mutex<()>>,
}

impl KeyLockHandle<'_> {
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for KeyLockHandle<'_> {
    fn drop(&mut self) {
        // The map and this handle hold the only references
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}
