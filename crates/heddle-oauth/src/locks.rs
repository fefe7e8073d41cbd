//! Keyed single-flight locks and the distributed-lock capability.

use dashmap::DashMap;
use smol_str::SmolStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Opaque guard returned by [`RequestLock::acquire`]; dropping it releases
/// the lock.
pub struct LockGuard(#[allow(dead_code)] Box<dyn std::any::Any + Send>);

impl LockGuard {
    pub fn new(guard: impl std::any::Any + Send) -> Self {
        Self(Box::new(guard))
    }
}

/// Capability for serializing work on a string key.
///
/// The contract: while one holder's guard is alive, `acquire` for the same
/// key does not return. The default is the in-memory [`KeyedLocks`]; a
/// distributed implementation (e.g. Redis-backed) gives the same guarantee
/// across processes.
#[async_trait::async_trait]
pub trait RequestLock: Send + Sync {
    async fn acquire(&self, key: &str) -> LockGuard;
}

/// In-memory per-key mutual exclusion.
///
/// Entries live only while some task holds or awaits the key's lock; the
/// last holder out removes the entry.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Arc<DashMap<SmolStr, Arc<Mutex<()>>>>,
}

/// RAII guard for one key; cleans up the map entry when the last interested
/// task releases.
pub struct KeyedGuard {
    map: Arc<DashMap<SmolStr, Arc<Mutex<()>>>>,
    key: SmolStr,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // release first, then drop the entry if nobody else holds a handle
        // (the map's shard lock makes the count check race-free)
        self.guard.take();
        self.map
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until this task is the sole holder for `key`.
    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let mutex = self
            .inner
            .entry(SmolStr::new(key))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            map: self.inner.clone(),
            key: SmolStr::new(key),
            guard: Some(guard),
        }
    }

    /// Number of live entries; in-flight tasks only.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait::async_trait]
impl RequestLock for KeyedLocks {
    async fn acquire(&self, key: &str) -> LockGuard {
        LockGuard::new(KeyedLocks::acquire(self, key).await)
    }
}
