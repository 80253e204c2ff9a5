//! Per-key exclusive locking.
//!
//! [`KeyedLock`] serialises async critical sections that share a key while
//! letting different keys run concurrently. Waiters suspend on a Tokio mutex
//! (no polling) and are admitted in FIFO order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

type Slot = Arc<tokio::sync::Mutex<()>>;

static SHARED: Lazy<Arc<KeyedLock>> = Lazy::new(|| Arc::new(KeyedLock::new()));

/// A registry of per-key async mutexes.
///
/// A key's slot exists only while at least one caller holds or awaits it.
///
/// # Examples
///
/// ```
/// use fetch_cache::cache::KeyedLock;
///
/// # let rt = tokio::runtime::Runtime::new().unwrap();
/// # rt.block_on(async {
/// let locks = KeyedLock::new();
/// let value = locks.run_exclusive("key", || async { 41 + 1 }).await;
/// assert_eq!(value, 42);
/// assert_eq!(locks.active_keys(), 0);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct KeyedLock {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide coordinator used when none is configured.
    pub fn shared() -> Arc<KeyedLock> {
        Arc::clone(&SHARED)
    }

    /// Runs `action` while holding the lock for `key`.
    ///
    /// The lock is released when `action`'s future completes, fails, panics or
    /// is dropped, so a failed critical section never wedges its key.
    pub async fn run_exclusive<F, Fut, T>(&self, key: &str, action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _ticket = self.acquire(key).await;
        action().await
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.slots().len()
    }

    async fn acquire(&self, key: &str) -> Ticket<'_> {
        let slot = {
            let mut slots = self.slots();
            Arc::clone(slots.entry(key.to_owned()).or_default())
        };

        let guard = match Arc::clone(&slot).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(key = %key, "waiting for exclusive lock");
                Arc::clone(&slot).lock_owned().await
            }
        };

        Ticket {
            owner: self,
            key: key.to_owned(),
            slot,
            guard: Some(guard),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    lock_kind = "mutex.lock",
                    result = "poisoned_recovered",
                    "Recovered from poisoned key lock registry"
                );
                poisoned.into_inner()
            }
        }
    }
}

/// Holds a key's mutex; dropping it releases the key and prunes the slot
/// when nobody else references it.
struct Ticket<'a> {
    owner: &'a KeyedLock,
    key: String,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.owner.slots();
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.slot) == 2
            && slots.get(&self.key).is_some_and(|s| Arc::ptr_eq(s, &self.slot))
        {
            slots.remove(&self.key);
        }
    }
}
