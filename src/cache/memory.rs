//! In-process storage backend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CacheStore, CachedEntry, expiration_for, is_expired};
use crate::error::Result;
use crate::http::{BodyStream, body};
use crate::response::ResponseMetadata;

static SHARED: Lazy<Arc<MemoryCache>> = Lazy::new(|| Arc::new(MemoryCache::new()));

/// Settings for [`MemoryCache`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryCacheConfig {
    /// Entries become invisible this long after being written. `None` keeps
    /// them until removed.
    #[serde(default, with = "super::opt_millis")]
    pub ttl: Option<Duration>,
}

struct StoredEntry {
    body: Bytes,
    meta: ResponseMetadata,
    expiration: Option<u64>,
}

/// A map from cache key to body bytes and metadata.
///
/// Expiry is checked lazily on read; [`purge_expired`](Self::purge_expired)
/// reclaims memory but correctness never depends on it.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use fetch_cache::cache::{MemoryCache, MemoryCacheConfig};
///
/// let cache = MemoryCache::with_config(MemoryCacheConfig {
///     ttl: Some(Duration::from_secs(60)),
/// });
/// assert!(cache.is_empty());
/// ```
#[derive(Default)]
pub struct MemoryCache {
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryCacheConfig) -> Self {
        Self {
            ttl: config.ttl,
            entries: RwLock::default(),
        }
    }

    /// The process-wide store used when a [`FetchCache`](crate::FetchCache)
    /// is built without one. Created on first use, lives until exit.
    pub fn shared() -> Arc<MemoryCache> {
        Arc::clone(&SHARED)
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !is_expired(entry.expiration));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "purged expired memory cache entries");
        }
        purged
    }

    fn lookup(&self, key: &str) -> Option<CachedEntry> {
        let entries = self.read();
        let entry = entries.get(key)?;
        if is_expired(entry.expiration) {
            return None;
        }
        Some(CachedEntry {
            body: body::once(entry.body.clone()),
            meta: entry.meta.clone(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, StoredEntry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    lock_kind = "rwlock.read",
                    result = "poisoned_recovered",
                    "Recovered from poisoned memory cache lock"
                );
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, StoredEntry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    lock_kind = "rwlock.write",
                    result = "poisoned_recovered",
                    "Recovered from poisoned memory cache lock"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
        Ok(self.lookup(key))
    }

    async fn set(
        &self,
        key: &str,
        body: BodyStream,
        meta: ResponseMetadata,
    ) -> Result<CachedEntry> {
        let body = body::collect(body).await?;
        let entry = StoredEntry {
            body: body.clone(),
            meta: meta.clone(),
            expiration: expiration_for(self.ttl),
        };
        self.write().insert(key.to_owned(), entry);
        debug!(key = %key, bytes = body.len(), "stored entry in memory cache");

        Ok(CachedEntry {
            body: body::once(body),
            meta,
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn meta() -> ResponseMetadata {
        ResponseMetadata {
            url: "http://localhost/".to_owned(),
            status: 200,
            status_text: "OK".to_owned(),
            headers: BTreeMap::from([("x-a".to_owned(), vec!["1".to_owned()])]),
            redirected: false,
            counter: 0,
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = MemoryCache::new();
        let stored = cache.set("k", body::once("hello"), meta()).await.unwrap();
        assert_eq!(body::collect(stored.body).await.unwrap(), "hello");

        let hit = cache.get("k").await.unwrap().expect("entry");
        assert_eq!(hit.meta, meta());
        assert_eq!(body::collect(hit.body).await.unwrap(), "hello");

        // Each read gets an independent stream.
        let again = cache.get("k").await.unwrap().expect("entry");
        assert_eq!(body::collect(again.body).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn empty_body_is_still_an_entry() {
        let cache = MemoryCache::new();
        cache.set("k", body::empty(), meta()).await.unwrap();
        let hit = cache.get("k").await.unwrap().expect("entry");
        assert!(body::collect(hit.body).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ttl_hides_entries_after_expiry() {
        let cache = MemoryCache::with_config(MemoryCacheConfig {
            ttl: Some(Duration::from_millis(50)),
        });
        cache.set("k", body::once("x"), meta()).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn zero_ttl_still_returns_stored_view() {
        let cache = MemoryCache::with_config(MemoryCacheConfig {
            ttl: Some(Duration::ZERO),
        });
        let stored = cache.set("k", body::once("x"), meta()).await.unwrap();
        assert_eq!(body::collect(stored.body).await.unwrap(), "x");
    }

    #[tokio::test]
    async fn overwrite_resets_expiration() {
        let cache = MemoryCache::with_config(MemoryCacheConfig {
            ttl: Some(Duration::from_millis(60)),
        });
        cache.set("k", body::once("1"), meta()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.set("k", body::once("2"), meta()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let hit = cache.get("k").await.unwrap().expect("rewritten entry");
        assert_eq!(body::collect(hit.body).await.unwrap(), "2");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let cache = MemoryCache::new();
        cache.set("k", body::once("x"), meta()).await.unwrap();
        cache.remove("k").await.unwrap();
        cache.remove("k").await.unwrap();
        cache.remove("never-existed").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[test]
    fn config_reads_ttl_in_millis() {
        let config: MemoryCacheConfig = serde_json::from_str(r#"{"ttl": 1500}"#).unwrap();
        assert_eq!(config.ttl, Some(Duration::from_millis(1500)));
        let config: MemoryCacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.ttl, None);
    }
}
