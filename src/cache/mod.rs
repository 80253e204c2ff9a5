//! Caching layer: key derivation, storage backends and per-key locking.
//!
//! ## Backends
//!
//! - [`MemoryCache`]: process-local map; the default, shared process-wide.
//! - [`FileSystemCache`]: content-addressed bodies plus a metadata index on disk.
//!
//! Any type implementing [`CacheStore`] can be plugged into a
//! [`FetchCache`](crate::FetchCache).

use async_trait::async_trait;

use crate::error::Result;
use crate::http::BodyStream;
use crate::response::ResponseMetadata;

pub mod fs;
pub mod key;
pub mod lock;
pub mod memory;
pub mod strategy;

pub use fs::{FileSystemCache, FileSystemCacheConfig};
pub use key::{CACHE_VERSION, calculate_cache_key};
pub use lock::KeyedLock;
pub use memory::{MemoryCache, MemoryCacheConfig};
pub use strategy::{
    CacheAll, CacheNon5xxOnly, CacheOkayOnly, CacheStrategy, ResponseProbe, strategy_fn,
};

/// A stored response as handed back by a [`CacheStore`].
pub struct CachedEntry {
    pub body: BodyStream,
    pub meta: ResponseMetadata,
}

impl std::fmt::Debug for CachedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEntry")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Storage backend contract.
///
/// # Contract
///
/// - `get` returns `Ok(None)` for missing *and* expired entries; expiry is the
///   backend's job. Missing files or keys are never errors.
/// - `set` drains `body` completely before the entry becomes visible to `get`,
///   stamps the configured expiration, and returns a fresh view of what was
///   stored rather than the consumed input.
/// - `remove` is idempotent.
/// - Any other I/O failure is returned as an error, never swallowed.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>>;

    async fn set(&self, key: &str, body: BodyStream, meta: ResponseMetadata)
    -> Result<CachedEntry>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// Milliseconds since the Unix epoch, the unit stored expirations use.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Absolute expiration for an entry written now with `ttl`.
pub(crate) fn expiration_for(ttl: Option<std::time::Duration>) -> Option<u64> {
    ttl.map(|ttl| now_millis().saturating_add(ttl.as_millis() as u64))
}

/// `true` once `expiration` (epoch ms) is in the past. A TTL of zero expires
/// on the very next read.
pub(crate) fn is_expired(expiration: Option<u64>) -> bool {
    expiration.is_some_and(|at| at <= now_millis())
}

/// Serde adapter storing an optional TTL as whole milliseconds.
pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ttl: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(ttl) => serializer.serialize_some(&(ttl.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
