//! The cache orchestrator.
//!
//! [`FetchCache::fetch`] answers from the store when it can and otherwise
//! performs at most one network call per key at a time:
//!
//! 1. validate the resource URL and compute its key
//! 2. return a stored entry if there is one (no lock taken)
//! 3. answer `only-if-cached` misses with a synthetic 504
//! 4. under the key's lock: re-check the store, fetch, ask the strategy,
//!    store if told to
//!
//! Errors anywhere in step 4 release the lock and leave the store untouched.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::cache::key::has_only_if_cached;
use crate::cache::{
    CacheAll, CacheStore, CacheStrategy, KeyedLock, MemoryCache, ResponseProbe,
    calculate_cache_key,
};
use crate::error::{FetchCacheError, Result};
use crate::http::{Request, RequestInit, Resource};
use crate::response::{EjectHandle, FetchResponse};
use crate::transport::{HttpTransport, Transport};

/// A cache key derivation function.
pub type KeyFn = Arc<dyn Fn(&Resource, &RequestInit) -> Result<String> + Send + Sync>;

/// Per-call overrides. Any field left `None` falls back to the instance's
/// setting for that call.
#[derive(Clone, Default)]
pub struct CacheOptions {
    pub cache: Option<Arc<dyn CacheStore>>,
    pub calculate_cache_key: Option<KeyFn>,
    pub should_cache_response: Option<Arc<dyn CacheStrategy>>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn calculate_cache_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &RequestInit) -> Result<String> + Send + Sync + 'static,
    {
        self.calculate_cache_key = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn should_cache_response(mut self, strategy: impl CacheStrategy + 'static) -> Self {
        self.should_cache_response = Some(Arc::new(strategy));
        self
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("cache", &self.cache.is_some())
            .field("calculate_cache_key", &self.calculate_cache_key.is_some())
            .field("should_cache_response", &self.should_cache_response.is_some())
            .finish()
    }
}

/// A caching wrapper around a [`Transport`].
///
/// Cloning is cheap; clones share the store, lock registry and transport.
///
/// # Examples
///
/// ```rust,no_run
/// use fetch_cache::FetchCache;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let cache = FetchCache::new();
///
///     let mut first = cache.fetch("http://localhost:8080/status/200", None).await?;
///     assert!(!first.returned_from_cache());
///     println!("{}", first.text().await?);
///
///     let second = cache.fetch("http://localhost:8080/status/200", None).await?;
///     assert!(second.returned_from_cache());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct FetchCache {
    cache: Arc<dyn CacheStore>,
    calculate_cache_key: KeyFn,
    should_cache_response: Arc<dyn CacheStrategy>,
    transport: Arc<dyn Transport>,
    locks: Arc<KeyedLock>,
}

impl FetchCache {
    /// A cache over [`MemoryCache::shared`], [`HttpTransport`] and
    /// [`KeyedLock::shared`], storing every response.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> FetchCacheBuilder {
        FetchCacheBuilder::default()
    }

    /// The store used when no per-call override is given.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub async fn fetch(
        &self,
        resource: impl Into<Resource>,
        init: Option<RequestInit>,
    ) -> Result<FetchResponse> {
        self.fetch_with(resource, init, CacheOptions::default()).await
    }

    /// Like [`fetch`](Self::fetch), with `options` overriding this instance's
    /// settings for this call only.
    ///
    /// # Errors
    ///
    /// - [`FetchCacheError::InvalidResource`] if the URL does not parse.
    /// - [`FetchCacheError::UnsupportedBodyType`] from the default key function.
    /// - Storage and transport errors, unchanged.
    pub async fn fetch_with(
        &self,
        resource: impl Into<Resource>,
        init: Option<RequestInit>,
        options: CacheOptions,
    ) -> Result<FetchResponse> {
        let resource = resource.into();
        let init = init.unwrap_or_default();
        validate(&resource)?;

        let cache = options.cache.unwrap_or_else(|| Arc::clone(&self.cache));
        let key_fn = options
            .calculate_cache_key
            .unwrap_or_else(|| Arc::clone(&self.calculate_cache_key));
        let strategy = options
            .should_cache_response
            .unwrap_or_else(|| Arc::clone(&self.should_cache_response));

        let key = key_fn(&resource, &init)?;
        let url = resource.url().to_owned();
        let eject = EjectHandle {
            key: key.clone(),
            store: Arc::clone(&cache),
            locks: Arc::clone(&self.locks),
        };

        if let Some(entry) = cache.get(&key).await? {
            debug!(key = %key, url = %url, "cache hit");
            return Ok(FetchResponse::new(entry.body, entry.meta, Some(eject), true));
        }

        let only_if_cached = has_only_if_cached(&init.headers)
            || resource.headers().is_some_and(has_only_if_cached);
        if only_if_cached {
            debug!(key = %key, url = %url, "only-if-cached miss");
            return Ok(FetchResponse::cache_miss(url));
        }

        debug!(key = %key, url = %url, "cache miss");
        let request = resource.into_request(init);
        self.locks
            .run_exclusive(&key, || {
                self.populate(&key, request, cache.as_ref(), strategy.as_ref(), eject)
            })
            .await
    }

    /// The critical section: runs with the key's lock held.
    async fn populate(
        &self,
        key: &str,
        request: Request,
        cache: &dyn CacheStore,
        strategy: &dyn CacheStrategy,
        eject: EjectHandle,
    ) -> Result<FetchResponse> {
        if let Some(entry) = cache.get(key).await? {
            debug!(key = %key, "entry stored while waiting for lock");
            return Ok(FetchResponse::new(entry.body, entry.meta, Some(eject), true));
        }

        let response = self.transport.fetch(request).await?;
        let (meta, body) = response.into_parts();
        debug!(key = %key, status = meta.status, "network response received");

        let mut probe = ResponseProbe::new(meta, body);
        let store = strategy.should_cache(&mut probe).await;
        let (meta, body) = probe.into_parts();

        if store {
            let stored = cache.set(key, body, meta).await?;
            Ok(FetchResponse::new(stored.body, stored.meta, Some(eject), false))
        } else {
            debug!(key = %key, status = meta.status, "strategy declined to cache response");
            Ok(FetchResponse::new(body, meta, Some(eject), false))
        }
    }
}

impl Default for FetchCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FetchCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCache")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

fn validate(resource: &Resource) -> Result<()> {
    Url::parse(resource.url())
        .map(|_| ())
        .map_err(|e| FetchCacheError::InvalidResource {
            resource: resource.url().to_owned(),
            reason: e.to_string(),
        })
}

/// Builder for [`FetchCache`]. Unset fields take the defaults listed on
/// [`FetchCache::new`].
#[derive(Default)]
pub struct FetchCacheBuilder {
    cache: Option<Arc<dyn CacheStore>>,
    calculate_cache_key: Option<KeyFn>,
    should_cache_response: Option<Arc<dyn CacheStrategy>>,
    transport: Option<Arc<dyn Transport>>,
    locks: Option<Arc<KeyedLock>>,
}

impl FetchCacheBuilder {
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn calculate_cache_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &RequestInit) -> Result<String> + Send + Sync + 'static,
    {
        self.calculate_cache_key = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn should_cache_response(mut self, strategy: impl CacheStrategy + 'static) -> Self {
        self.should_cache_response = Some(Arc::new(strategy));
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Lock registry to coordinate with. Instances sharing a store should
    /// share this too, or they may fetch the same key concurrently.
    #[must_use]
    pub fn locks(mut self, locks: Arc<KeyedLock>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn build(self) -> FetchCache {
        FetchCache {
            cache: self
                .cache
                .unwrap_or_else(|| MemoryCache::shared() as Arc<dyn CacheStore>),
            calculate_cache_key: self
                .calculate_cache_key
                .unwrap_or_else(|| Arc::new(calculate_cache_key) as KeyFn),
            should_cache_response: self
                .should_cache_response
                .unwrap_or_else(|| Arc::new(CacheAll) as Arc<dyn CacheStrategy>),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(HttpTransport::new()) as Arc<dyn Transport>),
            locks: self.locks.unwrap_or_else(KeyedLock::shared),
        }
    }
}

impl fmt::Debug for FetchCacheBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCacheBuilder").finish_non_exhaustive()
    }
}
