//! The response model returned by every fetch.
//!
//! [`FetchResponse`] composes a body stream, the serialisable
//! [`ResponseMetadata`] and cache bookkeeping (where it came from, how to
//! evict it). The body can be read exactly once, whichever reader is used.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheStore, KeyedLock};
use crate::error::{FetchCacheError, Result};
use crate::http::{BodyStream, Headers, StatusCode, body};

/// Everything about a response except its body, in the form stores persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    /// Lowercase header name → values in arrival order.
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub redirected: bool,
    /// Number of redirects the transport followed.
    #[serde(default)]
    pub counter: u32,
}

impl ResponseMetadata {
    /// Metadata of the synthetic `504` returned for `only-if-cached` misses.
    pub fn gateway_timeout(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: StatusCode::GATEWAY_TIMEOUT.as_u16(),
            status_text: "Gateway Timeout".to_owned(),
            headers: BTreeMap::new(),
            redirected: false,
            counter: 0,
        }
    }
}

/// Removes one entry from a store, under the same per-key lock that guards
/// population so an eviction never interleaves with a write of that key.
#[derive(Clone)]
pub(crate) struct EjectHandle {
    pub(crate) key: String,
    pub(crate) store: Arc<dyn CacheStore>,
    pub(crate) locks: Arc<KeyedLock>,
}

impl EjectHandle {
    async fn eject(&self) -> Result<()> {
        debug!(key = %self.key, "ejecting entry from cache");
        self.locks
            .run_exclusive(&self.key, || self.store.remove(&self.key))
            .await
    }
}

/// A response from [`FetchCache::fetch`](crate::FetchCache::fetch).
///
/// # Examples
///
/// ```
/// use fetch_cache::FetchResponse;
///
/// # let rt = tokio::runtime::Runtime::new().unwrap();
/// # rt.block_on(async {
/// let mut miss = FetchResponse::cache_miss("http://localhost/");
/// assert_eq!(miss.status(), 504);
/// assert!(miss.is_cache_miss());
/// assert_eq!(miss.text().await.unwrap(), "");
/// assert!(miss.text().await.is_err());
/// # });
/// ```
pub struct FetchResponse {
    body: Option<BodyStream>,
    meta: ResponseMetadata,
    headers: Headers,
    eject: Option<EjectHandle>,
    returned_from_cache: bool,
    is_cache_miss: bool,
}

impl FetchResponse {
    pub(crate) fn new(
        body: BodyStream,
        meta: ResponseMetadata,
        eject: Option<EjectHandle>,
        returned_from_cache: bool,
    ) -> Self {
        let headers = Headers::from_multi_map(&meta.headers);
        Self {
            body: Some(body),
            meta,
            headers,
            eject,
            returned_from_cache,
            is_cache_miss: false,
        }
    }

    /// The synthetic response for an `only-if-cached` request that missed:
    /// status 504, empty body, nothing to eject.
    pub fn cache_miss(url: impl Into<String>) -> Self {
        let mut response = Self::new(
            body::empty(),
            ResponseMetadata::gateway_timeout(url),
            None,
            false,
        );
        response.is_cache_miss = true;
        response
    }

    pub fn status(&self) -> u16 {
        self.meta.status
    }

    pub fn status_text(&self) -> &str {
        &self.meta.status_text
    }

    /// `true` for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.meta.status)
    }

    pub fn url(&self) -> &str {
        &self.meta.url
    }

    pub fn redirected(&self) -> bool {
        self.meta.redirected
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn metadata(&self) -> &ResponseMetadata {
        &self.meta
    }

    /// `true` if this response was served from the store.
    pub fn returned_from_cache(&self) -> bool {
        self.returned_from_cache
    }

    /// `true` only for the synthetic `only-if-cached` miss.
    pub fn is_cache_miss(&self) -> bool {
        self.is_cache_miss
    }

    /// `true` once any body reader has been called.
    pub fn body_used(&self) -> bool {
        self.body.is_none()
    }

    /// Takes the raw body stream.
    ///
    /// # Errors
    ///
    /// [`FetchCacheError::BodyUsed`] if the body was already taken or read.
    pub fn body_stream(&mut self) -> Result<BodyStream> {
        self.body.take().ok_or_else(|| FetchCacheError::BodyUsed {
            url: self.meta.url.clone(),
        })
    }

    pub async fn bytes(&mut self) -> Result<Bytes> {
        let stream = self.body_stream()?;
        Ok(body::collect(stream).await?)
    }

    /// Reads the body as UTF-8, replacing invalid sequences.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Removes the entry this response belongs to from its store.
    ///
    /// Idempotent; a no-op for synthetic cache misses.
    pub async fn eject_from_cache(&self) -> Result<()> {
        match &self.eject {
            Some(handle) => handle.eject().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("meta", &self.meta)
            .field("body_used", &self.body_used())
            .field("returned_from_cache", &self.returned_from_cache)
            .field("is_cache_miss", &self.is_cache_miss)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn meta() -> ResponseMetadata {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_owned(), vec!["application/json".to_owned()]);
        headers.insert("set-cookie".to_owned(), vec!["a=1".to_owned(), "b=2".to_owned()]);
        ResponseMetadata {
            url: "http://localhost/json".to_owned(),
            status: 200,
            status_text: "OK".to_owned(),
            headers,
            redirected: false,
            counter: 0,
        }
    }

    #[tokio::test]
    async fn second_read_fails_with_url() {
        let mut response = FetchResponse::new(body::once("{\"a\":1}"), meta(), None, false);
        let value: serde_json::Value = response.json().await.unwrap();
        assert_eq!(value["a"], 1);
        assert!(response.body_used());

        let err = response.bytes().await.unwrap_err();
        assert!(matches!(err, FetchCacheError::BodyUsed { .. }));
        assert_eq!(err.to_string(), "body used already for: http://localhost/json");
        assert!(response.body_stream().is_err());
    }

    #[test]
    fn accessors_come_from_metadata() {
        let response = FetchResponse::new(body::empty(), meta(), None, true);
        assert!(response.ok());
        assert_eq!(response.status_text(), "OK");
        assert!(response.returned_from_cache());
        assert!(!response.is_cache_miss());
        assert_eq!(response.headers().get("Content-Type"), Some("application/json"));
        assert_eq!(response.headers().get_joined("set-cookie").as_deref(), Some("a=1, b=2"));
        assert!(!response.headers().contains("zzzz"));
    }

    #[tokio::test]
    async fn eject_is_idempotent() {
        let store = Arc::new(MemoryCache::new());
        store.set("k", body::once("x"), meta()).await.unwrap();

        let handle = EjectHandle {
            key: "k".to_owned(),
            store: store.clone(),
            locks: Arc::new(KeyedLock::new()),
        };
        let response = FetchResponse::new(body::empty(), meta(), Some(handle), true);
        response.eject_from_cache().await.unwrap();
        response.eject_from_cache().await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[test]
    fn metadata_serialises_camel_case() {
        let json = serde_json::to_value(meta()).unwrap();
        assert_eq!(json["statusText"], "OK");
        let back: ResponseMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta());
    }
}
