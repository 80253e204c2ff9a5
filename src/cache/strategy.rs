//! Deciding whether a fresh network response is stored.
//!
//! A [`CacheStrategy`] sees the response through a [`ResponseProbe`]. The
//! probe exposes the usual accessors and lets a strategy read the body; a body
//! read there is buffered and handed on to storage and the caller, so the
//! caller still gets the full body exactly once.

use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::http::{BodyStream, Headers, body};
use crate::response::ResponseMetadata;

enum ProbeBody {
    Live(BodyStream),
    Buffered(Bytes),
    Failed { kind: io::ErrorKind, message: String },
}

/// A live response as seen by a [`CacheStrategy`].
pub struct ResponseProbe {
    meta: ResponseMetadata,
    headers: Headers,
    body: ProbeBody,
}

impl ResponseProbe {
    pub fn new(meta: ResponseMetadata, body: BodyStream) -> Self {
        let headers = Headers::from_multi_map(&meta.headers);
        Self {
            meta,
            headers,
            body: ProbeBody::Live(body),
        }
    }

    pub fn status(&self) -> u16 {
        self.meta.status
    }

    pub fn status_text(&self) -> &str {
        &self.meta.status_text
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.meta.status)
    }

    pub fn url(&self) -> &str {
        &self.meta.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn metadata(&self) -> &ResponseMetadata {
        &self.meta
    }

    /// `true` once the body has been pulled into memory by a reader.
    pub fn body_read(&self) -> bool {
        !matches!(self.body, ProbeBody::Live(_))
    }

    /// Reads the whole body. Repeated calls return the same bytes.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        if let ProbeBody::Live(stream) = &mut self.body {
            let stream = std::mem::replace(stream, body::empty());
            self.body = match body::collect(stream).await {
                Ok(bytes) => ProbeBody::Buffered(bytes),
                Err(e) => ProbeBody::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                },
            };
        }

        match &self.body {
            ProbeBody::Live(_) => Ok(Bytes::new()),
            ProbeBody::Buffered(bytes) => Ok(bytes.clone()),
            ProbeBody::Failed { kind, message } => {
                Err(io::Error::new(*kind, message.clone()).into())
            }
        }
    }

    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Splits the probe back into metadata and a body stream: the original
    /// stream if nothing read it, otherwise a fresh stream over the buffer.
    pub fn into_parts(self) -> (ResponseMetadata, BodyStream) {
        let stream = match self.body {
            ProbeBody::Live(stream) => stream,
            ProbeBody::Buffered(bytes) => body::once(bytes),
            ProbeBody::Failed { kind, message } => Box::pin(futures::stream::once(async move {
                Err::<Bytes, _>(io::Error::new(kind, message))
            })),
        };
        (self.meta, stream)
    }
}

impl fmt::Debug for ResponseProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseProbe")
            .field("meta", &self.meta)
            .field("body_read", &self.body_read())
            .finish()
    }
}

/// Decides whether a network response goes into the store.
#[async_trait]
pub trait CacheStrategy: Send + Sync {
    async fn should_cache(&self, response: &mut ResponseProbe) -> bool;
}

/// Stores every response. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheAll;

#[async_trait]
impl CacheStrategy for CacheAll {
    async fn should_cache(&self, _response: &mut ResponseProbe) -> bool {
        true
    }
}

/// Stores only 2xx responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOkayOnly;

#[async_trait]
impl CacheStrategy for CacheOkayOnly {
    async fn should_cache(&self, response: &mut ResponseProbe) -> bool {
        response.ok()
    }
}

/// Stores everything below 500.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheNon5xxOnly;

#[async_trait]
impl CacheStrategy for CacheNon5xxOnly {
    async fn should_cache(&self, response: &mut ResponseProbe) -> bool {
        response.status() < 500
    }
}

/// A strategy built from a synchronous predicate. See [`strategy_fn`].
#[derive(Clone, Copy)]
pub struct FnStrategy<F>(F);

impl<F> fmt::Debug for FnStrategy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnStrategy")
    }
}

#[async_trait]
impl<F> CacheStrategy for FnStrategy<F>
where
    F: Fn(&ResponseProbe) -> bool + Send + Sync,
{
    async fn should_cache(&self, response: &mut ResponseProbe) -> bool {
        (self.0)(response)
    }
}

/// Lifts a status/header predicate into a [`CacheStrategy`].
///
/// ```
/// use fetch_cache::cache::strategy_fn;
///
/// let skip_no_store = strategy_fn(|res| {
///     res.headers()
///         .get("cache-control")
///         .is_none_or(|v| !v.contains("no-store"))
/// });
/// # let _ = skip_no_store;
/// ```
pub fn strategy_fn<F>(predicate: F) -> FnStrategy<F>
where
    F: Fn(&ResponseProbe) -> bool + Send + Sync,
{
    FnStrategy(predicate)
}
