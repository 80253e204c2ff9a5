//! The network side of a fetch.
//!
//! [`FetchCache`](crate::FetchCache) never opens sockets itself; on a miss it
//! hands the merged [`Request`] to a [`Transport`]. [`HttpTransport`] is the
//! default. Tests and embedders substitute their own.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::http::{BodyStream, Headers, Request};
use crate::response::ResponseMetadata;

pub mod http;

pub use http::HttpTransport;

/// Sends a request and returns the origin's response with an unread body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<TransportResponse>;
}

/// A response as it came off the wire.
pub struct TransportResponse {
    /// Final URL after any redirects.
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub redirected: bool,
    /// Redirects followed to reach `url`.
    pub counter: u32,
    pub body: BodyStream,
}

impl TransportResponse {
    /// Splits into the persistable metadata and the body.
    pub fn into_parts(self) -> (ResponseMetadata, BodyStream) {
        let meta = ResponseMetadata {
            url: self.url,
            status: self.status,
            status_text: self.status_text,
            headers: self.headers.to_multi_map(),
            redirected: self.redirected,
            counter: self.counter,
        };
        (meta, self.body)
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Request extension bounding how long [`HttpTransport`] spends on one
/// exchange, from connecting until the body has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeout(pub Duration);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::body;

    #[tokio::test]
    async fn into_parts_groups_repeated_headers() {
        let mut headers = Headers::new();
        headers.insert("Set-Cookie", "a=1");
        headers.insert("set-cookie", "b=2");
        headers.insert("Content-Type", "text/plain");

        let response = TransportResponse {
            url: "http://localhost/".to_owned(),
            status: 201,
            status_text: "Created".to_owned(),
            headers,
            redirected: true,
            counter: 2,
            body: body::once("hi"),
        };
        let (meta, stream) = response.into_parts();
        assert_eq!(meta.headers["set-cookie"], vec!["a=1", "b=2"]);
        assert_eq!(meta.headers["content-type"], vec!["text/plain"]);
        assert_eq!(meta.counter, 2);
        assert_eq!(body::collect(stream).await.unwrap(), "hi");
    }
}
