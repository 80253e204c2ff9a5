//! # fetch-cache
//!
//! A caching decorator for HTTP fetches. The first request for a resource goes
//! to the network and, if the configured strategy agrees, is written to a
//! pluggable store. Later requests for the same resource are answered from
//! the store. Concurrent requests for one resource share a single network call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fetch_cache::{FetchCache, cache::{CacheOkayOnly, FileSystemCache}};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = FetchCache::builder()
//!         .cache(Arc::new(FileSystemCache::new(".cache")))
//!         .should_cache_response(CacheOkayOnly)
//!         .build();
//!
//!     let mut response = cache.fetch("http://localhost:8080/json", None).await?;
//!     println!("from cache: {}", response.returned_from_cache());
//!     println!("{}", response.text().await?);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod fetch;
pub mod http;
pub mod response;
pub mod transport;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheStore, calculate_cache_key};
pub use error::{FetchCacheError, Result};
pub use fetch::{CacheOptions, FetchCache, FetchCacheBuilder};
pub use http::{Headers, Method, Request, RequestInit, Resource, StatusCode};
pub use response::{FetchResponse, ResponseMetadata};
