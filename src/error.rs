//! Crate-wide error type.

use thiserror::Error;

/// Errors produced while computing keys, talking to storage, or fetching.
#[derive(Debug, Error)]
pub enum FetchCacheError {
    #[error("invalid resource {resource:?}: {reason}")]
    InvalidResource { resource: String, reason: String },

    #[error(
        "Unsupported body type: {found}. Supported body types are: text, url-encoded form, file, multipart form, bytes"
    )]
    UnsupportedBodyType { found: &'static str },

    #[error("body used already for: {url}")]
    BodyUsed { url: String },

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("corrupt cache entry for key {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FetchCacheError>;
