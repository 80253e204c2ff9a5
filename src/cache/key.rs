//! Cache key derivation.
//!
//! A key is the hex SHA-256 of a JSON rendering of the normalised request plus
//! [`CACHE_VERSION`]. Normalisation drops everything that does not change what
//! the origin would answer: multipart boundaries, header name case, the
//! `only-if-cached` directive and transport extensions.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{FetchCacheError, Result};
use crate::http::{Body, FormValue, Headers, Redirect, RequestInit, Resource};

/// Mixed into every key. Bump whenever the derivation below changes so that
/// entries written under the old rules can no longer be found.
pub const CACHE_VERSION: u32 = 7;

#[derive(Serialize)]
#[serde(untagged)]
enum BodyKey<'a> {
    Text(String),
    File(String),
    Multipart {
        #[serde(rename = "type")]
        kind: &'static str,
        entries: Vec<(&'a str, &'a FormValue)>,
    },
}

#[derive(Serialize)]
#[serde(untagged)]
enum ResourceKey<'a> {
    Url {
        url: &'a str,
    },
    Request {
        headers: Vec<(String, String)>,
        method: &'a str,
        redirect: Redirect,
        referrer: Option<&'a str>,
        url: &'a str,
        body: Option<BodyKey<'a>>,
    },
}

#[derive(Serialize)]
struct InitKey<'a> {
    method: Option<&'a str>,
    headers: Vec<(String, String)>,
    body: Option<BodyKey<'a>>,
    redirect: Option<Redirect>,
    referrer: Option<&'a str>,
}

/// Computes the cache key for a resource/init pair.
///
/// # Errors
///
/// [`FetchCacheError::UnsupportedBodyType`] when either body is a
/// [`Body::Stream`], which has no stable identity.
///
/// # Examples
///
/// ```
/// use fetch_cache::calculate_cache_key;
/// use fetch_cache::http::{RequestInit, Resource};
///
/// let plain = calculate_cache_key(&Resource::from("http://localhost/"), &RequestInit::new()).unwrap();
/// let only_if_cached = calculate_cache_key(
///     &Resource::from("http://localhost/"),
///     &RequestInit::new().header("Cache-Control", "only-if-cached"),
/// )
/// .unwrap();
/// assert_eq!(plain, only_if_cached);
/// assert_eq!(plain.len(), 64);
/// ```
pub fn calculate_cache_key(resource: &Resource, init: &RequestInit) -> Result<String> {
    let resource_key = match resource {
        Resource::Url(url) => ResourceKey::Url { url },
        Resource::Request(request) => ResourceKey::Request {
            headers: headers_key(request.headers()),
            method: request.get_method().as_str(),
            redirect: request.get_redirect(),
            referrer: request.get_referrer(),
            url: request.url(),
            body: request.get_body().map(body_key).transpose()?,
        },
    };

    let init_key = InitKey {
        method: init.method.as_ref().map(|m| m.as_str()),
        headers: headers_key(&init.headers),
        body: init.body.as_ref().map(body_key).transpose()?,
        redirect: init.redirect,
        referrer: init.referrer.as_deref(),
    };

    let json = serde_json::to_string(&(resource_key, init_key, CACHE_VERSION))?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn body_key(body: &Body) -> Result<BodyKey<'_>> {
    Ok(match body {
        Body::Text(text) => BodyKey::Text(text.clone()),
        Body::Form(pairs) => BodyKey::Text(Body::encode_form(pairs)),
        Body::File(path) => BodyKey::File(path.to_string_lossy().into_owned()),
        Body::Multipart(form) => BodyKey::Multipart {
            kind: "FormData",
            entries: form
                .fields()
                .iter()
                .map(|(name, value)| (name.as_str(), value))
                .collect(),
        },
        Body::Bytes(bytes) => BodyKey::Text(String::from_utf8_lossy(bytes).into_owned()),
        Body::Stream(_) => {
            return Err(FetchCacheError::UnsupportedBodyType { found: body.kind() });
        }
    })
}

/// Lowercased `(name, value)` pairs sorted by name, minus `only-if-cached`.
/// The sort is stable, so repeated values of one header keep their order.
fn headers_key(headers: &Headers) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.trim().to_ascii_lowercase();
            if name != "cache-control" {
                return Some((name, value.to_owned()));
            }
            let remaining: Vec<&str> = value
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("only-if-cached"))
                .collect();
            if remaining.is_empty() {
                None
            } else {
                Some((name, remaining.join(", ")))
            }
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

/// `true` if the value of a `Cache-Control` header lists `only-if-cached`.
pub(crate) fn has_only_if_cached(headers: &Headers) -> bool {
    headers
        .iter()
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case("cache-control"))
        .any(|(_, value)| {
            value
                .split(',')
                .any(|d| d.trim().eq_ignore_ascii_case("only-if-cached"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{FormData, Method, Request};
    use bytes::Bytes;

    fn key(resource: impl Into<Resource>, init: RequestInit) -> String {
        calculate_cache_key(&resource.into(), &init).unwrap()
    }

    const URL: &str = "http://localhost/status/200";

    #[test]
    fn version_is_pinned() {
        // Changing the derivation without bumping CACHE_VERSION breaks this on purpose.
        let json = serde_json::to_string(&(
            ResourceKey::Url { url: URL },
            InitKey {
                method: None,
                headers: Vec::new(),
                body: None,
                redirect: None,
                referrer: None,
            },
            CACHE_VERSION,
        ))
        .unwrap();
        assert_eq!(
            json,
            r#"[{"url":"http://localhost/status/200"},{"method":null,"headers":[],"body":null,"redirect":null,"referrer":null},7]"#
        );
    }

    #[test]
    fn deterministic() {
        assert_eq!(key(URL, RequestInit::new()), key(URL, RequestInit::new()));
        assert_eq!(key(URL, RequestInit::new()).len(), 64);
    }

    #[test]
    fn sensitive_to_url_method_and_body() {
        let base = key(URL, RequestInit::new());
        assert_ne!(base, key("http://localhost/status/201", RequestInit::new()));
        assert_ne!(base, key(URL, RequestInit::new().method(Method::Post)));
        assert_ne!(
            key(URL, RequestInit::new().body("a")),
            key(URL, RequestInit::new().body("b"))
        );
    }

    #[test]
    fn header_name_case_is_ignored_but_values_are_not() {
        assert_eq!(
            key(URL, RequestInit::new().header("X-Thing", "1")),
            key(URL, RequestInit::new().header("x-thing", "1"))
        );
        assert_ne!(
            key(URL, RequestInit::new().header("X-Thing", "1")),
            key(URL, RequestInit::new().header("X-Thing", "2"))
        );
    }

    #[test]
    fn header_order_is_ignored() {
        assert_eq!(
            key(Request::new(URL).header("Accept", "x").header("X-Trace", "1"), RequestInit::new()),
            key(Request::new(URL).header("X-Trace", "1").header("Accept", "x"), RequestInit::new())
        );
        assert_eq!(
            key(URL, RequestInit::new().header("Accept", "x").header("X-Trace", "1")),
            key(URL, RequestInit::new().header("x-trace", "1").header("accept", "x"))
        );
        // Repeated values of one header are still order-sensitive.
        assert_ne!(
            key(URL, RequestInit::new().header("Accept", "a").header("Accept", "b")),
            key(URL, RequestInit::new().header("Accept", "b").header("Accept", "a"))
        );
    }

    #[test]
    fn only_if_cached_does_not_affect_key() {
        let plain = key(Request::new(URL), RequestInit::new());
        let flagged = key(
            Request::new(URL).header("Cache-Control", "Only-If-Cached"),
            RequestInit::new(),
        );
        assert_eq!(plain, flagged);

        // Other directives still count.
        assert_eq!(
            key(URL, RequestInit::new().header("Cache-Control", "no-store")),
            key(URL, RequestInit::new().header("cache-control", "no-store, only-if-cached"))
        );
        assert_ne!(
            key(URL, RequestInit::new()),
            key(URL, RequestInit::new().header("Cache-Control", "no-store"))
        );
    }

    #[test]
    fn multipart_boundary_is_ignored() {
        let a = FormData::new().text("a", "a");
        let b = FormData::new().text("a", "a");
        assert_ne!(a.boundary(), b.boundary());
        assert_eq!(
            key(URL, RequestInit::new().body(a)),
            key(URL, RequestInit::new().body(b))
        );
        assert_ne!(
            key(URL, RequestInit::new().body(FormData::new().text("a", "a"))),
            key(URL, RequestInit::new().body(FormData::new().text("b", "b")))
        );
    }

    #[test]
    fn form_and_file_bodies() {
        let form = |v: &str| Body::Form(vec![("a".to_owned(), v.to_owned())]);
        assert_eq!(
            key(URL, RequestInit::new().body(form("a"))),
            key(URL, RequestInit::new().body(form("a")))
        );
        assert_ne!(
            key(URL, RequestInit::new().body(form("a"))),
            key(URL, RequestInit::new().body(form("b")))
        );
        assert_ne!(
            key(URL, RequestInit::new().body(Body::File("/tmp/one".into()))),
            key(URL, RequestInit::new().body(Body::File("/tmp/two".into())))
        );
    }

    #[test]
    fn bytes_body_is_stringified() {
        assert_eq!(
            key(URL, RequestInit::new().body(Bytes::from_static(b"abc"))),
            key(URL, RequestInit::new().body("abc"))
        );
    }

    #[test]
    fn extensions_are_ignored() {
        struct Agent;
        assert_eq!(
            key(URL, RequestInit::new().extension(Agent)),
            key(URL, RequestInit::new())
        );
    }

    #[test]
    fn stream_body_is_rejected() {
        let init = RequestInit::new().body(Body::Stream(crate::http::body::empty()));
        let err = calculate_cache_key(&Resource::from(URL), &init).unwrap_err();
        assert!(matches!(err, FetchCacheError::UnsupportedBodyType { found: "stream" }));
        assert!(err.to_string().starts_with("Unsupported body type"));
    }

    #[test]
    fn request_resource_differs_from_plain_url() {
        assert_ne!(key(Request::new(URL), RequestInit::new()), key(URL, RequestInit::new()));
        assert_eq!(
            key(Request::new(URL).body("test").method(Method::Post), RequestInit::new()),
            key(Request::new(URL).body("test").method(Method::Post), RequestInit::new())
        );
    }

    #[test]
    fn detects_only_if_cached_among_directives() {
        let h: Headers = [("cache-control", "max-age=0 ,  ONLY-IF-CACHED")].into_iter().collect();
        assert!(has_only_if_cached(&h));
        let h: Headers = [("cache-control", "no-cache")].into_iter().collect();
        assert!(!has_only_if_cached(&h));
    }
}
