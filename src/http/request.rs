//! Client-side request description: what the caller asks the cache to fetch.
//!
//! A call names a [`Resource`] (a URL or a structured [`Request`]) plus an
//! optional [`RequestInit`] whose fields override the resource's.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use serde::Serialize;

use super::{BodyStream, Extensions, Headers, Method};

/// What the transport should do when the origin answers with a redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Redirect {
    #[default]
    Follow,
    Error,
    Manual,
}

/// A single multipart field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FormValue {
    Text(String),
    /// Contents are read from this path when the request is sent.
    File(PathBuf),
}

/// A `multipart/form-data` body.
///
/// Every instance gets a fresh random boundary, so two logically identical
/// forms serialise differently on the wire.
///
/// # Examples
///
/// ```
/// use fetch_cache::http::FormData;
///
/// let a = FormData::new().text("name", "value");
/// let b = FormData::new().text("name", "value");
/// assert_ne!(a.boundary(), b.boundary());
/// assert_eq!(a.fields(), b.fields());
/// ```
#[derive(Debug, Clone)]
pub struct FormData {
    boundary: String,
    fields: Vec<(String, FormValue)>,
}

impl FormData {
    pub fn new() -> Self {
        Self {
            boundary: format!("--------------------------{}", uuid::Uuid::new_v4().simple()),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), FormValue::Text(value.into())));
        self
    }

    #[must_use]
    pub fn file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.fields.push((name.into(), FormValue::File(path.into())));
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn fields(&self) -> &[(String, FormValue)] {
        &self.fields
    }
}

impl Default for FormData {
    fn default() -> Self {
        Self::new()
    }
}

/// A request body.
pub enum Body {
    Text(String),
    /// Query-parameter pairs, sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    /// A file streamed from disk.
    File(PathBuf),
    Multipart(FormData),
    Bytes(Bytes),
    /// An arbitrary one-shot stream. Sendable, but it has no stable identity,
    /// so it cannot take part in cache key computation.
    Stream(BodyStream),
}

impl Body {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Text(_) => "text",
            Body::Form(_) => "url-encoded form",
            Body::File(_) => "file",
            Body::Multipart(_) => "multipart form",
            Body::Bytes(_) => "bytes",
            Body::Stream(_) => "stream",
        }
    }

    /// The `Content-Type` implied by the body, if any.
    pub fn content_type(&self) -> Option<String> {
        match self {
            Body::Text(_) => Some("text/plain;charset=UTF-8".to_owned()),
            Body::Form(_) => Some("application/x-www-form-urlencoded;charset=UTF-8".to_owned()),
            Body::Multipart(form) => Some(format!(
                "multipart/form-data; boundary={}",
                form.boundary()
            )),
            Body::File(_) | Body::Bytes(_) | Body::Stream(_) => None,
        }
    }

    /// Canonical `a=b&c=d` rendering of form pairs.
    pub fn encode_form(pairs: &[(String, String)]) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Body::Form(pairs) => f.debug_tuple("Form").field(pairs).finish(),
            Body::File(path) => f.debug_tuple("File").field(path).finish(),
            Body::Multipart(form) => f.debug_tuple("Multipart").field(form).finish(),
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_owned())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(bytes))
    }
}

impl From<FormData> for Body {
    fn from(form: FormData) -> Self {
        Body::Multipart(form)
    }
}

/// A structured request.
///
/// # Examples
///
/// ```
/// use fetch_cache::http::{Method, Request};
///
/// let request = Request::new("http://localhost/items")
///     .method(Method::Post)
///     .header("X-Trace", "1")
///     .body("payload");
///
/// assert_eq!(request.get_method(), &Method::Post);
/// assert_eq!(request.headers().get("x-trace"), Some("1"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: String,
    headers: Headers,
    body: Option<Body>,
    redirect: Redirect,
    referrer: Option<String>,
    extensions: Extensions,
}

impl Request {
    /// Creates a `GET` request for `url` with no headers and no body.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Headers::new(),
            body: None,
            redirect: Redirect::default(),
            referrer: None,
            extensions: Extensions::new(),
        }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn redirect(mut self, redirect: Redirect) -> Self {
        self.redirect = redirect;
        self
    }

    #[must_use]
    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    /// Stores a transport-specific value (see [`Extensions`]).
    #[must_use]
    pub fn extension<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    pub fn get_method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn get_body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn get_redirect(&self) -> Redirect {
        self.redirect
    }

    pub fn get_referrer(&self) -> Option<&str> {
        self.referrer.as_deref()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Takes the body out, leaving `None`.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// Applies `init` on top of this request. Every field set in `init`
    /// overrides the request's; init headers replace same-named request headers.
    pub fn with_init(mut self, init: RequestInit) -> Self {
        if let Some(method) = init.method {
            self.method = method;
        }
        for name in init.headers.to_multi_map().keys() {
            self.headers.remove(name);
        }
        for (name, value) in init.headers.iter() {
            self.headers.insert(name, value);
        }
        if let Some(body) = init.body {
            self.body = Some(body);
        }
        if let Some(redirect) = init.redirect {
            self.redirect = redirect;
        }
        if let Some(referrer) = init.referrer {
            self.referrer = Some(referrer);
        }
        self.extensions.extend(init.extensions);
        self
    }
}

/// Per-call overrides applied on top of a [`Resource`].
#[derive(Debug, Default)]
pub struct RequestInit {
    pub method: Option<Method>,
    pub headers: Headers,
    pub body: Option<Body>,
    pub redirect: Option<Redirect>,
    pub referrer: Option<String>,
    /// Transport-specific values; never part of the cache key.
    pub extensions: Extensions,
}

impl RequestInit {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn redirect(mut self, redirect: Redirect) -> Self {
        self.redirect = Some(redirect);
        self
    }

    #[must_use]
    pub fn referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    #[must_use]
    pub fn extension<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }
}

/// The first argument of a fetch: a URL or a structured request.
#[derive(Debug)]
pub enum Resource {
    Url(String),
    Request(Request),
}

impl Resource {
    pub fn url(&self) -> &str {
        match self {
            Resource::Url(url) => url,
            Resource::Request(request) => request.url(),
        }
    }

    /// Headers carried by the resource itself (only structured requests have any).
    pub fn headers(&self) -> Option<&Headers> {
        match self {
            Resource::Url(_) => None,
            Resource::Request(request) => Some(request.headers()),
        }
    }

    /// Combines the resource and `init` into the request handed to the transport.
    pub fn into_request(self, init: RequestInit) -> Request {
        let request = match self {
            Resource::Url(url) => Request::new(url),
            Resource::Request(request) => request,
        };
        request.with_init(init)
    }
}

impl From<&str> for Resource {
    fn from(url: &str) -> Self {
        Resource::Url(url.to_owned())
    }
}

impl From<String> for Resource {
    fn from(url: String) -> Self {
        Resource::Url(url)
    }
}

impl From<Request> for Resource {
    fn from(request: Request) -> Self {
        Resource::Request(request)
    }
}
