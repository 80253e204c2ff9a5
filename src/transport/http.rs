//! The default transport, built on [`reqwest`].
//!
//! One [`reqwest::Client`] per redirect mode, created on first use and shared
//! by clones. Response bodies are streamed straight through as they arrive.

use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use once_cell::sync::OnceCell;
use reqwest::Client;
use reqwest::multipart;
use reqwest::redirect::Policy;
use tracing::{debug, info};
use url::Url;

use super::{RequestTimeout, Transport, TransportResponse};
use crate::error::{FetchCacheError, Result};
use crate::http::{Body, BodyStream, FormData, FormValue, Headers, Redirect, Request, body};

/// Hops followed before a redirect chain is abandoned.
const MAX_REDIRECTS: usize = 20;

tokio::task_local! {
    /// Redirects followed by the request running in the current task.
    static HOPS: Cell<u32>;
}

#[derive(Debug, Clone)]
struct Clients {
    follow: Client,
    error: Client,
    manual: Client,
}

impl Clients {
    fn build() -> reqwest::Result<Self> {
        let follow = Policy::custom(|attempt| {
            let hops = attempt.previous().len();
            if hops > MAX_REDIRECTS {
                let message = format!("maximum redirect reached at: {}", attempt.url());
                return attempt.error(message);
            }
            let _ = HOPS.try_with(|h| h.set(hops as u32));
            attempt.follow()
        });
        let error = Policy::custom(|attempt| {
            let message = format!("redirect mode is set to error: {}", attempt.url());
            attempt.error(message)
        });

        Ok(Self {
            follow: Client::builder().redirect(follow).build()?,
            error: Client::builder().redirect(error).build()?,
            manual: Client::builder().redirect(Policy::none()).build()?,
        })
    }

    fn for_mode(&self, mode: Redirect) -> &Client {
        match mode {
            Redirect::Follow => &self.follow,
            Redirect::Error => &self.error,
            Redirect::Manual => &self.manual,
        }
    }
}

/// The default [`Transport`].
///
/// The request's [`Redirect`] mode picks the redirect policy: `Follow` chases
/// up to 20 hops, `Error` fails on the first redirect, `Manual` hands the 3xx
/// back untouched.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use fetch_cache::transport::{HttpTransport, Transport};
/// use fetch_cache::http::Request;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = HttpTransport::new().with_timeout(Duration::from_secs(5));
///     let response = transport.fetch(Request::new("https://example.com/")).await?;
///     println!("{} redirected={}", response.status, response.redirected);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    clients: Arc<OnceCell<Clients>>,
    timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default limit for the whole exchange, body included. A
    /// [`RequestTimeout`] extension on the request takes precedence.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn clients(&self, url: &str) -> Result<&Clients> {
        self.clients
            .get_or_try_init(Clients::build)
            .map_err(|e| transport_error(url, e))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, mut request: Request) -> Result<TransportResponse> {
        let url = request.url().to_owned();
        let method = request.get_method().clone();
        let client = self.clients(&url)?.for_mode(request.get_redirect());

        let wire_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).map_err(|e| {
            FetchCacheError::Transport {
                url: url.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            }
        })?;
        let mut builder = client.request(wire_method, url.as_str());
        for (name, value) in request.headers().iter() {
            builder = builder.header(name, value);
        }
        if let Some(referrer) = request.get_referrer() {
            if !request.headers().contains("referer") {
                builder = builder.header(reqwest::header::REFERER, referrer);
            }
        }
        if let Some(limit) = request
            .extensions()
            .get::<RequestTimeout>()
            .map(|t| t.0)
            .or(self.timeout)
        {
            builder = builder.timeout(limit);
        }
        if let Some(body) = request.take_body() {
            // reqwest picks its own multipart boundary and header.
            if let Some(content_type) = body.content_type() {
                if !matches!(body, Body::Multipart(_)) && !request.headers().contains("content-type")
                {
                    builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
                }
            }
            builder = match body {
                Body::Text(text) => builder.body(text),
                Body::Form(pairs) => builder.body(Body::encode_form(&pairs)),
                Body::File(path) => {
                    let file = tokio::fs::File::open(&path).await.map_err(|source| {
                        FetchCacheError::Transport {
                            url: url.clone(),
                            source,
                        }
                    })?;
                    builder.body(reqwest::Body::wrap_stream(body::from_reader(file)))
                }
                Body::Multipart(form) => {
                    let form = multipart_form(&form).await.map_err(|source| {
                        FetchCacheError::Transport {
                            url: url.clone(),
                            source,
                        }
                    })?;
                    builder.multipart(form)
                }
                Body::Bytes(bytes) => builder.body(bytes),
                Body::Stream(stream) => builder.body(reqwest::Body::wrap_stream(stream)),
            };
        }

        let started = Instant::now();
        debug!(method = %method, url = %url, "sending request");
        let (response, hops) = HOPS
            .scope(Cell::new(0), async move {
                let response = builder.send().await;
                (response, HOPS.with(Cell::get))
            })
            .await;
        let response = response.map_err(|e| transport_error(&url, e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let redirected = Url::parse(&url).map_or(final_url != url, |u| &u != response.url());
        info!(
            method = %method,
            url = %url,
            status = status.as_u16(),
            redirected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetched from network"
        );

        let mut headers = Headers::with_capacity(response.headers().len());
        for (name, value) in response.headers() {
            headers.insert(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        }
        let body: BodyStream = Box::pin(response.bytes_stream().map_err(io_error));

        Ok(TransportResponse {
            url: final_url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            redirected,
            counter: hops,
            body,
        })
    }
}

fn io_error(e: reqwest::Error) -> io::Error {
    let kind = if e.is_timeout() {
        io::ErrorKind::TimedOut
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, e)
}

fn transport_error(url: &str, e: reqwest::Error) -> FetchCacheError {
    FetchCacheError::Transport {
        url: url.to_owned(),
        source: io_error(e),
    }
}

/// Rebuilds a [`FormData`] as a reqwest form. File fields are read now.
async fn multipart_form(form: &FormData) -> io::Result<multipart::Form> {
    let mut out = multipart::Form::new();
    for (name, value) in form.fields() {
        out = match value {
            FormValue::Text(text) => out.text(name.clone(), text.clone()),
            FormValue::File(path) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let part = multipart::Part::bytes(tokio::fs::read(path).await?).file_name(filename);
                out.part(name.clone(), part)
            }
        };
    }
    Ok(out)
}
