//! # PWAKit Net
//!
//! Request/response model and network backends for the PWAKit caching worker.
//!
//! ## Design Goals
//!
//! 1. **Owned snapshots**: response bodies are `Bytes`, so a response can be
//!    duplicated for the cache without consuming the caller's copy
//! 2. **Injectable network**: everything that talks to the network goes
//!    through the [`Fetcher`] trait
//! 3. **fetch() semantics**: HTTP error statuses are successful fetches; only
//!    transport failures are errors

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod mock;
pub mod pattern;

pub use mock::MockFetcher;
pub use pattern::{matches_any, PatternType, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, mirroring `Request.mode` in the fetch standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Cross-origin without CORS; the response is opaque.
    NoCors,
    /// Regular CORS request.
    #[default]
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub referrer: Option<Url>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::Cors,
            body: None,
            timeout: None,
            referrer: None,
        }
    }

    /// Create a navigation request (a page load).
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .header(header::ACCEPT, HeaderValue::from_static("text/html"))
    }

    /// Parse a URL and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Change the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set a body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set referrer.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Whether this is a page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the scheme is http or https.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }

    /// Parsed media ranges from the Accept header.
    pub fn accept(&self) -> Vec<Mime> {
        self.headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|part| part.trim().parse::<Mime>().ok())
            .collect()
    }

    /// Whether the Accept header explicitly names `essence` (wildcards ignored).
    pub fn accepts(&self, essence: &str) -> bool {
        self.accept()
            .iter()
            .any(|m| m.essence_str().eq_ignore_ascii_case(essence))
    }

    /// Whether the request declares an HTML accept type.
    pub fn accepts_html(&self) -> bool {
        self.accepts(mime::TEXT_HTML.essence_str())
    }
}

/// Response type, mirroring `Response.type` in the fetch standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin network response.
    #[default]
    Basic,
    /// Cross-origin response with CORS.
    Cors,
    /// Cross-origin no-cors response; status and body are hidden.
    Opaque,
    /// Constructed locally (offline fallbacks, tests).
    Synthetic,
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    /// Served from a cache bucket rather than the network.
    pub from_cache: bool,
    body: Bytes,
}

impl Response {
    /// Create a synthetic response.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Synthetic,
            from_cache: false,
            body: body.into(),
        }
    }

    /// Create a network response for `url`.
    pub fn from_network(
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        response_type: ResponseType,
        body: Bytes,
    ) -> Self {
        Self {
            url: Some(url),
            status,
            headers,
            response_type,
            from_cache: false,
            body,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the Content-Type header.
    pub fn with_content_type(self, mime: &Mime) -> Self {
        match HeaderValue::from_str(mime.as_ref()) {
            Ok(value) => self.with_header(header::CONTENT_TYPE, value),
            Err(_) => self,
        }
    }

    /// Mark the response as served from cache.
    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the response is opaque.
    pub fn is_opaque(&self) -> bool {
        self.response_type == ResponseType::Opaque
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can perform a network fetch.
///
/// A returned `Ok` means the transport succeeded, whatever the status code.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("PWAKit/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// `reqwest`-backed fetcher.
pub struct ResourceLoader {
    client: Client,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!("ResourceLoader initialized");

        Ok(Self { client })
    }

    /// Classify a network response relative to the requesting page.
    fn response_type(request: &Request) -> ResponseType {
        let same_origin = request
            .referrer
            .as_ref()
            .map(|r| r.origin() == request.url.origin())
            .unwrap_or(true);

        match (same_origin, request.mode) {
            (true, _) => ResponseType::Basic,
            (false, RequestMode::NoCors) => ResponseType::Opaque,
            (false, _) => ResponseType::Cors,
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        if let Some(ref referrer) = request.referrer {
            builder = builder.header(header::REFERER, referrer.as_str());
        }

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let response_type = Self::response_type(request);

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            ?response_type,
            body_len = body.len(),
            "Response received"
        );

        if response_type == ResponseType::Opaque {
            // Opaque responses expose neither status nor headers.
            return Ok(Response::from_network(
                url,
                StatusCode::OK,
                HeaderMap::new(),
                ResponseType::Opaque,
                body,
            ));
        }

        Ok(Response::from_network(url, status, headers, response_type, body))
    }
}
