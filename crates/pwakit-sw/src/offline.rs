//! Last-resort responses when both network and cache miss.

use http::StatusCode;
use pwakit_net::{Request, Response};
use tracing::{debug, warn};
use url::Url;

use crate::cache::{BucketPurpose, CacheStorage};
use crate::storage::RequestKey;

/// Page served to navigations when no offline document is cached.
const OFFLINE_PAGE: &str = "<!DOCTYPE html>\
<html lang=\"en\"><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<title>Offline</title></head>\
<body><h1>You are offline</h1>\
<p>This page is not available without a connection. Try again once you are back online.</p>\
</body></html>";

/// Which substitute a route wants when it cannot produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackKind {
    /// Always the offline document.
    Document,
    /// Offline document for navigations, a 503 for everything else.
    #[default]
    Auto,
}

/// Offline fallback provider.
#[derive(Debug, Clone)]
pub struct OfflineFallback {
    caches: CacheStorage,
    document: Option<Url>,
}

impl OfflineFallback {
    pub fn new(caches: CacheStorage, document: Option<Url>) -> Self {
        Self { caches, document }
    }

    /// Configured offline document URL.
    pub fn document_url(&self) -> Option<&Url> {
        self.document.as_ref()
    }

    /// Substitute response for `request`. Never fails.
    pub async fn resolve(&self, request: &Request, kind: FallbackKind) -> Response {
        if kind == FallbackKind::Document || request.is_navigation() {
            return self.document().await;
        }

        debug!(url = %request.url, "Serving offline placeholder");
        if request.accepts(mime::APPLICATION_JSON.essence_str()) {
            Response::new(StatusCode::SERVICE_UNAVAILABLE, r#"{"error":"offline"}"#)
                .with_content_type(&mime::APPLICATION_JSON)
        } else {
            Response::new(StatusCode::SERVICE_UNAVAILABLE, "Offline")
                .with_content_type(&mime::TEXT_PLAIN_UTF_8)
        }
    }

    /// Offline document from the offline bucket, then the static bucket,
    /// else a synthesized page.
    pub async fn document(&self) -> Response {
        if let Some(url) = &self.document {
            let key = RequestKey::get(url);
            match self
                .caches
                .match_first(&[BucketPurpose::Offline, BucketPurpose::Static], &key)
                .await
            {
                Ok(Some(response)) => {
                    debug!(%url, "Serving cached offline document");
                    return response;
                }
                Ok(None) => {}
                Err(e) => warn!(%url, error = %e, "Offline document lookup failed"),
            }
        }

        debug!("Serving synthesized offline page");
        Response::new(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_PAGE)
            .with_content_type(&mime::TEXT_HTML_UTF_8)
    }
}
