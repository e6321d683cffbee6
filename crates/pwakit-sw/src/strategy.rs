//! Strategy executor.
//!
//! Every path through [`StrategyExecutor::execute`] ends in a response: a
//! network result, a cached copy, or an offline substitute. Cache failures
//! are logged and treated as misses.

use std::fmt;
use std::sync::Arc;

use http::StatusCode;
use pwakit_net::{Fetcher, Request, Response};
use tracing::{debug, warn};

use crate::cache::{BucketPurpose, CacheStorage};
use crate::event::ExtendableEvent;
use crate::offline::{FallbackKind, OfflineFallback};
use crate::router::Strategy;
use crate::storage::RequestKey;

/// Whether a network response may be written to a bucket.
pub fn is_cacheable(response: &Response) -> bool {
    response.status == StatusCode::OK && !response.is_opaque()
}

/// Runs caching strategies against one generation's buckets.
#[derive(Clone)]
pub struct StrategyExecutor {
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    offline: OfflineFallback,
}

impl fmt::Debug for StrategyExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyExecutor")
            .field("caches", &self.caches)
            .finish_non_exhaustive()
    }
}

impl StrategyExecutor {
    pub fn new(caches: CacheStorage, fetcher: Arc<dyn Fetcher>, offline: OfflineFallback) -> Self {
        Self {
            caches,
            fetcher,
            offline,
        }
    }

    /// Run `strategy` for `request`. Background work is attached to `event`.
    pub async fn execute(
        &self,
        request: &Request,
        strategy: Strategy,
        fallback: FallbackKind,
        event: &ExtendableEvent,
    ) -> Response {
        match strategy {
            Strategy::CacheFirst => self.cache_first(request, fallback, event).await,
            Strategy::NetworkFirst => self.network_first(request, fallback).await,
            Strategy::StaleWhileRevalidate => {
                self.stale_while_revalidate(request, fallback, event).await
            }
            Strategy::NetworkOnly => self.network_only(request, fallback).await,
        }
    }

    /// Static then dynamic bucket; on a hit, refresh in the background.
    pub async fn cache_first(
        &self,
        request: &Request,
        fallback: FallbackKind,
        event: &ExtendableEvent,
    ) -> Response {
        let key = RequestKey::from_request(request);
        if let Some(hit) = self
            .lookup(&[BucketPurpose::Static, BucketPurpose::Dynamic], &key)
            .await
        {
            self.revalidate(request, event);
            return hit;
        }
        self.fetch_and_store(request, &key, fallback).await
    }

    /// Network, then dynamic bucket, then any bucket, then offline.
    pub async fn network_first(&self, request: &Request, fallback: FallbackKind) -> Response {
        let key = RequestKey::from_request(request);
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(&key, &response).await;
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                if let Some(hit) = self.lookup(&[BucketPurpose::Dynamic], &key).await {
                    return hit;
                }
                match self.caches.match_any(&key).await {
                    Ok(Some(hit)) => hit,
                    Ok(None) => self.offline.resolve(request, fallback).await,
                    Err(e) => {
                        warn!(url = %request.url, error = %e, "Cache lookup failed");
                        self.offline.resolve(request, fallback).await
                    }
                }
            }
        }
    }

    /// Cached copy at once with a background refresh; network on a miss.
    pub async fn stale_while_revalidate(
        &self,
        request: &Request,
        fallback: FallbackKind,
        event: &ExtendableEvent,
    ) -> Response {
        let key = RequestKey::from_request(request);
        if let Some(hit) = self
            .lookup(&[BucketPurpose::Dynamic, BucketPurpose::Static], &key)
            .await
        {
            self.revalidate(request, event);
            return hit;
        }
        self.fetch_and_store(request, &key, fallback).await
    }

    /// Network only; nothing is written.
    pub async fn network_only(&self, request: &Request, fallback: FallbackKind) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed");
                self.offline.resolve(request, fallback).await
            }
        }
    }

    async fn fetch_and_store(
        &self,
        request: &Request,
        key: &RequestKey,
        fallback: FallbackKind,
    ) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(key, &response).await;
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed after cache miss");
                self.offline.resolve(request, fallback).await
            }
        }
    }

    async fn lookup(&self, order: &[BucketPurpose], key: &RequestKey) -> Option<Response> {
        match self.caches.match_first(order, key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url = %key.url, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Best-effort write into the dynamic bucket.
    async fn store(&self, key: &RequestKey, response: &Response) {
        if !is_cacheable(response) {
            debug!(url = %key.url, status = %response.status, "Not caching response");
            return;
        }
        if let Err(e) = self
            .caches
            .put(BucketPurpose::Dynamic, key, response)
            .await
        {
            warn!(url = %key.url, error = %e, "Cache write failed");
        }
    }

    fn revalidate(&self, request: &Request, event: &ExtendableEvent) {
        let executor = self.clone();
        let request = request.clone();
        event.wait_until(async move {
            let key = RequestKey::from_request(&request);
            match executor.fetcher.fetch(&request).await {
                Ok(response) => executor.store(&key, &response).await,
                Err(e) => debug!(url = %request.url, error = %e, "Background revalidation failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CacheBackend, MemoryBackend};
    use pwakit_net::MockFetcher;
    use url::Url;

    struct Harness {
        executor: StrategyExecutor,
        caches: CacheStorage,
        fetcher: Arc<MockFetcher>,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryBackend::new()))
    }

    fn harness_with(backend: Arc<dyn CacheBackend>) -> Harness {
        let caches = CacheStorage::new(backend, "hmsi", "v1");
        let fetcher = Arc::new(MockFetcher::new());
        let offline = OfflineFallback::new(
            caches.clone(),
            Some(Url::parse("https://app.test/offline.html").unwrap()),
        );
        Harness {
            executor: StrategyExecutor::new(caches.clone(), fetcher.clone(), offline),
            caches,
            fetcher,
        }
    }

    fn get(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    async fn cached(caches: &CacheStorage, purpose: BucketPurpose, url: &str) -> Option<String> {
        caches
            .match_in(purpose, &RequestKey::get(&Url::parse(url).unwrap()))
            .await
            .unwrap()
            .map(|r| r.text().unwrap())
    }

    #[tokio::test]
    async fn test_cache_first_miss_fetches_and_stores() {
        let h = harness();
        h.fetcher.respond("https://app.test/app.js", 200, "v1");
        let event = ExtendableEvent::new();

        let response = h
            .executor
            .cache_first(&get("https://app.test/app.js"), FallbackKind::Auto, &event)
            .await;

        assert_eq!(response.text().unwrap(), "v1");
        assert!(!response.from_cache);
        assert_eq!(
            cached(&h.caches, BucketPurpose::Dynamic, "https://app.test/app.js").await,
            Some("v1".into())
        );
    }

    #[tokio::test]
    async fn test_cache_first_hit_revalidates_in_background() {
        let h = harness();
        let url = "https://app.test/app.js";
        h.caches
            .put(
                BucketPurpose::Static,
                &RequestKey::get(&Url::parse(url).unwrap()),
                &Response::new(StatusCode::OK, "old"),
            )
            .await
            .unwrap();
        h.fetcher.respond(url, 200, "new");

        let event = ExtendableEvent::new();
        let response = h.executor.cache_first(&get(url), FallbackKind::Auto, &event).await;
        assert_eq!(response.text().unwrap(), "old");
        assert!(response.from_cache);

        event.settled().await;
        assert_eq!(h.fetcher.request_count(url), 1);
        assert_eq!(
            cached(&h.caches, BucketPurpose::Dynamic, url).await,
            Some("new".into())
        );
    }

    #[tokio::test]
    async fn test_http_errors_returned_but_not_cached() {
        let h = harness();
        h.fetcher.respond("https://app.test/missing.css", 404, "nope");
        h.fetcher.respond("https://app.test/broken", 500, "oops");
        let event = ExtendableEvent::new();

        let missing = h
            .executor
            .cache_first(&get("https://app.test/missing.css"), FallbackKind::Auto, &event)
            .await;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let broken = h
            .executor
            .network_first(&get("https://app.test/broken"), FallbackKind::Auto)
            .await;
        assert_eq!(broken.status, StatusCode::INTERNAL_SERVER_ERROR);

        assert!(h
            .caches
            .open_bucket(BucketPurpose::Dynamic)
            .await
            .unwrap()
            .keys()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_opaque_responses_not_cached() {
        let h = harness();
        h.fetcher.respond_opaque("https://cdn.other/font.woff2", "bytes");

        let response = h
            .executor
            .network_first(&get("https://cdn.other/font.woff2"), FallbackKind::Auto)
            .await;
        assert!(response.is_opaque());
        assert_eq!(
            cached(&h.caches, BucketPurpose::Dynamic, "https://cdn.other/font.woff2").await,
            None
        );
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_dynamic_then_any_bucket() {
        let h = harness();
        let url = "https://app.test/page";
        h.fetcher.respond(url, 200, "fresh");

        let fresh = h.executor.network_first(&get(url), FallbackKind::Auto).await;
        assert_eq!(fresh.text().unwrap(), "fresh");

        h.fetcher.set_online(false);
        let stale = h.executor.network_first(&get(url), FallbackKind::Auto).await;
        assert_eq!(stale.text().unwrap(), "fresh");
        assert!(stale.from_cache);

        // Only present outside the dynamic bucket.
        let other = "https://app.test/elsewhere";
        h.caches
            .put(
                BucketPurpose::Offline,
                &RequestKey::get(&Url::parse(other).unwrap()),
                &Response::new(StatusCode::OK, "from offline bucket"),
            )
            .await
            .unwrap();
        let any = h.executor.network_first(&get(other), FallbackKind::Auto).await;
        assert_eq!(any.text().unwrap(), "from offline bucket");
    }

    #[tokio::test]
    async fn test_network_first_total_failure_is_offline_response() {
        let h = harness();
        h.fetcher.set_online(false);

        let response = h
            .executor
            .network_first(&get("https://app.test/data"), FallbackKind::Auto)
            .await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_prefers_dynamic() {
        let h = harness();
        let url = "https://app.test/manifest.json";
        let key = RequestKey::get(&Url::parse(url).unwrap());
        h.caches
            .put(BucketPurpose::Static, &key, &Response::new(StatusCode::OK, "static"))
            .await
            .unwrap();
        h.caches
            .put(BucketPurpose::Dynamic, &key, &Response::new(StatusCode::OK, "dynamic"))
            .await
            .unwrap();
        h.fetcher.respond(url, 200, "network");

        let event = ExtendableEvent::new();
        let response = h
            .executor
            .stale_while_revalidate(&get(url), FallbackKind::Auto, &event)
            .await;
        assert_eq!(response.text().unwrap(), "dynamic");

        event.settled().await;
        assert_eq!(
            cached(&h.caches, BucketPurpose::Dynamic, url).await,
            Some("network".into())
        );
        assert_eq!(
            cached(&h.caches, BucketPurpose::Static, url).await,
            Some("static".into())
        );
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_miss_awaits_network() {
        let h = harness();
        let url = "https://app.test/about";
        h.fetcher.respond(url, 200, "about");

        let event = ExtendableEvent::new();
        let response = h
            .executor
            .stale_while_revalidate(&get(url), FallbackKind::Auto, &event)
            .await;
        assert_eq!(response.text().unwrap(), "about");
        assert_eq!(event.pending(), 0);
        assert_eq!(
            cached(&h.caches, BucketPurpose::Dynamic, url).await,
            Some("about".into())
        );
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_cached_copy() {
        let h = harness();
        let url = "https://app.test/style.css";
        let key = RequestKey::get(&Url::parse(url).unwrap());
        h.caches
            .put(BucketPurpose::Static, &key, &Response::new(StatusCode::OK, "cached"))
            .await
            .unwrap();
        h.fetcher.set_online(false);

        let event = ExtendableEvent::new();
        let response = h.executor.cache_first(&get(url), FallbackKind::Auto, &event).await;
        event.settled().await;

        assert_eq!(response.text().unwrap(), "cached");
        assert_eq!(cached(&h.caches, BucketPurpose::Dynamic, url).await, None);
    }

    #[tokio::test]
    async fn test_network_only_never_writes() {
        let h = harness();
        let url = "https://script.google.com/macros/exec";
        h.fetcher.respond(url, 200, "{}");

        let response = h.executor.network_only(&get(url), FallbackKind::Auto).await;
        assert_eq!(response.status, StatusCode::OK);
        assert!(h.caches.bucket_names().await.unwrap().is_empty());

        h.fetcher.set_online(false);
        let offline = h.executor.network_only(&get(url), FallbackKind::Auto).await;
        assert_eq!(offline.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_write_failure_still_delivers_response() {
        let h = harness_with(Arc::new(MemoryBackend::with_quota(4)));
        let url = "https://app.test/big.js";
        h.fetcher.respond(url, 200, "far too large for the quota");

        let event = ExtendableEvent::new();
        let response = h.executor.cache_first(&get(url), FallbackKind::Auto, &event).await;
        assert_eq!(response.text().unwrap(), "far too large for the quota");
        assert_eq!(cached(&h.caches, BucketPurpose::Dynamic, url).await, None);
    }

    #[test]
    fn test_cacheability() {
        assert!(is_cacheable(&Response::new(StatusCode::OK, "")));
        assert!(!is_cacheable(&Response::new(StatusCode::NO_CONTENT, "")));
        assert!(!is_cacheable(&Response::new(StatusCode::NOT_FOUND, "")));
    }
}
