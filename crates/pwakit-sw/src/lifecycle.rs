//! Worker lifecycle: states, registration slots and the install procedures.
//!
//! ```text
//! Registration (scope)
//!     ├── installing   Parsed → Installing
//!     ├── waiting      Installed
//!     └── active       Activating → Activated
//!
//! A worker leaves every slot as Redundant: when install fails, when a newer
//! worker replaces it in the waiting slot, or when its successor activates.
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use pwakit_common::{retry_with_backoff_if, RetryConfig};
use pwakit_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{BucketPurpose, CacheStorage};
use crate::error::{ServiceWorkerError, SwResult};
use crate::storage::RequestKey;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Precaching (install event).
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Cleaning up old generations (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

// ==================== Service Worker ====================

/// Registration record for one worker generation.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub generation: String,
    pub state: ServiceWorkerState,
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(id: ServiceWorkerId, generation: &str) -> Self {
        Self {
            id,
            generation: generation.to_string(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

// ==================== Registration ====================

/// Installing/waiting/active slots for a scope.
///
/// Every transition returns the workers whose state changed so the caller
/// can announce them.
#[derive(Debug)]
pub struct Registration {
    pub scope: Url,
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    pub active: Option<ServiceWorker>,
    pub last_update: Option<Instant>,
}

impl Registration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update: None,
        }
    }

    /// Put a new worker in the installing slot. A worker already installing
    /// is displaced and becomes redundant.
    pub fn update(&mut self, worker: ServiceWorker) -> Vec<ServiceWorker> {
        let mut changed = Vec::new();
        if let Some(mut old) = self.installing.replace(worker) {
            old.set_state(ServiceWorkerState::Redundant);
            changed.push(old);
        }
        self.last_update = Some(Instant::now());
        changed
    }

    /// Current state of a worker; `Redundant` once it left every slot.
    pub fn state_of(&self, id: ServiceWorkerId) -> ServiceWorkerState {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
            .map(|w| w.state)
            .unwrap_or(ServiceWorkerState::Redundant)
    }

    /// Mark the installing worker as installing.
    pub fn begin_install(&mut self, id: ServiceWorkerId) -> SwResult<ServiceWorker> {
        match self.installing.as_mut() {
            Some(worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Installing);
                Ok(worker.clone())
            }
            _ => Err(ServiceWorkerError::StateError(format!(
                "worker {} is not in the installing slot",
                id.raw()
            ))),
        }
    }

    /// Move the installing worker to the waiting slot.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> SwResult<Vec<ServiceWorker>> {
        let Some(mut worker) = take_matching(&mut self.installing, id) else {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {} is not installing",
                id.raw()
            )));
        };
        worker.set_state(ServiceWorkerState::Installed);

        let mut changed = Vec::new();
        if let Some(mut old) = self.waiting.replace(worker.clone()) {
            old.set_state(ServiceWorkerState::Redundant);
            changed.push(old);
        }
        changed.push(worker);
        Ok(changed)
    }

    /// Drop a worker whose install failed.
    pub fn install_failed(&mut self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        let mut worker = take_matching(&mut self.installing, id)?;
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Promote the waiting worker to the active slot in `Activating`. The
    /// previous active worker becomes redundant.
    ///
    /// Re-activating the already active worker is allowed and changes nothing.
    pub fn begin_activation(&mut self, id: ServiceWorkerId) -> SwResult<Vec<ServiceWorker>> {
        if self.active.as_ref().is_some_and(|w| w.id == id) {
            return Ok(Vec::new());
        }

        let Some(mut worker) = take_matching(&mut self.waiting, id) else {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {} is not waiting",
                id.raw()
            )));
        };
        worker.set_state(ServiceWorkerState::Activating);

        let mut changed = Vec::new();
        if let Some(mut old) = self.active.replace(worker.clone()) {
            old.set_state(ServiceWorkerState::Redundant);
            changed.push(old);
        }
        changed.push(worker);
        Ok(changed)
    }

    /// Mark the activating worker as activated.
    pub fn finish_activation(&mut self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        match self.active.as_mut() {
            Some(worker) if worker.id == id && worker.state == ServiceWorkerState::Activating => {
                worker.set_state(ServiceWorkerState::Activated);
                Some(worker.clone())
            }
            _ => None,
        }
    }

    /// Active worker, the one controlling pages.
    pub fn controller(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Empty every slot.
    pub fn unregister(&mut self) -> Vec<ServiceWorker> {
        [
            self.installing.take(),
            self.waiting.take(),
            self.active.take(),
        ]
        .into_iter()
        .flatten()
        .map(|mut worker| {
            worker.set_state(ServiceWorkerState::Redundant);
            worker
        })
        .collect()
    }
}

fn take_matching(slot: &mut Option<ServiceWorker>, id: ServiceWorkerId) -> Option<ServiceWorker> {
    if slot.as_ref().is_some_and(|w| w.id == id) {
        slot.take()
    } else {
        None
    }
}

// ==================== Install procedure ====================

/// Outcome of precaching the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrecacheReport {
    /// URLs now in the static bucket.
    pub cached: Vec<String>,
    /// URLs that failed even after retries.
    pub skipped: Vec<String>,
    /// Whether the offline document made it into the offline bucket.
    pub offline_document: bool,
}

/// Populate the static bucket with `manifest`, then the offline bucket with
/// the offline document.
///
/// A bulk add is tried first. If any asset fails, assets are added one at a
/// time with `retry`; assets that still fail are skipped.
pub async fn precache(
    caches: &CacheStorage,
    fetcher: &dyn Fetcher,
    manifest: &[Url],
    offline_document: Option<&Url>,
    retry: &RetryConfig,
) -> SwResult<PrecacheReport> {
    let bucket = caches.open_bucket(BucketPurpose::Static).await?;
    let requests: Vec<Request> = manifest.iter().cloned().map(Request::get).collect();
    let mut report = PrecacheReport::default();

    match bucket.add_all(fetcher, &requests).await {
        Ok(()) => {
            report.cached = manifest.iter().map(|u| u.to_string()).collect();
        }
        Err(e) => {
            warn!(bucket = bucket.name(), error = %e, "Bulk precache failed, adding assets individually");
            for request in &requests {
                let result = retry_with_backoff_if(
                    retry,
                    || bucket.add(fetcher, request),
                    ServiceWorkerError::is_transient,
                )
                .await;
                match result {
                    Ok(()) => report.cached.push(request.url.to_string()),
                    Err(e) => {
                        warn!(url = %request.url, error = %e, "Skipped precache asset");
                        report.skipped.push(request.url.to_string());
                    }
                }
            }
        }
    }

    if let Some(url) = offline_document {
        report.offline_document = cache_offline_document(caches, fetcher, url).await;
    }

    info!(
        generation = caches.generation(),
        cached = report.cached.len(),
        skipped = report.skipped.len(),
        "Precache complete"
    );
    Ok(report)
}

/// Copy the offline document into the offline bucket, from the static bucket
/// when present, else from the network. Best-effort.
async fn cache_offline_document(caches: &CacheStorage, fetcher: &dyn Fetcher, url: &Url) -> bool {
    match copy_offline_document(caches, fetcher, url).await {
        Ok(()) => {
            debug!(%url, "Cached offline document");
            true
        }
        Err(e) => {
            warn!(%url, error = %e, "Offline document not cached");
            false
        }
    }
}

async fn copy_offline_document(
    caches: &CacheStorage,
    fetcher: &dyn Fetcher,
    url: &Url,
) -> SwResult<()> {
    let key = RequestKey::get(url);
    let bucket = caches.open_bucket(BucketPurpose::Offline).await?;
    match caches.match_in(BucketPurpose::Static, &key).await? {
        Some(response) => bucket.put(&key, &response).await,
        None => bucket.add(fetcher, &Request::get(url.clone())).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use pwakit_net::MockFetcher;
    use std::sync::Arc;
    use std::time::Duration;

    fn worker(generation: &str) -> ServiceWorker {
        ServiceWorker::new(ServiceWorkerId::new(), generation)
    }

    fn registration() -> Registration {
        Registration::new(Url::parse("https://app.test/").unwrap())
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut reg = registration();
        let first = worker("v1");
        let id = first.id;

        reg.update(first);
        assert_eq!(reg.state_of(id), ServiceWorkerState::Parsed);

        reg.begin_install(id).unwrap();
        assert_eq!(reg.state_of(id), ServiceWorkerState::Installing);

        reg.install_complete(id).unwrap();
        assert!(reg.installing.is_none());
        assert_eq!(reg.state_of(id), ServiceWorkerState::Installed);

        reg.begin_activation(id).unwrap();
        assert_eq!(reg.state_of(id), ServiceWorkerState::Activating);
        reg.finish_activation(id).unwrap();
        assert!(reg.controller().unwrap().is_active());
    }

    #[test]
    fn test_previous_active_redundant_only_on_activation() {
        let mut reg = registration();
        let a = worker("v1");
        let a_id = a.id;
        reg.update(a);
        reg.begin_install(a_id).unwrap();
        reg.install_complete(a_id).unwrap();
        reg.begin_activation(a_id).unwrap();
        reg.finish_activation(a_id);

        let b = worker("v2");
        let b_id = b.id;
        reg.update(b);
        reg.begin_install(b_id).unwrap();
        reg.install_complete(b_id).unwrap();
        assert_eq!(reg.state_of(a_id), ServiceWorkerState::Activated);
        assert_eq!(reg.state_of(b_id), ServiceWorkerState::Installed);

        let changed = reg.begin_activation(b_id).unwrap();
        assert_eq!(changed[0].id, a_id);
        assert_eq!(changed[0].state, ServiceWorkerState::Redundant);
        assert_eq!(reg.state_of(a_id), ServiceWorkerState::Redundant);
    }

    #[test]
    fn test_reactivating_active_worker_is_noop() {
        let mut reg = registration();
        let a = worker("v1");
        let id = a.id;
        reg.update(a);
        reg.begin_install(id).unwrap();
        reg.install_complete(id).unwrap();
        reg.begin_activation(id).unwrap();
        reg.finish_activation(id);

        assert!(reg.begin_activation(id).unwrap().is_empty());
        assert_eq!(reg.state_of(id), ServiceWorkerState::Activated);
    }

    #[test]
    fn test_out_of_order_transitions_rejected() {
        let mut reg = registration();
        let a = worker("v1");
        let id = a.id;
        assert!(reg.begin_install(id).is_err());

        reg.update(a);
        assert!(reg.begin_activation(id).is_err());
        assert!(reg.install_failed(id).is_some());
        assert_eq!(reg.state_of(id), ServiceWorkerState::Redundant);
    }

    #[test]
    fn test_unregister() {
        let mut reg = registration();
        let a = worker("v1");
        reg.update(a);
        let removed = reg.unregister();
        assert_eq!(removed.len(), 1);
        assert!(removed.iter().all(|w| w.state == ServiceWorkerState::Redundant));
        assert!(reg.installing.is_none());
    }

    #[tokio::test]
    async fn test_precache_bulk_success() {
        let caches = CacheStorage::new(Arc::new(MemoryBackend::new()), "hmsi", "v1");
        let fetcher = MockFetcher::new();
        fetcher.respond("https://app.test/", 200, "home");
        fetcher.respond("https://app.test/offline.html", 200, "offline");

        let manifest = vec![
            Url::parse("https://app.test/").unwrap(),
            Url::parse("https://app.test/offline.html").unwrap(),
        ];
        let report = precache(&caches, &fetcher, &manifest, Some(&manifest[1]), &retry())
            .await
            .unwrap();

        assert_eq!(report.cached.len(), 2);
        assert!(report.skipped.is_empty());
        assert!(report.offline_document);
        // Copied from the static bucket, not fetched again.
        assert_eq!(fetcher.request_count("https://app.test/offline.html"), 1);
    }

    #[tokio::test]
    async fn test_precache_skips_failing_asset_after_retry() {
        let caches = CacheStorage::new(Arc::new(MemoryBackend::new()), "hmsi", "v1");
        let fetcher = MockFetcher::new();
        fetcher.respond("https://app.test/", 200, "home");
        fetcher.fail("https://app.test/flaky.png");

        let manifest = vec![
            Url::parse("https://app.test/").unwrap(),
            Url::parse("https://app.test/flaky.png").unwrap(),
        ];
        let report = precache(&caches, &fetcher, &manifest, None, &retry())
            .await
            .unwrap();

        assert_eq!(report.cached, vec!["https://app.test/"]);
        assert_eq!(report.skipped, vec!["https://app.test/flaky.png"]);
        // Bulk attempt, then two individual attempts.
        assert_eq!(fetcher.request_count("https://app.test/flaky.png"), 3);
    }

    #[tokio::test]
    async fn test_precache_does_not_retry_http_errors() {
        let caches = CacheStorage::new(Arc::new(MemoryBackend::new()), "hmsi", "v1");
        let fetcher = MockFetcher::new();

        let manifest = vec![Url::parse("https://app.test/gone.css").unwrap()];
        let report = precache(&caches, &fetcher, &manifest, None, &retry())
            .await
            .unwrap();

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(fetcher.request_count("https://app.test/gone.css"), 2);
    }
}
