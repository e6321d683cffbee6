//! Generation-scoped cache buckets.
//!
//! ```text
//! CacheStorage (prefix "hmsi", generation "v1.2.0")
//!     ├── hmsi-static-v1.2.0    precached app shell
//!     ├── hmsi-dynamic-v1.2.0   runtime responses
//!     └── hmsi-offline-v1.2.0   offline document
//! ```

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use pwakit_net::{Fetcher, Request, Response};
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{ServiceWorkerError, SwResult};
use crate::storage::{CacheBackend, CachedResponse, RequestKey};

/// What a bucket is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketPurpose {
    /// Precached app shell.
    Static,
    /// Responses cached at runtime.
    Dynamic,
    /// Offline fallback document.
    Offline,
}

impl BucketPurpose {
    pub const ALL: [BucketPurpose; 3] = [
        BucketPurpose::Static,
        BucketPurpose::Dynamic,
        BucketPurpose::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketPurpose::Static => "static",
            BucketPurpose::Dynamic => "dynamic",
            BucketPurpose::Offline => "offline",
        }
    }
}

impl fmt::Display for BucketPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==================== Bucket ====================

/// Handle to one named bucket.
#[derive(Clone)]
pub struct Bucket {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").field("name", &self.name).finish()
    }
}

impl Bucket {
    /// Bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request key.
    pub async fn match_key(&self, key: &RequestKey) -> SwResult<Option<Response>> {
        Ok(self
            .backend
            .get(&self.name, key)
            .await?
            .map(|entry| entry.to_response()))
    }

    /// Store a snapshot of `response`; the caller keeps the original.
    pub async fn put(&self, key: &RequestKey, response: &Response) -> SwResult<()> {
        if !key.is_cacheable() {
            return Err(ServiceWorkerError::StateError(format!(
                "{} requests are not cacheable",
                key.method
            )));
        }
        self.backend
            .put(&self.name, key, CachedResponse::from_response(response))
            .await?;
        Ok(())
    }

    /// Fetch `request` and store it if the status is 200.
    pub async fn add(&self, fetcher: &dyn Fetcher, request: &Request) -> SwResult<()> {
        let response = fetch_ok(fetcher, request).await?;
        self.put(&RequestKey::from_request(request), &response).await
    }

    /// Fetch every request; store them only if all succeed.
    pub async fn add_all(&self, fetcher: &dyn Fetcher, requests: &[Request]) -> SwResult<()> {
        let results = join_all(requests.iter().map(|r| fetch_ok(fetcher, r))).await;

        let mut responses = Vec::with_capacity(results.len());
        for result in results {
            responses.push(result?);
        }

        for (request, response) in requests.iter().zip(&responses) {
            self.put(&RequestKey::from_request(request), response).await?;
        }
        Ok(())
    }

    /// Delete an entry.
    pub async fn delete(&self, key: &RequestKey) -> SwResult<bool> {
        Ok(self.backend.remove(&self.name, key).await?)
    }

    /// All keys (sorted).
    pub async fn keys(&self) -> SwResult<Vec<RequestKey>> {
        Ok(self.backend.entries(&self.name).await?)
    }
}

async fn fetch_ok(fetcher: &dyn Fetcher, request: &Request) -> SwResult<Response> {
    let response = fetcher.fetch(request).await?;
    if response.status != http::StatusCode::OK {
        return Err(ServiceWorkerError::BadResponse {
            url: request.url.to_string(),
            status: response.status.as_u16(),
        });
    }
    Ok(response)
}

// ==================== Cache storage ====================

/// One line of a cache inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketReport {
    pub name: String,
    pub entries: usize,
    pub current: bool,
}

/// Cache store manager for one worker generation.
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    generation: String,
}

impl fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStorage")
            .field("prefix", &self.prefix)
            .field("generation", &self.generation)
            .finish()
    }
}

impl CacheStorage {
    /// Create cache storage for `generation`.
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: &str, generation: &str) -> Self {
        Self {
            backend,
            prefix: prefix.to_string(),
            generation: generation.to_string(),
        }
    }

    /// Current generation.
    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Bucket name for `purpose` in the current generation.
    pub fn bucket_name(&self, purpose: BucketPurpose) -> String {
        format!("{}-{}-{}", self.prefix, purpose, self.generation)
    }

    /// Whether `name` is one of this app's buckets (any generation).
    pub fn owns(&self, name: &str) -> bool {
        name.strip_prefix(&self.prefix)
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Whether `name` belongs to the current generation.
    pub fn is_current(&self, name: &str) -> bool {
        BucketPurpose::ALL
            .iter()
            .any(|p| self.bucket_name(*p) == name)
    }

    /// Open (creating if needed) the bucket for `purpose`.
    pub async fn open_bucket(&self, purpose: BucketPurpose) -> SwResult<Bucket> {
        let name = self.bucket_name(purpose);
        self.backend.open(&name).await?;
        Ok(Bucket {
            name,
            backend: Arc::clone(&self.backend),
        })
    }

    /// Handle to the bucket for `purpose` without creating it.
    fn handle(&self, purpose: BucketPurpose) -> Bucket {
        Bucket {
            name: self.bucket_name(purpose),
            backend: Arc::clone(&self.backend),
        }
    }

    /// Store into the bucket for `purpose`.
    pub async fn put(
        &self,
        purpose: BucketPurpose,
        key: &RequestKey,
        response: &Response,
    ) -> SwResult<()> {
        self.handle(purpose).put(key, response).await
    }

    /// Look up `key` in one purpose bucket.
    pub async fn match_in(
        &self,
        purpose: BucketPurpose,
        key: &RequestKey,
    ) -> SwResult<Option<Response>> {
        self.handle(purpose).match_key(key).await
    }

    /// Look up `key` in purpose buckets, in the given order.
    pub async fn match_first(
        &self,
        order: &[BucketPurpose],
        key: &RequestKey,
    ) -> SwResult<Option<Response>> {
        for purpose in order {
            if let Some(hit) = self.match_in(*purpose, key).await? {
                trace!(url = %key.url, bucket = %purpose, "Cache hit");
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Look up `key` in every bucket. Only used for fallbacks.
    pub async fn match_any(&self, key: &RequestKey) -> SwResult<Option<Response>> {
        for name in self.backend.keys().await? {
            if let Some(entry) = self.backend.get(&name, key).await? {
                trace!(url = %key.url, bucket = %name, "Fallback cache hit");
                return Ok(Some(entry.to_response()));
            }
        }
        Ok(None)
    }

    /// Delete a bucket by name.
    pub async fn delete_bucket(&self, name: &str) -> SwResult<bool> {
        let deleted = self.backend.delete(name).await?;
        if deleted {
            debug!(bucket = name, "Deleted bucket");
        }
        Ok(deleted)
    }

    /// Every bucket name in the backend, sorted.
    pub async fn bucket_names(&self) -> SwResult<Vec<String>> {
        Ok(self.backend.keys().await?)
    }

    /// Delete every bucket of this app that is not in the current generation.
    pub async fn delete_stale(&self) -> SwResult<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.bucket_names().await? {
            if self.owns(&name) && !self.is_current(&name) && self.delete_bucket(&name).await? {
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    /// Delete every bucket regardless of owner or generation.
    pub async fn clear_all(&self) -> SwResult<usize> {
        let names = self.bucket_names().await?;
        let mut count = 0;
        for name in &names {
            if self.delete_bucket(name).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Inventory of every bucket with its entry count.
    pub async fn report(&self) -> SwResult<Vec<BucketReport>> {
        let mut report = Vec::new();
        for name in self.bucket_names().await? {
            let entries = self.backend.entries(&name).await?.len();
            report.push(BucketReport {
                current: self.is_current(&name),
                name,
                entries,
            });
        }
        Ok(report)
    }
}
