//! Cache storage backends.
//!
//! The worker never touches a storage medium directly; it talks to a
//! [`CacheBackend`]. [`MemoryBackend`] keeps everything in process,
//! [`crate::disk::DiskBackend`] persists buckets as JSON documents.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwakit_common::{KitError, Result};
use pwakit_net::{Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

// ==================== Keys ====================

/// Identity of a cached request: method plus normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for `method` and `url`. The fragment never reaches the server, so
    /// it is not part of the identity.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key for a request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    /// Only GET responses are cacheable.
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET.as_str()
    }
}

// ==================== Entries ====================

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Response URL, if it came from the network.
    pub url: Option<String>,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, duplicates preserved.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Whether the original response was opaque.
    #[serde(default)]
    pub opaque: bool,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    /// Snapshot a response. The caller keeps the original.
    pub fn from_response(response: &Response) -> Self {
        Self {
            url: response.url.as_ref().map(|u| u.to_string()),
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: response.body().to_vec(),
            opaque: response.is_opaque(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let response_type = if self.opaque {
            ResponseType::Opaque
        } else {
            ResponseType::Basic
        };

        let response = match self.url.as_deref().and_then(|u| Url::parse(u).ok()) {
            Some(url) => Response::from_network(
                url,
                status,
                headers,
                response_type,
                self.body.clone().into(),
            ),
            None => {
                let mut response = Response::new(status, self.body.clone());
                response.headers = headers;
                response
            }
        };
        response.cached()
    }

    /// Approximate storage footprint.
    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(n, v)| n.len() + v.len())
                .sum::<usize>()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Backend ====================

/// Storage for named buckets of request/response pairs.
///
/// `put` is a pure overwrite of one key. Concurrent writers of the same key
/// race, and the last one wins.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the bucket if it does not exist.
    async fn open(&self, bucket: &str) -> Result<()>;

    /// Check if a bucket exists.
    async fn has(&self, bucket: &str) -> Result<bool>;

    /// Delete a bucket and all its entries.
    async fn delete(&self, bucket: &str) -> Result<bool>;

    /// All bucket names, sorted.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Store an entry, creating the bucket if needed.
    async fn put(&self, bucket: &str, key: &RequestKey, response: CachedResponse) -> Result<()>;

    /// Look up an entry.
    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

    /// Remove an entry.
    async fn remove(&self, bucket: &str, key: &RequestKey) -> Result<bool>;

    /// Keys stored in a bucket, sorted.
    async fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>>;
}

// ==================== Memory backend ====================

#[derive(Debug, Default)]
struct MemoryBucket {
    entries: HashMap<RequestKey, CachedResponse>,
    size: usize,
}

/// In-process backend with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: RwLock<HashMap<String, MemoryBucket>>,
    quota: Option<usize>,
}

impl MemoryBackend {
    /// Create an unbounded backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that rejects writes beyond `bytes` in total.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            quota: Some(bytes),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, bucket: &str) -> Result<()> {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn has(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.read().await.contains_key(bucket))
    }

    async fn delete(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.write().await.remove(bucket).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.buckets.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn put(&self, bucket: &str, key: &RequestKey, response: CachedResponse) -> Result<()> {
        let mut buckets = self.buckets.write().await;

        if let Some(limit) = self.quota {
            let used: usize = buckets.values().map(|b| b.size).sum();
            let replaced = buckets
                .get(bucket)
                .and_then(|b| b.entries.get(key))
                .map(|e| e.size())
                .unwrap_or(0);
            let needed = used - replaced + response.size();
            if needed > limit {
                return Err(KitError::QuotaExceeded {
                    used: needed,
                    limit,
                });
            }
        }

        let target = buckets.entry(bucket.to_string()).or_default();
        let size = response.size();
        if let Some(old) = target.entries.insert(key.clone(), response) {
            target.size = target.size.saturating_sub(old.size());
        }
        target.size += size;

        trace!(bucket, url = %key.url, size, "Stored entry");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
        Ok(self
            .buckets
            .read()
            .await
            .get(bucket)
            .and_then(|b| b.entries.get(key))
            .cloned())
    }

    async fn remove(&self, bucket: &str, key: &RequestKey) -> Result<bool> {
        let mut buckets = self.buckets.write().await;
        let Some(target) = buckets.get_mut(bucket) else {
            return Ok(false);
        };
        match target.entries.remove(key) {
            Some(old) => {
                target.size = target.size.saturating_sub(old.size());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>> {
        let buckets = self.buckets.read().await;
        let mut keys: Vec<RequestKey> = buckets
            .get(bucket)
            .map(|b| b.entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}
