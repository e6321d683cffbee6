//! Persistent cache backend.
//!
//! Each bucket is one JSON document under the root directory, named after the
//! base64url encoding of the bucket name:
//!
//! ```text
//! {root}/
//!     aG1zaS1zdGF0aWMtdjEuMi4w.json   { "name": "hmsi-static-v1.2.0", "entries": [[key, response], ...] }
//!     aG1zaS1keW5hbWljLXYxLjIuMA.json
//! ```
//!
//! Bodies are base64 encoded. Writes go to a temporary file and are renamed
//! into place, so a crash never leaves a half-written bucket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use pwakit_common::{KitError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::storage::{CacheBackend, CachedResponse, RequestKey};

#[derive(Debug, Default, Serialize, Deserialize)]
struct BucketFile {
    name: String,
    entries: Vec<(RequestKey, CachedResponse)>,
}

/// Directory-backed [`CacheBackend`].
#[derive(Debug)]
pub struct DiskBackend {
    root: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl DiskBackend {
    /// Open (creating if needed) a backend rooted at `root`.
    pub async fn open_dir(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened disk cache backend");
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File for `bucket`. Names are base64url encoded, so distinct buckets
    /// never share a file whatever characters the generation contains.
    fn path_for(&self, bucket: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(bucket)))
    }

    async fn read_bucket(&self, bucket: &str) -> Result<Option<BucketFile>> {
        let path = self.path_for(bucket);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: BucketFile = serde_json::from_slice(&bytes).map_err(|e| {
                    KitError::storage_with_source(format!("corrupt bucket {}", path.display()), e)
                })?;
                Ok(Some(file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_bucket(&self, file: &BucketFile) -> Result<()> {
        let path = self.path_for(&file.name);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec(file).context("serializing bucket")?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn open(&self, bucket: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.read_bucket(bucket).await?.is_none() {
            self.write_bucket(&BucketFile {
                name: bucket.to_string(),
                entries: Vec::new(),
            })
            .await?;
        }
        Ok(())
    }

    async fn has(&self, bucket: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(bucket)).await?)
    }

    async fn delete(&self, bucket: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(self.path_for(bucket)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<BucketFile>(&bytes) {
                    Ok(file) => names.push(file.name),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable bucket"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable bucket"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn put(&self, bucket: &str, key: &RequestKey, response: CachedResponse) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_bucket(bucket).await?.unwrap_or_else(|| BucketFile {
            name: bucket.to_string(),
            entries: Vec::new(),
        });

        match file.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = response,
            None => file.entries.push((key.clone(), response)),
        }

        self.write_bucket(&file).await
    }

    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
        Ok(self.read_bucket(bucket).await?.and_then(|file| {
            file.entries
                .into_iter()
                .find(|(k, _)| k == key)
                .map(|(_, response)| response)
        }))
    }

    async fn remove(&self, bucket: &str, key: &RequestKey) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let Some(mut file) = self.read_bucket(bucket).await? else {
            return Ok(false);
        };
        let before = file.entries.len();
        file.entries.retain(|(k, _)| k != key);
        if file.entries.len() == before {
            return Ok(false);
        }
        self.write_bucket(&file).await?;
        Ok(true)
    }

    async fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>> {
        let mut keys: Vec<RequestKey> = self
            .read_bucket(bucket)
            .await?
            .map(|file| file.entries.into_iter().map(|(k, _)| k).collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use pwakit_net::Response;
    use url::Url;

    fn key(url: &str) -> RequestKey {
        RequestKey::get(&Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_disk_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("https://app.test/logo.png");
        let bytes: Vec<u8> = vec![0x89, b'P', b'N', b'G', 0, 255];

        {
            let backend = DiskBackend::open_dir(dir.path()).await.unwrap();
            let response = Response::new(StatusCode::OK, bytes.clone());
            backend
                .put("hmsi-static-v1", &k, CachedResponse::from_response(&response))
                .await
                .unwrap();
        }

        let backend = DiskBackend::open_dir(dir.path()).await.unwrap();
        assert_eq!(backend.keys().await.unwrap(), vec!["hmsi-static-v1"]);
        let stored = backend.get("hmsi-static-v1", &k).await.unwrap().unwrap();
        assert_eq!(stored.body, bytes);
    }

    #[tokio::test]
    async fn test_disk_backend_delete_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::open_dir(dir.path()).await.unwrap();

        backend.open("a/b").await.unwrap();
        assert!(backend.has("a/b").await.unwrap());
        assert_eq!(backend.keys().await.unwrap(), vec!["a/b"]);

        assert!(backend.delete("a/b").await.unwrap());
        assert!(!backend.has("a/b").await.unwrap());
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disk_backend_keeps_similar_names_apart() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::open_dir(dir.path()).await.unwrap();
        let k = key("https://app.test/app.js");
        let plus = "hmsi-static-v1+beta";
        let underscore = "hmsi-static-v1_beta";

        let response = Response::new(StatusCode::OK, "beta");
        backend
            .put(plus, &k, CachedResponse::from_response(&response))
            .await
            .unwrap();
        backend.open(underscore).await.unwrap();

        assert_eq!(backend.keys().await.unwrap(), vec![plus, underscore]);
        assert!(backend.get(underscore, &k).await.unwrap().is_none());

        assert!(backend.delete(underscore).await.unwrap());
        assert!(backend.has(plus).await.unwrap());
        assert_eq!(backend.get(plus, &k).await.unwrap().unwrap().body, b"beta");
    }

    #[tokio::test]
    async fn test_disk_backend_overwrite_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::open_dir(dir.path()).await.unwrap();
        let k = key("https://app.test/data");

        for body in ["one", "two"] {
            let response = Response::new(StatusCode::OK, body);
            backend
                .put("dyn", &k, CachedResponse::from_response(&response))
                .await
                .unwrap();
        }

        assert_eq!(backend.entries("dyn").await.unwrap(), vec![k.clone()]);
        assert_eq!(backend.get("dyn", &k).await.unwrap().unwrap().body, b"two");
        assert!(backend.remove("dyn", &k).await.unwrap());
        assert!(!backend.remove("dyn", &k).await.unwrap());
    }
}
