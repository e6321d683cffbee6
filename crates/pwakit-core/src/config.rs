//! Worker configuration

use pwakit_common::{KitError, Result, RetryConfig};
use pwakit_net::UrlPattern;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Strategy used for page navigations and HTML requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NavigationStrategy {
    /// Serve the cached page at once, refresh it in the background.
    #[default]
    StaleWhileRevalidate,
    /// Always try the network first.
    NetworkFirst,
}

/// Retry policy for individual precache adds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecacheRetry {
    /// Attempts per asset (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
}

impl Default for PrecacheRetry {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 100,
        }
    }
}

impl From<PrecacheRetry> for RetryConfig {
    fn from(retry: PrecacheRetry) -> Self {
        RetryConfig {
            max_attempts: retry.max_attempts.max(1),
            initial_delay: Duration::from_millis(retry.initial_delay_ms),
            jitter: false,
            ..RetryConfig::default()
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Display name, used as the default notification title
    pub app_name: String,

    /// Prefix shared by every bucket this worker owns
    pub cache_prefix: String,

    /// Cache generation identifier
    pub version: String,

    /// Worker scope; relative URLs below are resolved against it
    pub scope: String,

    /// Precache manifest, in install order
    pub precache: Vec<String>,

    /// Document served to navigations when offline
    pub offline_document: Option<String>,

    /// Regular expressions for URLs that must never be cached
    pub never_cache: Vec<String>,

    /// File extensions served cache-first
    pub asset_extensions: Vec<String>,

    /// Strategy for navigations and HTML requests
    pub navigation_strategy: NavigationStrategy,

    /// Activate right after install instead of waiting for old clients to close
    pub skip_waiting: bool,

    /// Take control of open clients on activation
    pub claim_clients: bool,

    /// Post `SW_ACTIVATED` to window clients after activation
    pub broadcast_activation: bool,

    /// Retry policy for single-asset precache fallback
    pub precache_retry: PrecacheRetry,

    /// Icon for push notifications without one
    pub notification_icon: Option<String>,

    /// Directory for the persistent cache backend
    pub cache_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_name: "DEVICE HMSI".to_string(),
            cache_prefix: "hmsi".to_string(),
            version: "v1.2.0".to_string(),
            scope: "http://localhost/".to_string(),
            precache: [
                "./",
                "./index.html",
                "./manifest.json",
                "./offline.html",
                "./icons/icon-192x192.png",
                "./icons/icon-512x512.png",
                "./icons/icon-maskable-192x192.png",
                "./icons/icon-maskable-512x512.png",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            offline_document: Some("./offline.html".to_string()),
            never_cache: [
                r"script\.google\.com",
                r"googleapis\.com",
                r"chrome-extension://",
                r"accounts\.google\.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            asset_extensions: [
                "js", "mjs", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico",
                "woff", "woff2", "ttf", "otf", "eot",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            navigation_strategy: NavigationStrategy::default(),
            skip_waiting: true,
            claim_clients: true,
            broadcast_activation: true,
            precache_retry: PrecacheRetry::default(),
            notification_icon: Some("./icons/icon-192x192.png".to_string()),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pwakit"),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            KitError::config_with_source(format!("invalid config {}", path.display()), e)
        })?;
        config.validate()?;
        info!(path = %path.display(), version = %config.version, "Loaded worker config");
        Ok(config)
    }

    /// Save configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| KitError::config_with_source("failed to serialize config", e))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Check the fields that the worker cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(KitError::config("version must not be empty"));
        }
        if self.cache_prefix.trim().is_empty() {
            return Err(KitError::config("cache_prefix must not be empty"));
        }
        self.scope_url()?;
        self.never_cache_patterns()?;
        Ok(())
    }

    /// Parsed worker scope.
    pub fn scope_url(&self) -> Result<Url> {
        Url::parse(&self.scope)
            .map_err(|e| KitError::config_with_source(format!("invalid scope '{}'", self.scope), e))
    }

    /// Resolve a possibly relative URL against the scope.
    pub fn resolve(&self, url: &str) -> Result<Url> {
        self.scope_url()?
            .join(url)
            .map_err(|e| KitError::config_with_source(format!("invalid URL '{}'", url), e))
    }

    /// Compiled never-cache patterns.
    pub fn never_cache_patterns(&self) -> Result<Vec<UrlPattern>> {
        self.never_cache
            .iter()
            .map(|p| UrlPattern::regex(p).map_err(|e| KitError::config_with_source("never_cache", e)))
            .collect()
    }

    /// Static-asset extension patterns.
    pub fn asset_patterns(&self) -> Vec<UrlPattern> {
        self.asset_extensions
            .iter()
            .map(|ext| UrlPattern::extension(ext))
            .collect()
    }

    /// Resolved offline document URL, if configured.
    ///
    /// A document that is cross-origin or matches a never-cache pattern is
    /// ignored, like the same entry in the precache manifest.
    pub fn offline_url(&self) -> Result<Option<Url>> {
        let Some(doc) = self.offline_document.as_deref() else {
            return Ok(None);
        };
        let url = self.resolve(doc)?;
        if is_own_asset(&url, &self.scope_url()?, &self.never_cache_patterns()?) {
            Ok(Some(url))
        } else {
            Ok(None)
        }
    }

    /// Resolved precache manifest.
    ///
    /// Entries that are cross-origin or match a never-cache pattern are
    /// dropped: the static bucket only holds this app's own assets.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        let scope = self.scope_url()?;
        let never_cache = self.never_cache_patterns()?;
        let mut urls = Vec::with_capacity(self.precache.len());

        for entry in &self.precache {
            let url = self.resolve(entry)?;
            if is_own_asset(&url, &scope, &never_cache) && !urls.contains(&url) {
                urls.push(url);
            }
        }

        Ok(urls)
    }
}

fn is_own_asset(url: &Url, scope: &Url, never_cache: &[UrlPattern]) -> bool {
    if url.origin() != scope.origin() {
        warn!(%url, "Dropping cross-origin cache entry");
        return false;
    }
    if pwakit_net::matches_any(never_cache, url) {
        warn!(%url, "Dropping never-cache cache entry");
        return false;
    }
    true
}
