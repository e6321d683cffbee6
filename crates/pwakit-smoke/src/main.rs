//! PWAKit Smoke Harness
//!
//! Drives one worker generation against the live network and a disk cache,
//! then prints a JSON report: what was precached, how each URL was served,
//! and the resulting cache inventory.
//!
//! ## Usage
//!
//! ```bash
//! # Write a config with the defaults
//! pwakit-smoke init-config --output worker.json
//!
//! # Install a generation and fetch a few URLs
//! pwakit-smoke run --config worker.json https://example.com/ https://example.com/app.js
//!
//! # Same, with the network treated as unreachable
//! pwakit-smoke run --config worker.json --offline https://example.com/
//!
//! # List what is on disk
//! pwakit-smoke inventory --cache-dir ~/.cache/pwakit
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pwakit_common::{init_logging, with_timeout, LogConfig, LogFormat};
use pwakit_core::WorkerConfig;
use pwakit_net::{Fetcher, LoaderConfig, MockFetcher, Request, ResourceLoader};
use pwakit_sw::{
    BucketPurpose, CacheBackend, DiskBackend, FetchEvent, FetchOutcome, ServiceWorkerContainer,
};
use serde_json::json;
use tracing::{info, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "pwakit-smoke")]
#[command(about = "Smoke harness for the PWAKit caching worker")]
struct Cli {
    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default worker config
    InitConfig {
        /// Output path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Install a generation and fetch URLs through it
    Run {
        /// Worker config (JSON); defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Serve every request as if the network were down
        #[arg(long)]
        offline: bool,
        /// Per-request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
        /// Write the report here as well as to stdout
        #[arg(long)]
        report: Option<PathBuf>,
        /// URLs to fetch, absolute or relative to the scope
        urls: Vec<String>,
    },

    /// List cache buckets on disk
    Inventory {
        /// Cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

/// Performance timing collector for tracking operation durations.
struct PerfTiming {
    timings: RefCell<HashMap<&'static str, Vec<Duration>>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: RefCell::new(HashMap::new()),
        }
    }

    fn record(&self, operation: &'static str, duration: Duration) {
        self.timings
            .borrow_mut()
            .entry(operation)
            .or_default()
            .push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let timings = self.timings.borrow();
        let mut summary = serde_json::Map::new();

        for (op, durations) in timings.iter() {
            if durations.is_empty() {
                continue;
            }
            let count = durations.len();
            let total_ms: f64 = durations.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
            let max_ms = durations
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .fold(0.0, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": (total_ms * 100.0).round() / 100.0,
                    "avg_ms": (total_ms / count as f64 * 100.0).round() / 100.0,
                    "max_ms": (max_ms * 100.0).round() / 100.0,
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig::default().with_format(cli.log_format))?;

    match cli.command {
        Commands::InitConfig { output } => {
            WorkerConfig::default()
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Config written to: {}", output.display());
        }

        Commands::Run {
            config,
            cache_dir,
            offline,
            timeout,
            report,
            urls,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = cache_dir {
                config.cache_dir = dir;
            }
            let result = run(config, offline, Duration::from_secs(timeout), &urls).await?;
            let text = serde_json::to_string_pretty(&result)?;
            if let Some(path) = report {
                std::fs::write(&path, &text)
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(path = %path.display(), "Report written");
            }
            println!("{}", text);
        }

        Commands::Inventory { cache_dir } => {
            let dir = cache_dir.unwrap_or_else(|| WorkerConfig::default().cache_dir);
            let listing = inventory(&dir).await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    match path {
        Some(path) => {
            WorkerConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            let config = WorkerConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn run(
    config: WorkerConfig,
    offline: bool,
    timeout: Duration,
    urls: &[String],
) -> Result<serde_json::Value> {
    let perf = PerfTiming::new();
    let backend: Arc<dyn CacheBackend> = Arc::new(
        DiskBackend::open_dir(&config.cache_dir)
            .await
            .context("opening cache directory")?,
    );
    let fetcher: Arc<dyn Fetcher> = if offline {
        let mock = MockFetcher::new();
        mock.set_online(false);
        Arc::new(mock)
    } else {
        Arc::new(ResourceLoader::new(LoaderConfig {
            default_timeout: timeout,
            ..LoaderConfig::default()
        })?)
    };

    let scope = config.scope_url()?;
    let (container, _events) = ServiceWorkerContainer::new(scope.clone(), backend, fetcher);

    let start = Instant::now();
    let worker = container.register(config).await?;
    perf.record("register", start.elapsed());

    let precached = worker
        .caches()
        .open_bucket(BucketPurpose::Static)
        .await?
        .keys()
        .await?
        .into_iter()
        .map(|k| k.url)
        .collect::<Vec<_>>();

    let mut fetches = Vec::with_capacity(urls.len());
    for raw in urls {
        let url = scope
            .join(raw)
            .with_context(|| format!("invalid URL '{}'", raw))?;
        fetches.push(fetch_one(&container, &perf, url, timeout).await);
    }

    Ok(json!({
        "generation": worker.generation(),
        "state": format!("{:?}", worker.state().await),
        "precached": precached,
        "fetches": fetches,
        "inventory": container.report().await?,
        "perf": perf.summary(),
    }))
}

async fn fetch_one(
    container: &ServiceWorkerContainer,
    perf: &PerfTiming,
    url: Url,
    timeout: Duration,
) -> serde_json::Value {
    let request = if url.path().ends_with('/') || url.path().ends_with(".html") {
        Request::navigate(url.clone())
    } else {
        Request::get(url.clone())
    };

    let start = Instant::now();
    let result = with_timeout(timeout, || async {
        let (outcome, lifetime) = container.handle_fetch(FetchEvent::new(request)).await;
        lifetime.settled().await;
        outcome
    })
    .await;
    perf.record("fetch", start.elapsed());

    match result {
        Ok(FetchOutcome::Respond(response)) => json!({
            "url": url.as_str(),
            "status": response.status.as_u16(),
            "from_cache": response.from_cache,
            "type": format!("{:?}", response.response_type),
            "bytes": response.body().len(),
        }),
        Ok(FetchOutcome::Passthrough) => json!({
            "url": url.as_str(),
            "passthrough": true,
        }),
        Err(e) => {
            warn!(%url, error = %e, "Fetch timed out");
            json!({ "url": url.as_str(), "error": e.to_string() })
        }
    }
}

async fn inventory(dir: &Path) -> Result<serde_json::Value> {
    let backend = DiskBackend::open_dir(dir)
        .await
        .with_context(|| format!("opening {}", dir.display()))?;

    let mut buckets = Vec::new();
    for name in backend.keys().await? {
        let entries = backend.entries(&name).await?;
        buckets.push(json!({
            "name": name,
            "entries": entries.len(),
            "urls": entries.into_iter().map(|k| k.url).collect::<Vec<_>>(),
        }));
    }

    Ok(json!({
        "cache_dir": dir.display().to_string(),
        "buckets": buckets,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_summary() {
        let perf = PerfTiming::new();
        perf.record("fetch", Duration::from_millis(10));
        perf.record("fetch", Duration::from_millis(30));

        let summary = perf.summary();
        assert_eq!(summary["fetch"]["count"], 2);
        assert_eq!(summary["fetch"]["avg_ms"], 20.0);
        assert_eq!(summary["fetch"]["max_ms"], 30.0);
    }

    #[tokio::test]
    async fn test_offline_run_against_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let report = run(config, true, Duration::from_secs(5), &["./".to_string()])
            .await
            .unwrap();

        assert_eq!(report["generation"], "v1.2.0");
        assert_eq!(report["fetches"][0]["status"], 503);
        assert_eq!(report["fetches"][0]["from_cache"], false);

        let listing = inventory(dir.path()).await.unwrap();
        assert!(listing["buckets"]
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b["name"] == "hmsi-static-v1.2.0"));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from([
            "pwakit-smoke",
            "run",
            "--offline",
            "--timeout",
            "5",
            "https://example.com/",
        ]);
        match cli.command {
            Commands::Run {
                offline,
                timeout,
                urls,
                ..
            } => {
                assert!(offline);
                assert_eq!(timeout, 5);
                assert_eq!(urls, vec!["https://example.com/"]);
            }
            _ => panic!("expected run"),
        }
    }
}
