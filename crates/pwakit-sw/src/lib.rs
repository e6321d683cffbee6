//! # PWAKit Service Worker
//!
//! Offline caching engine for a Progressive Web App, shaped after the
//! service worker model.
//!
//! ## Features
//!
//! - **Versioned caches**: `static`, `dynamic` and `offline` buckets per
//!   generation; stale generations are deleted on activation
//! - **Routing**: ordered first-match route table from configuration
//! - **Strategies**: cache-first, network-first, stale-while-revalidate and
//!   network-only, with background revalidation
//! - **Offline fallback**: cached offline document or a synthesized response;
//!   the fetch handler always answers
//! - **Lifecycle**: install with precache and retries, skip-waiting, activate
//!   with client claim and version broadcast
//! - **Messaging**: `SKIP_WAITING`, `CLEAR_CACHE`, `GET_VERSION`
//! - **Push**: notifications from push payloads, click to focus or open
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── Registration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     │
//!     └── ServiceWorkerGlobal (per generation)
//!             ├── Router ── Route → Strategy
//!             ├── StrategyExecutor ── OfflineFallback
//!             └── CacheStorage
//!                     └── CacheBackend (memory / disk)
//!                             └── RequestKey → CachedResponse
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pwakit_core::WorkerConfig;
//! use pwakit_net::{Request, MockFetcher};
//! use pwakit_sw::{FetchEvent, MemoryBackend, ServiceWorkerContainer};
//!
//! # async fn run() -> pwakit_sw::SwResult<()> {
//! let config = WorkerConfig::default();
//! let (container, _events) = ServiceWorkerContainer::new(
//!     config.scope_url()?,
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(MockFetcher::new()),
//! );
//! container.register(config).await?;
//!
//! let request = Request::parse("http://localhost/app.js")?;
//! let (outcome, lifetime) = container.handle_fetch(FetchEvent::new(request)).await;
//! lifetime.settled().await;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clients;
pub mod container;
pub mod disk;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod message;
pub mod offline;
pub mod push;
pub mod router;
pub mod storage;
pub mod strategy;
pub mod worker;

pub use cache::{Bucket, BucketPurpose, BucketReport, CacheStorage};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use container::{ServiceWorkerContainer, ServiceWorkerEvent};
pub use disk::DiskBackend;
pub use error::{ServiceWorkerError, SwResult};
pub use event::ExtendableEvent;
pub use lifecycle::{
    PrecacheReport, Registration, ServiceWorker, ServiceWorkerId, ServiceWorkerState,
};
pub use message::{ClientMessage, WorkerMessage};
pub use offline::{FallbackKind, OfflineFallback};
pub use push::{Notification, Notifications, PushPayload};
pub use router::{Route, RouteDecision, RouteMatcher, Router, Strategy};
pub use storage::{CacheBackend, CachedResponse, MemoryBackend, RequestKey};
pub use strategy::{is_cacheable, StrategyExecutor};
pub use worker::{
    ActivationReport, Dispatched, EventKind, EventResult, FetchEvent, FetchOutcome,
    ServiceWorkerGlobal, WorkerEvent,
};
