//! Host-facing entry point: registration, generations and event routing.
//!
//! ```text
//! ServiceWorkerContainer (scope)
//!     │
//!     ├── Registration ── installing / waiting / active
//!     ├── ServiceWorkerGlobal (one per generation)
//!     │       ├── Router
//!     │       └── StrategyExecutor ── CacheStorage ── CacheBackend
//!     ├── Clients
//!     └── Notifications
//! ```

use std::sync::Arc;

use hashbrown::HashMap;
use pwakit_core::WorkerConfig;
use pwakit_net::Fetcher;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::cache::BucketReport;
use crate::clients::{Client, ClientMatchOptions, ClientType, Clients};
use crate::error::{ServiceWorkerError, SwResult};
use crate::event::ExtendableEvent;
use crate::lifecycle::{Registration, ServiceWorker, ServiceWorkerId, ServiceWorkerState};
use crate::message::WorkerMessage;
use crate::push::{Notification, Notifications};
use crate::router::Router;
use crate::storage::CacheBackend;
use crate::worker::{FetchEvent, FetchOutcome, ServiceWorkerGlobal, WorkerEvent};

/// Events for the host.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// A worker changed state.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        generation: String,
        new_state: ServiceWorkerState,
    },
    /// A new generation installed while an older one controls pages.
    UpdateFound {
        registration_scope: String,
        version: String,
    },
    /// A page came under a generation's control.
    ControllerChange {
        client_id: String,
        generation: String,
    },
    /// Display a notification.
    ShowNotification(Notification),
    /// Open a new window.
    OpenWindow { url: Url },
    /// Bring a window to the front.
    Focus { client_id: String },
}

/// State shared by the container and every worker generation.
pub(crate) struct Shared {
    pub(crate) scope: Url,
    pub(crate) backend: Arc<dyn CacheBackend>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) registration: RwLock<Registration>,
    pub(crate) clients: Clients,
    pub(crate) notifications: Notifications,
    pub(crate) event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl Shared {
    /// Emit a state change for each worker.
    pub(crate) fn announce(&self, workers: &[ServiceWorker]) {
        for worker in workers {
            debug!(
                worker = worker.id.raw(),
                generation = %worker.generation,
                state = ?worker.state,
                "Worker state changed"
            );
            let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
                registration_scope: self.scope.to_string(),
                worker_id: worker.id,
                generation: worker.generation.clone(),
                new_state: worker.state,
            });
        }
    }
}

/// Service worker container for one scope.
pub struct ServiceWorkerContainer {
    shared: Arc<Shared>,
    workers: RwLock<HashMap<ServiceWorkerId, Arc<ServiceWorkerGlobal>>>,
}

impl ServiceWorkerContainer {
    /// Create a container. Host events arrive on the returned receiver.
    pub fn new(
        scope: Url,
        backend: Arc<dyn CacheBackend>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Shared {
            registration: RwLock::new(Registration::new(scope.clone())),
            clients: Clients::new(scope.clone(), event_tx.clone()),
            notifications: Notifications::new(),
            scope,
            backend,
            fetcher,
            event_tx,
        };

        (
            Self {
                shared: Arc::new(shared),
                workers: RwLock::new(HashMap::new()),
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.shared.scope
    }

    pub fn clients(&self) -> &Clients {
        &self.shared.clients
    }

    pub fn notifications(&self) -> &Notifications {
        &self.shared.notifications
    }

    /// Register a generation with the default route table.
    pub async fn register(&self, config: WorkerConfig) -> SwResult<Arc<ServiceWorkerGlobal>> {
        let router = Router::from_config(&config)?;
        self.register_with_router(config, router).await
    }

    /// Register a generation: install it, then activate it when nothing
    /// holds it back.
    ///
    /// Registering the generation that is already active or waiting returns
    /// that worker without reinstalling.
    pub async fn register_with_router(
        &self,
        config: WorkerConfig,
        router: Router,
    ) -> SwResult<Arc<ServiceWorkerGlobal>> {
        config.validate()?;
        let scope = config.scope_url()?;
        if scope != self.shared.scope {
            return Err(ServiceWorkerError::StateError(format!(
                "config scope {} does not match registration scope {}",
                scope, self.shared.scope
            )));
        }

        if let Some(existing) = self.find_generation(&config.version).await {
            debug!(generation = %config.version, "Generation already registered");
            return Ok(existing);
        }

        let skip_waiting = config.skip_waiting;
        let worker = Arc::new(ServiceWorkerGlobal::new(
            config,
            router,
            Arc::clone(&self.shared),
        )?);
        info!(
            scope = %self.shared.scope,
            generation = worker.generation(),
            "Registering worker"
        );

        self.workers
            .write()
            .await
            .insert(worker.id(), Arc::clone(&worker));
        let displaced = self
            .shared
            .registration
            .write()
            .await
            .update(ServiceWorker::new(worker.id(), worker.generation()));
        self.shared.announce(&displaced);

        if let Err(e) = worker.dispatch(WorkerEvent::Install).await {
            self.prune().await;
            return Err(e);
        }

        let has_controller = self.shared.registration.read().await.controller().is_some();
        if skip_waiting || worker.skip_waiting_requested() || !has_controller {
            worker.dispatch(WorkerEvent::Activate).await?;
        }

        self.prune().await;
        Ok(worker)
    }

    async fn find_generation(&self, generation: &str) -> Option<Arc<ServiceWorkerGlobal>> {
        let registration = self.shared.registration.read().await;
        let id = [&registration.waiting, &registration.active]
            .into_iter()
            .flatten()
            .find(|w| w.generation == generation)
            .map(|w| w.id)?;
        self.workers.read().await.get(&id).cloned()
    }

    /// Drop workers that left every registration slot.
    async fn prune(&self) {
        let registration = self.shared.registration.read().await;
        self.workers
            .write()
            .await
            .retain(|id, _| registration.state_of(*id) != ServiceWorkerState::Redundant);
    }

    async fn slot(&self, pick: fn(&Registration) -> Option<&ServiceWorker>) -> Option<Arc<ServiceWorkerGlobal>> {
        let id = pick(&*self.shared.registration.read().await).map(|w| w.id)?;
        self.workers.read().await.get(&id).cloned()
    }

    /// Active worker.
    pub async fn controller(&self) -> Option<Arc<ServiceWorkerGlobal>> {
        self.slot(|r| r.active.as_ref()).await
    }

    /// Installed worker waiting to activate.
    pub async fn waiting(&self) -> Option<Arc<ServiceWorkerGlobal>> {
        self.slot(|r| r.waiting.as_ref()).await
    }

    /// Worker by ID, while it is registered.
    pub async fn worker(&self, id: ServiceWorkerId) -> Option<Arc<ServiceWorkerGlobal>> {
        self.workers.read().await.get(&id).cloned()
    }

    /// Lifecycle state of a worker.
    pub async fn state(&self, id: ServiceWorkerId) -> ServiceWorkerState {
        self.shared.registration.read().await.state_of(id)
    }

    /// Activate the waiting worker, if any.
    pub async fn activate_waiting(&self) -> SwResult<bool> {
        let Some(worker) = self.waiting().await else {
            return Ok(false);
        };
        worker.dispatch(WorkerEvent::Activate).await?;
        self.prune().await;
        Ok(true)
    }

    /// Register an open page. In-scope pages are controlled by the active
    /// generation, if there is one.
    pub async fn connect(
        &self,
        url: Url,
        client_type: ClientType,
    ) -> (Client, mpsc::UnboundedReceiver<WorkerMessage>) {
        let controller = if self.shared.clients.in_scope(&url) {
            self.shared
                .registration
                .read()
                .await
                .controller()
                .map(|w| w.generation.clone())
        } else {
            None
        };
        self.shared.clients.attach(url, client_type, controller).await
    }

    /// Forget a closed page. When the last controlled page closes, a waiting
    /// generation activates.
    pub async fn disconnect(&self, client_id: &str) -> SwResult<Option<Client>> {
        let removed = self.shared.clients.remove(client_id).await;

        let still_controlled = !self
            .shared
            .clients
            .match_all(&ClientMatchOptions {
                include_uncontrolled: false,
                client_type: ClientType::All,
            })
            .await
            .is_empty();
        if !still_controlled {
            self.activate_waiting().await?;
        }
        Ok(removed)
    }

    /// Hand a request to the active worker.
    ///
    /// Without an active worker nothing is intercepted. The returned event
    /// carries background work; the host keeps running until it settles.
    pub async fn handle_fetch(&self, event: FetchEvent) -> (FetchOutcome, ExtendableEvent) {
        let lifetime = ExtendableEvent::new();
        let outcome = match self.controller().await {
            Some(worker) => worker.handle_fetch(&event, &lifetime).await,
            None => FetchOutcome::Passthrough,
        };
        (outcome, lifetime)
    }

    /// Deliver a message from a page to a worker.
    pub async fn post_message(
        &self,
        target: ServiceWorkerId,
        source: Option<&str>,
        data: Value,
    ) -> SwResult<()> {
        let worker = self
            .worker(target)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker {}", target.raw())))?;
        let dispatched = worker
            .dispatch(WorkerEvent::Message {
                source: source.map(str::to_string),
                data,
            })
            .await?;
        dispatched.lifetime.settled().await;
        self.prune().await;
        Ok(())
    }

    /// Deliver a push message to the active worker.
    pub async fn push(&self, data: &[u8]) -> SwResult<Notification> {
        let worker = self.require_controller().await?;
        worker.handle_push(data).await
    }

    /// Deliver a notification click to the active worker.
    pub async fn notification_click(&self, notification_id: u64) -> SwResult<()> {
        let worker = self.require_controller().await?;
        worker.handle_notification_click(notification_id).await
    }

    /// Inventory of every cache bucket.
    pub async fn report(&self) -> SwResult<Vec<BucketReport>> {
        let worker = self.require_controller().await?;
        worker.caches().report().await
    }

    async fn require_controller(&self) -> SwResult<Arc<ServiceWorkerGlobal>> {
        self.controller()
            .await
            .ok_or_else(|| ServiceWorkerError::StateError("no active worker".to_string()))
    }

    /// Drop every worker. Cache buckets are left in place.
    pub async fn unregister(&self) -> bool {
        let removed = self.shared.registration.write().await.unregister();
        self.shared.announce(&removed);
        self.workers.write().await.clear();
        !removed.is_empty()
    }
}
