//! The worker global scope: one cache generation and its event handlers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pwakit_common::RetryConfig;
use pwakit_core::WorkerConfig;
use pwakit_net::{Request, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{ClientMatchOptions, ClientType};
use crate::container::{ServiceWorkerEvent, Shared};
use crate::error::{ServiceWorkerError, SwResult};
use crate::event::ExtendableEvent;
use crate::lifecycle::{self, PrecacheReport, ServiceWorkerId, ServiceWorkerState};
use crate::message::{ClientMessage, WorkerMessage};
use crate::offline::OfflineFallback;
use crate::push::{Notification, PushPayload};
use crate::router::{RouteDecision, Router};
use crate::strategy::StrategyExecutor;

// ==================== Events ====================

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    /// Page that issued the request.
    pub client_id: Option<String>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    pub fn from_client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }
}

/// Result of a fetch event.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The worker answered.
    Respond(Response),
    /// Not intercepted; the host performs the request itself.
    Passthrough,
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::Passthrough => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::Passthrough => None,
        }
    }
}

/// Events a worker handles.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Message {
        source: Option<String>,
        data: Value,
    },
    Push {
        data: Vec<u8>,
    },
    NotificationClick {
        notification_id: u64,
    },
}

/// Discriminant of [`WorkerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
    Push,
    NotificationClick,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Install => "install",
            EventKind::Activate => "activate",
            EventKind::Fetch => "fetch",
            EventKind::Message => "message",
            EventKind::Push => "push",
            EventKind::NotificationClick => "notificationclick",
        };
        f.write_str(name)
    }
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Message { .. } => EventKind::Message,
            WorkerEvent::Push { .. } => EventKind::Push,
            WorkerEvent::NotificationClick { .. } => EventKind::NotificationClick,
        }
    }
}

/// Outcome of activating a generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    /// Stale buckets deleted.
    pub deleted: Vec<String>,
    /// Clients that came under this generation's control.
    pub claimed: Vec<String>,
}

/// What a handler produced.
#[derive(Debug, Clone)]
pub enum EventResult {
    Installed(PrecacheReport),
    Activated(ActivationReport),
    Fetched(FetchOutcome),
    Notified(Notification),
    Handled,
}

/// A handled event and its extended lifetime.
#[derive(Debug)]
pub struct Dispatched {
    pub result: EventResult,
    pub lifetime: ExtendableEvent,
}

// ==================== Worker ====================

/// One worker generation.
pub struct ServiceWorkerGlobal {
    id: ServiceWorkerId,
    config: WorkerConfig,
    caches: CacheStorage,
    router: Router,
    executor: StrategyExecutor,
    manifest: Vec<Url>,
    offline_document: Option<Url>,
    skip_waiting: AtomicBool,
    shared: Arc<Shared>,
}

impl fmt::Debug for ServiceWorkerGlobal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorkerGlobal")
            .field("id", &self.id)
            .field("generation", &self.config.version)
            .finish_non_exhaustive()
    }
}

impl ServiceWorkerGlobal {
    pub(crate) fn new(config: WorkerConfig, router: Router, shared: Arc<Shared>) -> SwResult<Self> {
        let caches = CacheStorage::new(
            Arc::clone(&shared.backend),
            &config.cache_prefix,
            &config.version,
        );
        let manifest = config.precache_urls()?;
        let offline_document = config.offline_url()?;
        let offline = OfflineFallback::new(caches.clone(), offline_document.clone());
        let executor = StrategyExecutor::new(caches.clone(), Arc::clone(&shared.fetcher), offline);

        Ok(Self {
            id: ServiceWorkerId::new(),
            config,
            caches,
            router,
            executor,
            manifest,
            offline_document,
            skip_waiting: AtomicBool::new(false),
            shared,
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    /// Cache generation this worker serves.
    pub fn generation(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Resolved precache manifest.
    pub fn manifest(&self) -> &[Url] {
        &self.manifest
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ServiceWorkerState {
        self.shared.registration.read().await.state_of(self.id)
    }

    /// Whether activation was requested before install finished.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Dispatch an event to its handler.
    pub async fn dispatch(&self, event: WorkerEvent) -> SwResult<Dispatched> {
        debug!(worker = self.id.raw(), event = %event.kind(), "Dispatching event");
        let lifetime = ExtendableEvent::new();

        let result = match event {
            WorkerEvent::Install => EventResult::Installed(self.install().await?),
            WorkerEvent::Activate => EventResult::Activated(self.activate().await?),
            WorkerEvent::Fetch(fetch) => {
                EventResult::Fetched(self.handle_fetch(&fetch, &lifetime).await)
            }
            WorkerEvent::Message { source, data } => {
                self.handle_message(source.as_deref(), &data).await?;
                EventResult::Handled
            }
            WorkerEvent::Push { data } => EventResult::Notified(self.handle_push(&data).await?),
            WorkerEvent::NotificationClick { notification_id } => {
                self.handle_notification_click(notification_id).await?;
                EventResult::Handled
            }
        };

        Ok(Dispatched { result, lifetime })
    }

    // ==================== Lifecycle ====================

    /// Precache the manifest and move to the waiting slot.
    ///
    /// Resolves after every precache attempt has completed. Individual asset
    /// failures are reported, not returned.
    pub async fn install(&self) -> SwResult<PrecacheReport> {
        let worker = self.shared.registration.write().await.begin_install(self.id)?;
        self.shared.announce(&[worker]);
        info!(generation = self.generation(), assets = self.manifest.len(), "Installing");

        let retry: RetryConfig = self.config.precache_retry.into();
        let result = lifecycle::precache(
            &self.caches,
            self.shared.fetcher.as_ref(),
            &self.manifest,
            self.offline_document.as_ref(),
            &retry,
        )
        .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!(generation = self.generation(), error = %e, "Install failed");
                if let Some(worker) = self.shared.registration.write().await.install_failed(self.id) {
                    self.shared.announce(&[worker]);
                }
                return Err(e);
            }
        };

        let (changed, has_controller) = {
            let mut registration = self.shared.registration.write().await;
            let changed = registration.install_complete(self.id)?;
            (changed, registration.controller().is_some())
        };
        self.shared.announce(&changed);

        if has_controller {
            info!(generation = self.generation(), "Update installed and waiting");
            let _ = self.shared.event_tx.send(ServiceWorkerEvent::UpdateFound {
                registration_scope: self.shared.scope.to_string(),
                version: self.generation().to_string(),
            });
        }

        Ok(report)
    }

    /// Delete stale generations, claim clients and announce the new version.
    pub async fn activate(&self) -> SwResult<ActivationReport> {
        let changed = self
            .shared
            .registration
            .write()
            .await
            .begin_activation(self.id)?;
        self.shared.announce(&changed);
        info!(generation = self.generation(), "Activating");

        let deleted = match self.caches.delete_stale().await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(error = %e, "Stale cache cleanup failed");
                Vec::new()
            }
        };

        let claimed = if self.config.claim_clients {
            self.shared.clients.claim(self.generation()).await
        } else {
            Vec::new()
        };

        if let Some(worker) = self
            .shared
            .registration
            .write()
            .await
            .finish_activation(self.id)
        {
            self.shared.announce(&[worker]);
        }

        if self.config.broadcast_activation {
            self.broadcast(WorkerMessage::SwActivated {
                version: self.generation().to_string(),
            })
            .await;
        }

        info!(
            generation = self.generation(),
            deleted = deleted.len(),
            claimed = claimed.len(),
            "Activated"
        );
        Ok(ActivationReport { deleted, claimed })
    }

    /// Activate without waiting for old clients to close.
    ///
    /// Requested during install, activation happens as soon as install
    /// completes.
    pub async fn skip_waiting(&self) -> SwResult<()> {
        self.skip_waiting.store(true, Ordering::SeqCst);
        match self.state().await {
            ServiceWorkerState::Installed => self.activate().await.map(|_| ()),
            ServiceWorkerState::Redundant => Err(ServiceWorkerError::StateError(
                "Cannot skip waiting on a redundant worker".to_string(),
            )),
            _ => Ok(()),
        }
    }

    // ==================== Functional events ====================

    /// Route and answer an intercepted request. Never fails.
    pub async fn handle_fetch(&self, event: &FetchEvent, lifetime: &ExtendableEvent) -> FetchOutcome {
        match self.router.classify(&event.request) {
            RouteDecision::Passthrough => FetchOutcome::Passthrough,
            RouteDecision::Handle {
                route,
                strategy,
                fallback,
            } => {
                debug!(
                    url = %event.request.url,
                    route = %route,
                    %strategy,
                    client_id = event.client_id.as_deref().unwrap_or("-"),
                    "Handling fetch"
                );
                let response = self
                    .executor
                    .execute(&event.request, strategy, fallback, lifetime)
                    .await;
                FetchOutcome::Respond(response)
            }
        }
    }

    /// Handle a client message. Unknown messages are ignored.
    pub async fn handle_message(&self, source: Option<&str>, data: &Value) -> SwResult<()> {
        let Some(message) = ClientMessage::parse(data) else {
            return Ok(());
        };
        debug!(?message, source = source.unwrap_or("-"), "Received message");

        match message {
            ClientMessage::SkipWaiting => self.skip_waiting().await,
            ClientMessage::ClearCache => {
                let count = self.caches.clear_all().await?;
                info!(count, "Cleared all caches");
                self.reply(source, WorkerMessage::CacheCleared).await;
                Ok(())
            }
            ClientMessage::GetVersion => {
                self.reply(
                    source,
                    WorkerMessage::SwVersion {
                        version: self.generation().to_string(),
                    },
                )
                .await;
                Ok(())
            }
        }
    }

    /// Show a notification for a push message.
    pub async fn handle_push(&self, data: &[u8]) -> SwResult<Notification> {
        let payload = PushPayload::parse(data);

        let url = payload
            .url
            .as_deref()
            .and_then(|u| self.resolve_lenient(u))
            .unwrap_or_else(|| self.shared.scope.clone());
        let icon = payload
            .icon
            .as_deref()
            .or(self.config.notification_icon.as_deref())
            .and_then(|u| self.resolve_lenient(u));

        let notification = Notification {
            id: Notification::next_id(),
            title: payload.title.unwrap_or_else(|| self.config.app_name.clone()),
            body: payload.body.unwrap_or_default(),
            icon,
            tag: payload.tag,
            url,
        };

        self.shared.notifications.show(notification.clone()).await;
        let _ = self
            .shared
            .event_tx
            .send(ServiceWorkerEvent::ShowNotification(notification.clone()));
        debug!(id = notification.id, title = %notification.title, "Showing notification");
        Ok(notification)
    }

    /// Close the notification and focus or open its page.
    pub async fn handle_notification_click(&self, notification_id: u64) -> SwResult<()> {
        let notification = self
            .shared
            .notifications
            .close(notification_id)
            .await
            .ok_or_else(|| {
                ServiceWorkerError::NotFound(format!("notification {}", notification_id))
            })?;

        let windows = self
            .shared
            .clients
            .match_all(&ClientMatchOptions {
                include_uncontrolled: true,
                client_type: ClientType::Window,
            })
            .await;

        match windows
            .iter()
            .find(|c| same_document(&c.url, &notification.url))
        {
            Some(client) => {
                self.shared.clients.focus(&client.id).await?;
            }
            None => {
                if let Err(e) = self.shared.clients.open_window(notification.url) {
                    warn!(error = %e, "Opening the scope instead");
                    self.shared.clients.open_window(self.shared.scope.clone())?;
                }
            }
        }
        Ok(())
    }

    // ==================== Helpers ====================

    async fn reply(&self, source: Option<&str>, message: WorkerMessage) {
        let Some(client_id) = source else {
            return;
        };
        if let Err(e) = self.shared.clients.post_message(client_id, message).await {
            debug!(client_id, error = %e, "Reply not delivered");
        }
    }

    async fn broadcast(&self, message: WorkerMessage) {
        let windows = self
            .shared
            .clients
            .match_all(&ClientMatchOptions {
                include_uncontrolled: false,
                client_type: ClientType::Window,
            })
            .await;
        for client in windows {
            if let Err(e) = self
                .shared
                .clients
                .post_message(&client.id, message.clone())
                .await
            {
                debug!(client_id = %client.id, error = %e, "Broadcast not delivered");
            }
        }
    }

    fn resolve_lenient(&self, url: &str) -> Option<Url> {
        match self.shared.scope.join(url) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(url, error = %e, "Ignoring invalid notification URL");
                None
            }
        }
    }
}

fn same_document(a: &Url, b: &Url) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_fragment(None);
    b.set_fragment(None);
    a == b
}
