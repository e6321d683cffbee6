//! Pages controlled (or controllable) by the worker.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::container::ServiceWorkerEvent;
use crate::error::{ServiceWorkerError, SwResult};
use crate::message::WorkerMessage;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// A client (open page or worker).
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Generation controlling this client, if any.
    pub controller: Option<String>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl Client {
    /// Whether some generation controls this client.
    pub fn is_controlled(&self) -> bool {
        self.controller.is_some()
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug)]
pub struct Clients {
    scope: Url,
    clients: RwLock<HashMap<String, Client>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl Clients {
    pub(crate) fn new(scope: Url, event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>) -> Self {
        Self {
            scope,
            clients: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Register an open page. Messages for it arrive on the returned receiver.
    ///
    /// Pages start uncontrolled, like a first visit; they come under control
    /// when a generation claims them.
    pub async fn connect(
        &self,
        url: Url,
        client_type: ClientType,
    ) -> (Client, mpsc::UnboundedReceiver<WorkerMessage>) {
        self.attach(url, client_type, None).await
    }

    pub(crate) async fn attach(
        &self,
        url: Url,
        client_type: ClientType,
        controller: Option<String>,
    ) -> (Client, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let client = Client {
            id: next_client_id(),
            url,
            client_type,
            focused: false,
            controller,
            outbox,
        };
        debug!(client_id = %client.id, url = %client.url, "Client connected");
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        (client, inbox)
    }

    /// Forget a closed page.
    pub async fn remove(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// Matching clients, ordered by ID.
    pub async fn match_all(&self, options: &ClientMatchOptions) -> Vec<Client> {
        let mut matched: Vec<Client> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| options.include_uncontrolled || c.is_controlled())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Post a message to one client. A client that already went away is
    /// ignored.
    pub async fn post_message(&self, id: &str, message: WorkerMessage) -> SwResult<()> {
        let client = self
            .get(id)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))?;
        if client.outbox.send(message).is_err() {
            debug!(client_id = id, "Client inbox closed");
        }
        Ok(())
    }

    /// Focus a window client.
    pub async fn focus(&self, id: &str) -> SwResult<Client> {
        let mut clients = self.clients.write().await;
        let client = clients
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))?;
        if client.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }

        for client in clients.values_mut() {
            client.focused = client.id == id;
        }
        let _ = self.event_tx.send(ServiceWorkerEvent::Focus {
            client_id: id.to_string(),
        });
        clients
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))
    }

    /// Ask the host to open a new window at `url`. The page registers itself
    /// through [`Clients::connect`] once loaded.
    ///
    /// Any HTTP(S) page may be opened, other origins included; such a page
    /// is simply never controlled.
    pub fn open_window(&self, url: Url) -> SwResult<()> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot open a window at {}",
                url
            )));
        }
        info!(%url, "Requesting new window");
        let _ = self.event_tx.send(ServiceWorkerEvent::OpenWindow { url });
        Ok(())
    }

    /// Whether `url` falls under the worker scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Take control of every in-scope client. Returns the IDs whose
    /// controller changed.
    pub async fn claim(&self, generation: &str) -> Vec<String> {
        let mut clients = self.clients.write().await;
        let mut claimed: Vec<String> = Vec::new();

        for client in clients.values_mut() {
            if !self.in_scope(&client.url) {
                continue;
            }
            if client.controller.as_deref() != Some(generation) {
                client.controller = Some(generation.to_string());
                claimed.push(client.id.clone());
            }
        }
        claimed.sort();

        for client_id in &claimed {
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                generation: generation.to_string(),
            });
        }
        claimed
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:08}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clients() -> (Clients, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Clients::new(Url::parse("https://app.test/").unwrap(), tx),
            rx,
        )
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_match_all() {
        let (clients, _events) = clients();
        let (page, _inbox) = clients.connect(url("https://app.test/"), ClientType::Window).await;
        clients.connect(url("https://app.test/w.js"), ClientType::Worker).await;

        assert!(clients.get(&page.id).await.is_some());
        assert!(clients.match_all(&ClientMatchOptions::default()).await.is_empty());

        let all = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::All,
        };
        assert_eq!(clients.match_all(&all).await.len(), 2);

        assert!(clients.remove(&page.id).await.is_some());
        assert_eq!(clients.match_all(&all).await.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_only_in_scope_and_announces() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let clients = Clients::new(url("https://app.test/pwa/"), tx);
        let (inside, _a) = clients.connect(url("https://app.test/pwa/home"), ClientType::Window).await;
        let (outside, _b) = clients.connect(url("https://app.test/other"), ClientType::Window).await;

        assert_eq!(clients.claim("v1").await, vec![inside.id.clone()]);
        assert!(clients.claim("v1").await.is_empty());
        assert!(clients.get(&outside.id).await.unwrap().controller.is_none());

        match events.try_recv().unwrap() {
            ServiceWorkerEvent::ControllerChange {
                client_id,
                generation,
            } => {
                assert_eq!(client_id, inside.id);
                assert_eq!(generation, "v1");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_message_reaches_inbox() {
        let (clients, _events) = clients();
        let (page, mut inbox) = clients.connect(url("https://app.test/"), ClientType::Window).await;

        clients
            .post_message(&page.id, WorkerMessage::CacheCleared)
            .await
            .unwrap();
        assert_eq!(inbox.recv().await, Some(WorkerMessage::CacheCleared));

        drop(inbox);
        clients
            .post_message(&page.id, WorkerMessage::CacheCleared)
            .await
            .unwrap();
        assert!(matches!(
            clients.post_message("nobody", WorkerMessage::CacheCleared).await,
            Err(ServiceWorkerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_focus_window_only() {
        let (clients, mut events) = clients();
        let (a, _a) = clients.connect(url("https://app.test/a"), ClientType::Window).await;
        let (b, _b) = clients.connect(url("https://app.test/b"), ClientType::Window).await;
        let (w, _w) = clients.connect(url("https://app.test/w.js"), ClientType::Worker).await;

        clients.focus(&a.id).await.unwrap();
        let focused = clients.focus(&b.id).await.unwrap();
        assert!(focused.focused);
        assert!(!clients.get(&a.id).await.unwrap().focused);
        assert!(clients.focus(&w.id).await.is_err());

        assert!(matches!(
            events.try_recv().unwrap(),
            ServiceWorkerEvent::Focus { .. }
        ));
    }

    #[tokio::test]
    async fn test_open_window_accepts_http_pages_only() {
        let (clients, mut events) = clients();
        clients.open_window(url("https://app.test/inbox")).unwrap();
        clients.open_window(url("https://news.other/story")).unwrap();
        assert!(clients.open_window(url("javascript:alert(1)")).is_err());

        let opened: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| match event {
                ServiceWorkerEvent::OpenWindow { url } => url.to_string(),
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(opened, vec!["https://app.test/inbox", "https://news.other/story"]);
    }
}
