//! In-memory fetcher with canned responses.
//!
//! Used by tests and by hosts that want to drive the worker without a
//! network. Unknown URLs answer `404 Not Found`, like a static file server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::Semaphore;
use tracing::trace;

use crate::{Fetcher, NetError, Request, Response, ResponseType};

#[derive(Debug, Clone)]
enum MockRoute {
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        response_type: ResponseType,
        body: Bytes,
    },
    Fail(String),
}

/// Requests remembered by [`MockFetcher::requests`]; older ones are dropped.
pub const REQUEST_LOG_LIMIT: usize = 1024;

#[derive(Default)]
struct MockState {
    routes: HashMap<String, MockRoute>,
    held: HashMap<String, Arc<Semaphore>>,
    log: VecDeque<String>,
}

/// Canned-response [`Fetcher`].
#[derive(Default)]
pub struct MockFetcher {
    state: Mutex<MockState>,
    offline: AtomicBool,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer `url` with `status` and `body`.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.route(url, status, HeaderMap::new(), ResponseType::Basic, body.into())
    }

    /// Answer `url` with a full response template.
    pub fn respond_with(&self, url: &str, response: Response) -> &Self {
        let status = response.status;
        let headers = response.headers.clone();
        let response_type = response.response_type;
        self.route(url, status, headers, response_type, response.into_body())
    }

    /// Answer `url` with an opaque (no-cors) response.
    pub fn respond_opaque(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.route(
            url,
            StatusCode::OK,
            HeaderMap::new(),
            ResponseType::Opaque,
            body.into(),
        )
    }

    /// Make every fetch of `url` fail at the transport level.
    pub fn fail(&self, url: &str) -> &Self {
        self.state()
            .routes
            .insert(url.to_string(), MockRoute::Fail("connection refused".into()));
        self
    }

    fn route(
        &self,
        url: &str,
        status: StatusCode,
        headers: HeaderMap,
        response_type: ResponseType,
        body: Bytes,
    ) -> &Self {
        self.state().routes.insert(
            url.to_string(),
            MockRoute::Respond {
                status,
                headers,
                response_type,
                body,
            },
        );
        self
    }

    /// Toggle simulated connectivity.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Block fetches of `url` until [`MockFetcher::release`] is called.
    pub fn hold(&self, url: &str) {
        self.state()
            .held
            .insert(url.to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Let held fetches of `url` proceed.
    pub fn release(&self, url: &str) {
        if let Some(gate) = self.state().held.remove(url) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// URLs fetched so far, in order. Only the most recent
    /// [`REQUEST_LOG_LIMIT`] are kept.
    pub fn requests(&self) -> Vec<String> {
        self.state().log.iter().cloned().collect()
    }

    /// How many times `url` appears in the request log.
    pub fn request_count(&self, url: &str) -> usize {
        self.state().log.iter().filter(|u| u.as_str() == url).count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        let gate = {
            let mut state = self.state();
            if state.log.len() == REQUEST_LOG_LIMIT {
                state.log.pop_front();
            }
            state.log.push_back(url.clone());
            state.held.get(&url).cloned()
        };

        if let Some(gate) = gate {
            trace!(%url, "Mock fetch held");
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| NetError::RequestFailed(e.to_string()))?;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(url));
        }

        let route = self.state().routes.get(&url).cloned();
        match route {
            Some(MockRoute::Respond {
                status,
                headers,
                response_type,
                body,
            }) => Ok(Response::from_network(
                request.url.clone(),
                status,
                headers,
                response_type,
                body,
            )),
            Some(MockRoute::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            None => Ok(Response::from_network(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                ResponseType::Basic,
                Bytes::from_static(b"Not Found"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_routes_and_log() {
        let fetcher = MockFetcher::new();
        fetcher.respond("https://app.test/a.js", 200, "a");

        let hit = fetcher
            .fetch(&Request::parse("https://app.test/a.js").unwrap())
            .await
            .unwrap();
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.body().as_ref(), b"a");

        let miss = fetcher
            .fetch(&Request::parse("https://app.test/b.js").unwrap())
            .await
            .unwrap();
        assert_eq!(miss.status, StatusCode::NOT_FOUND);

        assert_eq!(fetcher.request_count("https://app.test/a.js"), 1);
        assert_eq!(fetcher.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_offline_and_failures() {
        let fetcher = MockFetcher::new();
        fetcher.respond("https://app.test/", 200, "home");
        fetcher.fail("https://app.test/down");

        let down = fetcher
            .fetch(&Request::parse("https://app.test/down").unwrap())
            .await;
        assert!(matches!(down, Err(NetError::RequestFailed(_))));

        fetcher.set_online(false);
        let offline = fetcher
            .fetch(&Request::parse("https://app.test/").unwrap())
            .await;
        assert!(matches!(offline, Err(NetError::Offline(_))));
    }

    #[tokio::test]
    async fn test_mock_request_log_is_bounded() {
        let fetcher = MockFetcher::new();
        fetcher.set_online(false);
        for i in 0..REQUEST_LOG_LIMIT + 5 {
            let request = Request::parse(&format!("https://app.test/{}", i)).unwrap();
            let _ = fetcher.fetch(&request).await;
        }

        let log = fetcher.requests();
        assert_eq!(log.len(), REQUEST_LOG_LIMIT);
        assert_eq!(log[0], "https://app.test/5");
        assert_eq!(fetcher.request_count("https://app.test/0"), 0);
    }

    #[tokio::test]
    async fn test_mock_hold_and_release() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("https://app.test/slow", 200, "late");
        fetcher.hold("https://app.test/slow");

        let task = {
            let fetcher = fetcher.clone();
            tokio::spawn(async move {
                fetcher
                    .fetch(&Request::parse("https://app.test/slow").unwrap())
                    .await
            })
        };

        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        fetcher.release("https://app.test/slow");
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.body().as_ref(), b"late");
    }
}
