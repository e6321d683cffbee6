//! Keep-alive contract for dispatched events.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::debug;

/// Lifetime of one dispatched event.
///
/// Work registered with [`wait_until`](Self::wait_until) runs detached from
/// the code path that produced the event's result. The host keeps the worker
/// alive until [`settled`](Self::settled) resolves.
#[derive(Debug, Clone, Default)]
pub struct ExtendableEvent {
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ExtendableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the event's lifetime until `future` completes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn wait_until<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Number of extensions still running.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every extension, including ones registered while waiting.
    pub async fn settled(&self) {
        loop {
            let handles: Vec<_> = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    debug!(error = %e, "Extended task did not complete");
                }
            }
        }
    }
}
