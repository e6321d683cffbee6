//! Errors that can occur in service worker operations.

use pwakit_common::KitError;
use pwakit_net::NetError;
use thiserror::Error;

/// Errors that can occur in service worker operations.
///
/// None of these ever reach a page through the fetch handler; they surface
/// from lifecycle calls, cache maintenance and configuration.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("State error: {0}")]
    StateError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Bad response for {url}: status {status}")]
    BadResponse { url: String, status: u16 },

    #[error(transparent)]
    Common(#[from] KitError),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result alias for worker operations.
pub type SwResult<T> = Result<T, ServiceWorkerError>;

impl ServiceWorkerError {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceWorkerError::Network(_) => true,
            ServiceWorkerError::Common(e) => e.is_retryable(),
            _ => false,
        }
    }
}
