//! # PWAKit Common
//!
//! Common utilities, error types, and logging configuration for the PWAKit
//! offline caching worker.
//!
//! ## Features
//!
//! - Unified error type with backtrace support
//! - Logging configuration and setup
//! - Retry and timeout utilities
//! - Result extension traits

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, retry_with_backoff_if, with_timeout, RetryConfig};

/// Unified error type for PWAKit.
#[derive(Error, Debug)]
pub enum KitError {
    /// Storage backend errors (serialization, persistence).
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Storage quota exhausted.
    #[error("Quota exceeded: {used} of {limit} bytes")]
    QuotaExceeded { used: usize, limit: usize },

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl KitError {
    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KitError::Timeout(_) | KitError::Io(_))
    }
}

/// Result type alias for PWAKit operations.
pub type Result<T> = std::result::Result<T, KitError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| KitError::Internal {
            message: format!("{}: {}", message.into(), e),
            backtrace: Some(backtrace::Backtrace::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(KitError::Io(io).is_retryable());
        assert!(KitError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!KitError::config("test").is_retryable());
        assert!(!KitError::QuotaExceeded { used: 2, limit: 1 }.is_retryable());
    }

    #[test]
    fn test_source_is_kept() {
        let parse = "x".parse::<u32>().unwrap_err();
        let err = KitError::storage_with_source("corrupt bucket", parse);
        assert_eq!(err.to_string(), "Storage error: corrupt bucket");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_result_context() {
        let parsed: std::result::Result<u32, std::num::ParseIntError> = "nope".parse();
        let err = parsed.context("parsing max entries").unwrap_err();
        assert!(err.to_string().contains("parsing max entries"));
        assert!(matches!(err, KitError::Internal { .. }));
    }
}
