//! PWAKit Core Library
//!
//! This crate provides the worker configuration shared by the caching engine
//! and its hosts.

pub mod config;

pub use config::{NavigationStrategy, PrecacheRetry, WorkerConfig};
