//! Cluster common library
//!
//! This crate contains shared code used across the broker, shard agents and callers.

pub mod config;
pub mod error;
pub mod metrics;
pub mod transport;

// Re-export commonly used types
pub use config::ClusterConfig;
pub use error::{ClusterError, Result};
pub use metrics::{MetricsRegistry, METRICS};
