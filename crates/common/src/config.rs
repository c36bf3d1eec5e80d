//! Configuration structures for the cluster
//!
//! This module defines all configuration types used across the broker, shards and callers.
//! Configurations are loaded from YAML files or, failing that, from environment variables.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for cluster components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Mode: "broker", "shard" or "client"
    pub mode: String,

    /// Broker host (bind address for the broker, target for everyone else)
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret; `None` accepts only peers presenting no secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Broker-specific configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerConfig>,

    /// Shard-specific configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardConfig>,

    /// Caller-specific configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Broker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// How long a liveness probe waits for a pong
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

/// Shard-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Route key this shard registers under
    pub shard_id: String,

    /// Upper bound on concurrently running handlers (unbounded when absent)
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
}

/// Caller-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Give up waiting for a response after this long (waits forever when absent)
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    20000
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl ClusterConfig {
    /// Minimal configuration for the given mode with local defaults
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            host: default_host(),
            port: default_port(),
            secret_key: None,
            broker: None,
            shard: None,
            client: None,
            observability: None,
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ClusterError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: ClusterConfig = serde_yaml::from_str(&content).map_err(|e| {
            ClusterError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mode = std::env::var("CLUSTER_MODE").unwrap_or_else(|_| "broker".to_string());
        let mut config = ClusterConfig::new(mode);

        if let Ok(host) = std::env::var("CLUSTER_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("CLUSTER_PORT") {
            config.port = port
                .parse()
                .map_err(|_| ClusterError::Config(format!("Invalid port number: {}", port)))?;
        }
        config.secret_key = std::env::var("CLUSTER_SECRET_KEY").ok();

        match config.mode.as_str() {
            "broker" => config.broker = Some(BrokerConfig::default()),
            "shard" => {
                let shard_id = std::env::var("CLUSTER_SHARD_ID")
                    .map_err(|_| ClusterError::config("CLUSTER_SHARD_ID is required in shard mode"))?;
                config.shard = Some(ShardConfig {
                    shard_id,
                    max_concurrent_requests: None,
                });
            }
            "client" => config.client = Some(ClientConfig::default()),
            _ => {}
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `CLUSTER_CONFIG`, or from the environment
    pub fn load() -> Result<Self> {
        match std::env::var("CLUSTER_CONFIG") {
            Ok(path) => Self::from_file(path),
            Err(_) => Self::from_env(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.mode.as_str() {
            "broker" => {
                let broker = self
                    .broker
                    .as_ref()
                    .ok_or_else(|| ClusterError::config("Broker config required for broker mode"))?;
                if broker.probe_timeout_ms == 0 {
                    return Err(ClusterError::config("probe_timeout_ms must be positive"));
                }
            }
            "shard" => {
                let shard = self
                    .shard
                    .as_ref()
                    .ok_or_else(|| ClusterError::config("Shard config required for shard mode"))?;
                if shard.shard_id.is_empty() {
                    return Err(ClusterError::config("shard_id must not be empty"));
                }
                if shard.max_concurrent_requests == Some(0) {
                    return Err(ClusterError::config(
                        "max_concurrent_requests must be positive when set",
                    ));
                }
            }
            "client" => {}
            _ => {
                return Err(ClusterError::config(format!("Invalid mode: {}", self.mode)));
            }
        }
        Ok(())
    }

    /// Broker WebSocket base URL, e.g. `ws://127.0.0.1:20000`
    pub fn base_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Get the liveness probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        let millis = self
            .broker
            .as_ref()
            .map(|broker| broker.probe_timeout_ms)
            .unwrap_or_else(default_probe_timeout);

        Duration::from_millis(millis)
    }

    /// Get the caller request timeout as Duration, if any
    pub fn request_timeout(&self) -> Option<Duration> {
        self.client
            .as_ref()
            .and_then(|client| client.request_timeout_ms)
            .map(Duration::from_millis)
    }

    /// Configured log level, defaulting to info
    pub fn log_level(&self) -> &str {
        self.observability
            .as_ref()
            .map(|o| o.log_level.as_str())
            .unwrap_or("info")
    }
}
