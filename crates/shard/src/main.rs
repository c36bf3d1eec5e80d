//! Cluster Shard - Main Entry Point
//!
//! Demo shard serving a couple of endpoints until interrupted.

use cluster_common::{ClusterConfig, ClusterError, Result};
use cluster_shard::{AgentEvent, AgentOptions, EndpointTable, Host, Payload, ShardAgent};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in for the application owning the shard
struct DemoHost {
    owner_id: u64,
}

impl Host for DemoHost {
    fn owner_id(&self) -> Option<u64> {
        Some(self.owner_id)
    }

    fn dispatch(&self, event: AgentEvent) {
        match event {
            AgentEvent::Ready => info!("Shard is ready to serve requests"),
            AgentEvent::EndpointError { endpoint, message } => {
                error!("Endpoint {:?} failed: {}", endpoint, message)
            }
            AgentEvent::Disconnected => warn!("Shard left the cluster"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = ClusterConfig::load()?;
    if config.mode != "shard" {
        return Err(ClusterError::config(format!(
            "Expected shard mode, got {}",
            config.mode
        )));
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("cluster_shard={}", config.log_level()).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = AgentOptions::from_config(&config)?;
    let shard_id = options.shard_id.clone();

    let endpoints = Arc::new(EndpointTable::new());
    endpoints.route(shard_id.clone(), "ping", |_| async { Ok(json!({"pong": true})) });
    endpoints.route(shard_id.clone(), "echo", |payload: Payload| async move {
        Ok(Value::Object(payload.raw().clone()))
    });
    endpoints.route(shard_id.clone(), "add", |payload: Payload| async move {
        let sum = payload.i64("a")? + payload.i64("b")?;
        Ok(json!({"sum": sum}))
    });

    let host = Arc::new(DemoHost {
        owner_id: std::process::id() as u64,
    });
    let agent = ShardAgent::new(options, endpoints, host);

    info!("Starting shard {} against {}", shard_id, config.base_url());
    if !agent.connect().await {
        return Err(ClusterError::connection("could not register with the broker"));
    }

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Received shutdown signal");

    if let Err(e) = agent.disconnect().await {
        warn!("Clean disconnect failed: {}", e);
    }

    info!("Shard shutdown complete");
    Ok(())
}
