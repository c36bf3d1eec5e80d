//! Cluster Broker - Main Entry Point
//!
//! Loads configuration, then accepts shard and caller connections until
//! interrupted.

use cluster_broker::{Broker, BrokerServer};
use cluster_common::{ClusterConfig, ClusterError, Result, METRICS};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = ClusterConfig::load()?;
    if config.mode != "broker" {
        return Err(ClusterError::config(format!(
            "Expected broker mode, got {}",
            config.mode
        )));
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("cluster_broker={}", config.log_level()).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Broker configuration loaded: bind={}:{}, secret={}, probe_timeout={:?}",
        config.host,
        config.port,
        if config.secret_key.is_some() { "set" } else { "none" },
        config.probe_timeout()
    );

    let broker = Arc::new(Broker::new(&config));
    let server = BrokerServer::bind(broker.clone(), &config.host, config.port).await?;

    let metrics_enabled = config
        .observability
        .as_ref()
        .map(|o| o.enable_metrics)
        .unwrap_or(true);
    if metrics_enabled {
        tokio::spawn(report_metrics(broker.clone()));
    }

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server.serve() => {
            result?;
        }
    }

    info!(
        "Broker shutdown complete ({} shards, {} pending calls dropped)",
        broker.routes().len().await,
        broker.pending().len()
    );
    Ok(())
}

/// Periodically log the metrics registry at debug level
async fn report_metrics(broker: Arc<Broker>) {
    let mut interval = tokio::time::interval(METRICS_REPORT_INTERVAL);

    loop {
        interval.tick().await;
        info!(
            "Broker status: {} shards registered, {} calls pending",
            broker.routes().len().await,
            broker.pending().len()
        );
        debug!("Metrics:\n{}", METRICS.gather());
    }
}
