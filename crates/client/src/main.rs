//! cluster-call - invoke a shard endpoint from the command line

use clap::Parser;
use cluster_client::Client;
use cluster_common::{ClusterError, Result};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cluster-call", about = "Call an endpoint on a cluster shard")]
struct Args {
    /// Broker host
    #[arg(long, env = "CLUSTER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Broker port
    #[arg(long, env = "CLUSTER_PORT", default_value_t = 20000)]
    port: u16,

    /// Shared secret
    #[arg(long, env = "CLUSTER_SECRET_KEY")]
    secret_key: Option<String>,

    /// Give up after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Route key of the target shard
    shard_id: String,

    /// Endpoint name
    endpoint: String,

    /// Arguments as a JSON object
    #[arg(default_value = "{}")]
    kwargs: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_client=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let kwargs: Map<String, Value> = serde_json::from_str(&args.kwargs)
        .map_err(|e| ClusterError::invalid_input(format!("kwargs must be a JSON object: {}", e)))?;

    let mut client = Client::new(&args.host, args.port);
    if let Some(secret_key) = args.secret_key {
        client = client.with_secret_key(secret_key);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        client = client.with_timeout(Duration::from_millis(timeout_ms));
    }

    let response = client.request(&args.endpoint, args.shard_id, kwargs).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(())
}
