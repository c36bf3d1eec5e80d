//! Cluster Client
//!
//! Caller side of the cluster: one short-lived connection per call, one
//! request out, one response back.

use cluster_common::error::Result;
use cluster_common::transport::{self, Handshake};
use cluster_common::ClusterConfig;
use cluster_proto::{CreateRequest, Route, RouteKey};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Makes requests to shards through the broker
#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    secret_key: Option<String>,
    request_timeout: Option<Duration>,
}

impl Client {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("ws://{}:{}", host, port),
            secret_key: None,
            request_timeout: None,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            base_url: config.base_url(),
            secret_key: config.secret_key.clone(),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn with_secret_key(mut self, secret_key: impl Into<String>) -> Self {
        self.secret_key = Some(secret_key.into());
        self
    }

    /// Stop waiting for a response after `timeout`. Without one a call waits
    /// until the shard answers or the connection drops.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Call `endpoint` on the shard registered as `shard_id`.
    ///
    /// Returns whatever status-coded object the broker or shard produced;
    /// error statuses are not turned into `Err`.
    pub async fn request(
        &self,
        endpoint: &str,
        shard_id: impl Into<RouteKey>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        let shard_id = shard_id.into();
        let call = self.round_trip(endpoint, &shard_id, kwargs);

        match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call).await.inspect_err(|_| {
                debug!(
                    "No response from shard {} for {:?} within {:?}",
                    shard_id, endpoint, timeout
                )
            })?,
            None => call.await,
        }
    }

    async fn round_trip(
        &self,
        endpoint: &str,
        shard_id: &RouteKey,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        let mut websocket = transport::open(
            &self.base_url,
            Route::CreateRequest,
            Handshake::new(self.secret_key.as_deref()).shard(shard_id),
        )
        .await?;

        let request = CreateRequest {
            endpoint: endpoint.to_string(),
            kwargs: Some(kwargs),
        };
        transport::send_json(&mut websocket, &request).await?;
        debug!("Requested {:?} from shard {}", endpoint, shard_id);

        let response = transport::recv_text(&mut websocket).await;
        if let Err(e) = websocket.close(None).await {
            debug!("Closing request connection failed: {}", e);
        }

        Ok(serde_json::from_str(&response?)?)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new("127.0.0.1", 20000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_common::error::ClusterError;
    use cluster_common::config::ClientConfig;

    #[test]
    fn test_from_config() {
        let mut config = ClusterConfig::new("client");
        config.port = 21000;
        config.secret_key = Some("hunter2".to_string());
        config.client = Some(ClientConfig {
            request_timeout_ms: Some(1500),
        });

        let client = Client::from_config(&config);
        assert_eq!(client.base_url(), "ws://127.0.0.1:21000");
        assert_eq!(client.secret_key.as_deref(), Some("hunter2"));
        assert_eq!(client.request_timeout, Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_request_to_missing_broker_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Client::new("127.0.0.1", port)
            .request("ping", 1u32, Map::new())
            .await;

        assert!(matches!(result, Err(ClusterError::WebSocket(_))));
    }
}
