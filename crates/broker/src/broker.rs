//! Broker message handlers
//!
//! Every inbound message is dispatched by the routing path of the connection it
//! arrived on. Protocol failures are answered with a structured status on the
//! same connection and never tear the connection down.

use crate::connection::Connection;
use crate::pending::PendingCalls;
use crate::router::{Registration, Resolution, RouteEntry, RouteTable};
use cluster_common::{ClusterConfig, MetricsRegistry, METRICS};
use cluster_proto::{
    Ack, ConnectionMeta, CreateRequest, ForwardedRequest, RegisterShard, Route, RouteKey,
    StatusCode,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Central router between shards and callers
pub struct Broker {
    /// Shared secret peers must present
    secret_key: Option<String>,

    /// Live shards
    routes: RouteTable,

    /// Calls awaiting a response
    pending: PendingCalls,

    metrics: MetricsRegistry,
}

impl Broker {
    /// Create a broker reporting to the global metrics registry
    pub fn new(config: &ClusterConfig) -> Self {
        Self::with_metrics(config, METRICS.clone())
    }

    pub fn with_metrics(config: &ClusterConfig, metrics: MetricsRegistry) -> Self {
        Self::from_parts(config.secret_key.clone(), config.probe_timeout(), metrics)
    }

    pub fn from_parts(
        secret_key: Option<String>,
        probe_timeout: Duration,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            secret_key,
            routes: RouteTable::new(probe_timeout),
            pending: PendingCalls::new(),
            metrics,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// A presented secret must match the configured one; no secret matches
    /// only a broker configured without one.
    pub fn is_authorized(&self, meta: &ConnectionMeta) -> bool {
        match (&meta.secret_key, &self.secret_key) {
            (Some(presented), Some(expected)) => presented == expected,
            (None, None) => true,
            _ => false,
        }
    }

    /// Dispatch one inbound message by the connection's routing path
    pub async fn dispatch(&self, meta: &ConnectionMeta, connection: &Arc<Connection>, message: &str) {
        match meta.route() {
            Some(Route::InitializeShard) => self.initialize_shard(meta, connection, message).await,
            Some(Route::DisconnectShard) => self.disconnect_shard(meta, connection).await,
            Some(Route::CreateRequest) => self.create_request(meta, connection, message).await,
            Some(Route::ReturnResponse) => self.return_response(meta, connection, message),
            None => {
                debug!("Unknown path {:?} on connection {}", meta.path, connection.id());
                self.reply(connection, Ack::error("Unknown path", StatusCode::NotFound));
            }
        }
    }

    /// Register the connection as the shard named by its `Shard-ID`
    pub async fn initialize_shard(
        &self,
        meta: &ConnectionMeta,
        connection: &Arc<Connection>,
        message: &str,
    ) {
        if !self.is_authorized(meta) {
            return self.reply(connection, invalid_secret(StatusCode::Forbidden));
        }

        let Some(shard_id) = meta.shard_id.clone() else {
            return self.reply(connection, missing_shard_id());
        };

        let body: RegisterShard = match serde_json::from_str(message) {
            Ok(body) => body,
            Err(e) => {
                debug!("Malformed registration from {}: {}", shard_id, e);
                return self.reply(connection, malformed_payload());
            }
        };

        let client_id = body.client_id;
        let entry = RouteEntry::new(shard_id.clone(), connection.clone(), body.endpoints, client_id);

        match self.routes.register(entry).await {
            Registration::Created => {
                self.metrics.broker.registered_shards.inc();
                self.reply(connection, connected());
                info!("Shard {} has been connected!", quoted(&shard_id));
            }
            Registration::Replaced { previous } => {
                self.metrics.broker.shard_evictions.inc();
                warn!(
                    previous_peer = ?previous.connection.peer(),
                    "Shard {} (client ID: {}) has been replaced by connection {}. The reason is PING timeout",
                    quoted(&shard_id),
                    previous
                        .client_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    connection.id()
                );
                self.reply(connection, connected());
            }
            Registration::Rejected => {
                self.reply(
                    connection,
                    Ack::error(
                        format!("Shard with ID {} already exists!", quoted(&shard_id)),
                        StatusCode::InternalError,
                    ),
                );
            }
        }
    }

    /// Remove the shard named by the connection's `Shard-ID`
    pub async fn disconnect_shard(&self, meta: &ConnectionMeta, connection: &Arc<Connection>) {
        if !self.is_authorized(meta) {
            return self.reply(connection, invalid_secret(StatusCode::Forbidden));
        }

        let Some(shard_id) = meta.shard_id.as_ref() else {
            return self.reply(connection, missing_shard_id());
        };

        if self.routes.deregister(shard_id).await.is_none() {
            return self.reply(connection, unknown_shard(shard_id));
        }

        self.metrics.broker.registered_shards.dec();
        self.reply(connection, Ack::ok("Successfully disconnected from the cluster!"));
        warn!("Shard {} has been disconnected manually", quoted(shard_id));
    }

    /// Forward a caller's request to the targeted shard.
    ///
    /// Nothing is sent back to the caller here; the shard's response arrives
    /// later through `return_response`.
    pub async fn create_request(
        &self,
        meta: &ConnectionMeta,
        connection: &Arc<Connection>,
        message: &str,
    ) {
        if !self.is_authorized(meta) {
            return self.reply(connection, invalid_secret(StatusCode::Unauthorized));
        }

        let Some(shard_id) = meta.shard_id.as_ref() else {
            return self.reply(connection, missing_shard_id());
        };

        if !self.routes.contains(shard_id).await {
            return self.reply(connection, unknown_shard(shard_id));
        }

        let request: CreateRequest = match serde_json::from_str(message) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed request for shard {}: {}", shard_id, e);
                return self.reply(connection, malformed_payload());
            }
        };

        let shard = match self.routes.resolve(shard_id, &request.endpoint).await {
            Resolution::Target(shard) => shard,
            Resolution::UnknownEndpoint => {
                return self.reply(
                    connection,
                    Ack::error("Unknown endpoint!", StatusCode::NotFound),
                );
            }
            Resolution::UnknownShard => return self.reply(connection, unknown_shard(shard_id)),
        };

        let correlation_id = Uuid::new_v4().to_string();
        let forwarded = ForwardedRequest {
            endpoint: request.endpoint,
            data: request.kwargs.unwrap_or_default(),
            uuid: correlation_id.clone(),
        };
        let encoded = match serde_json::to_string(&forwarded) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode request {}: {}", correlation_id, e);
                return self.reply(connection, malformed_payload());
            }
        };

        // Record the waiter before forwarding so a fast response always finds it
        self.pending.insert(correlation_id.clone(), connection.clone());

        if let Err(e) = shard.send_text(encoded) {
            self.pending.take(&correlation_id);
            debug!("Shard {} unreachable: {}", shard_id, e);
            return self.reply(
                connection,
                Ack::error(
                    format!("Shard with ID {} is unreachable!", quoted(shard_id)),
                    StatusCode::InternalError,
                ),
            );
        }

        self.metrics.broker.requests_forwarded.inc();
        self.metrics.broker.pending_calls.set(self.pending.len() as i64);
        debug!(
            "Forwarded {:?} to shard {} as {}",
            forwarded.endpoint, shard_id, correlation_id
        );
    }

    /// Deliver a shard's response verbatim to the waiting caller.
    ///
    /// A response for an unknown or already answered id is dropped.
    pub fn return_response(&self, meta: &ConnectionMeta, connection: &Arc<Connection>, message: &str) {
        if !self.is_authorized(meta) {
            return self.reply(connection, invalid_secret(StatusCode::Unauthorized));
        }

        let Some(correlation_id) = meta.uuid.as_deref() else {
            return self.reply(
                connection,
                Ack::error("Missing UUID!", StatusCode::InternalError),
            );
        };

        let Some(caller) = self.pending.take(correlation_id) else {
            self.metrics.broker.delivery_misses.inc();
            debug!("No pending call for {}, dropping response", correlation_id);
            return;
        };

        self.metrics.broker.pending_calls.set(self.pending.len() as i64);

        match caller.send_text(message) {
            Ok(()) => {
                self.metrics.broker.responses_delivered.inc();
                debug!("Delivered response {}", correlation_id);
            }
            Err(e) => debug!("Caller for {} went away: {}", correlation_id, e),
        }
    }

    fn reply(&self, connection: &Connection, ack: Ack) {
        if !ack.is_ok() {
            self.metrics.broker.rejections.inc();
        }

        if let Err(e) = connection.send_ack(&ack) {
            debug!("Could not reply on connection {}: {}", connection.id(), e);
        }
    }
}

fn quoted(shard_id: &RouteKey) -> String {
    format!("'{}'", shard_id)
}

fn invalid_secret(code: StatusCode) -> Ack {
    Ack::error("Invalid secret key!", code)
}

fn missing_shard_id() -> Ack {
    Ack::error("Missing shard ID!", StatusCode::InternalError)
}

fn malformed_payload() -> Ack {
    Ack::error("Malformed JSON payload!", StatusCode::InternalError)
}

fn unknown_shard(shard_id: &RouteKey) -> Ack {
    Ack::error(
        format!("Shard with ID {} doesn't exists!", quoted(shard_id)),
        StatusCode::NotFound,
    )
}

fn connected() -> Ack {
    Ack::ok("Successfully connected to the cluster!")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_proto::{SECRET_KEY_HEADER, SHARD_ID_HEADER, UUID_HEADER};
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::Message;

    const SECRET: &str = "hunter2";

    fn broker() -> Broker {
        Broker::from_parts(
            Some(SECRET.to_string()),
            Duration::from_millis(50),
            MetricsRegistry::new(),
        )
    }

    fn meta(route: Route, secret: Option<&str>, shard_id: Option<&str>, uuid: Option<&str>) -> ConnectionMeta {
        ConnectionMeta::from_headers(route.path(), |name| match name {
            SECRET_KEY_HEADER => secret.map(str::to_string),
            SHARD_ID_HEADER => shard_id.map(str::to_string),
            UUID_HEADER => uuid.map(str::to_string),
            _ => None,
        })
    }

    fn next_text(rx: &mut UnboundedReceiver<Message>) -> String {
        match rx.try_recv() {
            Ok(Message::Text(text)) => text.as_str().to_string(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    fn next_json(rx: &mut UnboundedReceiver<Message>) -> Value {
        serde_json::from_str(&next_text(rx)).unwrap()
    }

    async fn register(broker: &Broker, shard_id: &str, endpoints: &[&str]) -> (Arc<Connection>, UnboundedReceiver<Message>) {
        let (shard, mut rx) = Connection::new(None);
        let body = json!({"endpoints": endpoints, "client_id": 7}).to_string();
        broker
            .initialize_shard(&meta(Route::InitializeShard, Some(SECRET), Some(shard_id), None), &shard, &body)
            .await;
        assert_eq!(next_json(&mut rx)["code"], 200);
        (shard, rx)
    }

    #[tokio::test]
    async fn test_register_and_forward_roundtrip() {
        let broker = broker();
        let (_shard, mut shard_rx) = register(&broker, "1", &["ping"]).await;
        let (caller, mut caller_rx) = Connection::new(None);

        broker
            .create_request(
                &meta(Route::CreateRequest, Some(SECRET), Some("1"), None),
                &caller,
                r#"{"endpoint": "ping", "kwargs": {"n": 1}}"#,
            )
            .await;

        // Nothing goes back to the caller until the shard answers
        assert!(caller_rx.try_recv().is_err());

        let forwarded: ForwardedRequest = serde_json::from_str(&next_text(&mut shard_rx)).unwrap();
        assert_eq!(forwarded.endpoint, "ping");
        assert_eq!(forwarded.data.get("n"), Some(&json!(1)));
        assert!(broker.pending().contains(&forwarded.uuid));

        let response = r#"{"pong": true, "code": 200}"#;
        let (delivery, mut delivery_rx) = Connection::new(None);
        broker.return_response(
            &meta(Route::ReturnResponse, Some(SECRET), None, Some(&forwarded.uuid)),
            &delivery,
            response,
        );
        assert!(delivery_rx.try_recv().is_err());

        assert_eq!(next_text(&mut caller_rx), response);
        assert!(broker.pending().is_empty());
        assert_eq!(broker.metrics().broker.responses_delivered.get(), 1);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_creates_no_pending_call() {
        let broker = broker();
        let (_shard, mut shard_rx) = register(&broker, "1", &["ping"]).await;
        let (caller, mut caller_rx) = Connection::new(None);

        broker
            .create_request(
                &meta(Route::CreateRequest, Some(SECRET), Some("1"), None),
                &caller,
                r#"{"endpoint": "missing", "kwargs": {}}"#,
            )
            .await;

        assert_eq!(
            next_json(&mut caller_rx),
            json!({"error": "Unknown endpoint!", "code": 404})
        );
        assert!(broker.pending().is_empty());
        assert!(shard_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_shard() {
        let broker = broker();
        let (caller, mut caller_rx) = Connection::new(None);

        broker
            .create_request(
                &meta(Route::CreateRequest, Some(SECRET), Some("9"), None),
                &caller,
                r#"{"endpoint": "ping", "kwargs": {}}"#,
            )
            .await;

        assert_eq!(
            next_json(&mut caller_rx),
            json!({"error": "Shard with ID '9' doesn't exists!", "code": 404})
        );
    }

    #[tokio::test]
    async fn test_secret_and_metadata_checks() {
        let broker = broker();
        let (connection, mut rx) = Connection::new(None);

        broker
            .initialize_shard(
                &meta(Route::InitializeShard, Some("wrong"), Some("1"), None),
                &connection,
                r#"{"endpoints": ["ping"]}"#,
            )
            .await;
        assert_eq!(next_json(&mut rx)["code"], 403);

        broker
            .initialize_shard(
                &meta(Route::InitializeShard, Some(SECRET), None, None),
                &connection,
                r#"{"endpoints": ["ping"]}"#,
            )
            .await;
        assert_eq!(
            next_json(&mut rx),
            json!({"error": "Missing shard ID!", "code": 500})
        );

        broker
            .create_request(
                &meta(Route::CreateRequest, None, Some("1"), None),
                &connection,
                r#"{"endpoint": "ping"}"#,
            )
            .await;
        assert_eq!(next_json(&mut rx)["code"], 401);

        broker.disconnect_shard(&meta(Route::DisconnectShard, Some("wrong"), Some("1"), None), &connection).await;
        assert_eq!(next_json(&mut rx)["code"], 403);

        assert!(broker.routes().is_empty().await);
        assert!(broker.pending().is_empty());
        assert_eq!(broker.metrics().broker.rejections.get(), 4);
    }

    #[tokio::test]
    async fn test_no_secret_configured_accepts_only_absent_secret() {
        let broker = Broker::from_parts(None, Duration::from_millis(50), MetricsRegistry::new());

        assert!(broker.is_authorized(&meta(Route::CreateRequest, None, Some("1"), None)));
        assert!(!broker.is_authorized(&meta(Route::CreateRequest, Some("None"), Some("1"), None)));
    }

    #[tokio::test]
    async fn test_live_duplicate_registration_rejected() {
        let broker = broker();
        let (owner, mut owner_rx) = register(&broker, "1", &["ping"]).await;

        // Answer the liveness probe on behalf of the owner
        let peer = owner.clone();
        let responder = tokio::spawn(async move {
            while let Some(frame) = owner_rx.recv().await {
                if let Message::Ping(payload) = frame {
                    peer.record_pong(&payload);
                }
            }
        });

        let (challenger, mut challenger_rx) = Connection::new(None);
        broker
            .initialize_shard(
                &meta(Route::InitializeShard, Some(SECRET), Some("1"), None),
                &challenger,
                r#"{"endpoints": ["other"], "client_id": 8}"#,
            )
            .await;

        assert_eq!(
            next_json(&mut challenger_rx),
            json!({"error": "Shard with ID '1' already exists!", "code": 500})
        );
        let entry = broker.routes().get(&RouteKey::from("1")).await.unwrap();
        assert_eq!(entry.connection.id(), owner.id());
        assert_eq!(entry.client_id, Some(7));
        assert_eq!(broker.metrics().broker.shard_evictions.get(), 0);

        responder.abort();
    }

    #[tokio::test]
    async fn test_stale_registration_replaced_once() {
        let broker = broker();
        let (stale, _stale_rx) = register(&broker, "1", &["ping"]).await;
        stale.mark_closed();

        let (replacement, _rx) = register(&broker, "1", &["ping", "echo"]).await;

        let entry = broker.routes().get(&RouteKey::from("1")).await.unwrap();
        assert_eq!(entry.connection.id(), replacement.id());
        assert!(entry.serves("echo"));
        assert_eq!(broker.metrics().broker.shard_evictions.get(), 1);
        assert_eq!(broker.metrics().broker.registered_shards.get(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_shard() {
        let broker = broker();
        let (_shard, _shard_rx) = register(&broker, "1", &["ping"]).await;
        let (leaving, mut rx) = Connection::new(None);

        let disconnect = meta(Route::DisconnectShard, Some(SECRET), Some("1"), None);
        broker.disconnect_shard(&disconnect, &leaving).await;
        assert_eq!(next_json(&mut rx)["code"], 200);
        assert!(broker.routes().is_empty().await);

        broker.disconnect_shard(&disconnect, &leaving).await;
        assert_eq!(
            next_json(&mut rx),
            json!({"error": "Shard with ID '1' doesn't exists!", "code": 404})
        );
    }

    #[tokio::test]
    async fn test_unmatched_response_is_noop() {
        let broker = broker();
        let (_shard, mut shard_rx) = register(&broker, "1", &["ping"]).await;
        let (caller, mut caller_rx) = Connection::new(None);
        broker
            .create_request(
                &meta(Route::CreateRequest, Some(SECRET), Some("1"), None),
                &caller,
                r#"{"endpoint": "ping"}"#,
            )
            .await;
        let forwarded: ForwardedRequest = serde_json::from_str(&next_text(&mut shard_rx)).unwrap();
        let (delivery, mut delivery_rx) = Connection::new(None);

        broker.return_response(
            &meta(Route::ReturnResponse, Some(SECRET), None, Some("not-a-real-id")),
            &delivery,
            r#"{"code": 200}"#,
        );
        assert!(delivery_rx.try_recv().is_err());

        broker.return_response(&meta(Route::ReturnResponse, Some(SECRET), None, None), &delivery, "{}");
        assert_eq!(
            next_json(&mut delivery_rx),
            json!({"error": "Missing UUID!", "code": 500})
        );

        broker.return_response(
            &meta(Route::ReturnResponse, Some("wrong"), None, Some(&forwarded.uuid)),
            &delivery,
            "{}",
        );
        assert_eq!(next_json(&mut delivery_rx)["code"], 401);

        assert!(caller_rx.try_recv().is_err());
        assert!(broker.pending().contains(&forwarded.uuid));
        assert_eq!(broker.metrics().broker.delivery_misses.get(), 1);

        let delivered = meta(Route::ReturnResponse, Some(SECRET), None, Some(&forwarded.uuid));
        broker.return_response(&delivered, &delivery, r#"{"code": 200}"#);
        broker.return_response(&delivered, &delivery, r#"{"code": 200}"#);

        assert_eq!(next_text(&mut caller_rx), r#"{"code": 200}"#);
        assert!(caller_rx.try_recv().is_err());
        assert!(delivery_rx.try_recv().is_err());
        assert_eq!(broker.metrics().broker.delivery_misses.get(), 2);
    }

    #[tokio::test]
    async fn test_unknown_path_replies_404() {
        let broker = broker();
        let (connection, mut rx) = Connection::new(None);
        let meta = ConnectionMeta {
            path: "/metrics".to_string(),
            ..ConnectionMeta::default()
        };

        broker.dispatch(&meta, &connection, "{}").await;
        broker.dispatch(&meta, &connection, "{}").await;

        assert_eq!(next_json(&mut rx), json!({"error": "Unknown path", "code": 404}));
        assert_eq!(next_json(&mut rx)["code"], 404);
        assert!(!connection.is_closed());
    }
}
