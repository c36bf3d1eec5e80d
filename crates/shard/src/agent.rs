//! Shard agent
//!
//! Registers a shard's endpoints with the broker, receives forwarded requests
//! on that connection, runs each one as an independent task and returns every
//! result over a short-lived response connection.

use crate::endpoint::EndpointTable;
use crate::host::{AgentEvent, Host};
use crate::payload::Payload;
use cluster_common::error::{ClusterError, Result};
use cluster_common::transport::{self, BrokerStream, Handshake};
use cluster_common::{ClusterConfig, MetricsRegistry, METRICS};
use cluster_proto::{Ack, ForwardedRequest, RegisterShard, Route, RouteKey};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Connection settings for an agent
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Route key to register under
    pub shard_id: RouteKey,

    /// Broker base URL, e.g. `ws://127.0.0.1:20000`
    pub base_url: String,

    /// Shared secret
    pub secret_key: Option<String>,

    /// Upper bound on concurrently running handlers
    pub max_concurrent_requests: Option<usize>,

    pub metrics: MetricsRegistry,
}

impl AgentOptions {
    pub fn new(shard_id: impl Into<RouteKey>, host: &str, port: u16) -> Self {
        Self {
            shard_id: shard_id.into(),
            base_url: format!("ws://{}:{}", host, port),
            secret_key: None,
            max_concurrent_requests: None,
            metrics: METRICS.clone(),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let shard = config
            .shard
            .as_ref()
            .ok_or_else(|| ClusterError::config("Shard config not found"))?;

        Ok(Self {
            shard_id: RouteKey::from(&shard.shard_id),
            base_url: config.base_url(),
            secret_key: config.secret_key.clone(),
            max_concurrent_requests: shard.max_concurrent_requests,
            metrics: METRICS.clone(),
        })
    }

    pub fn secret_key(mut self, secret_key: impl Into<String>) -> Self {
        self.secret_key = Some(secret_key.into());
        self
    }

    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = Some(limit);
        self
    }

    pub fn metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }
}

/// State shared between the agent and its request tasks
struct AgentInner<H: Host> {
    shard_id: RouteKey,
    base_url: String,
    secret_key: Option<String>,
    endpoints: Arc<EndpointTable>,
    host: Arc<H>,
    limiter: Option<Arc<Semaphore>>,
    metrics: MetricsRegistry,
}

/// Live registration with the broker
struct Session {
    sink: SplitSink<BrokerStream, Message>,
    reader: JoinHandle<()>,
}

/// Worker-side endpoint of the cluster
pub struct ShardAgent<H: Host> {
    inner: Arc<AgentInner<H>>,
    session: Mutex<Option<Session>>,
}

impl<H: Host> ShardAgent<H> {
    pub fn new(options: AgentOptions, endpoints: Arc<EndpointTable>, host: Arc<H>) -> Self {
        let limiter = options
            .max_concurrent_requests
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        Self {
            inner: Arc::new(AgentInner {
                shard_id: options.shard_id,
                base_url: options.base_url,
                secret_key: options.secret_key,
                endpoints,
                host,
                limiter,
                metrics: options.metrics,
            }),
            session: Mutex::new(None),
        }
    }

    pub fn shard_id(&self) -> &RouteKey {
        &self.inner.shard_id
    }

    pub fn host(&self) -> &Arc<H> {
        &self.inner.host
    }

    /// Whether the broker connection is registered and still being read
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.reader.is_finished())
    }

    /// Register with the broker and start serving requests.
    ///
    /// Failures are logged, not returned: on `false` the agent stays
    /// disconnected and it is up to the owner to call `connect` again.
    pub async fn connect(&self) -> bool {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if !current.reader.is_finished() {
                warn!("Shard {} is already connected", self.inner.shard_id);
                return true;
            }
        }

        let websocket = match self.inner.register().await {
            Ok(websocket) => websocket,
            Err(e) => {
                error!(severity = "critical", "Failed to connect to the cluster: {}", e);
                return false;
            }
        };

        let (sink, stream) = websocket.split();
        let reader = tokio::spawn(dispatch_loop(self.inner.clone(), stream));
        *session = Some(Session { sink, reader });

        info!("Shard {} successfully connected to the cluster", self.inner.shard_id);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.host.ready().await;
            inner.host.dispatch(AgentEvent::Ready);
        });

        true
    }

    /// Deregister from the broker and close the connection.
    ///
    /// The only way to leave the route table cleanly; any other disconnect is
    /// noticed by the broker on the next registration under this route key.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Err(ClusterError::NotConnected);
        };

        let outcome = self.inner.deregister().await;

        session.reader.abort();
        if let Err(e) = session.sink.close().await {
            debug!("Closing broker connection failed: {}", e);
        }
        self.inner.host.dispatch(AgentEvent::Disconnected);

        let ack = outcome?;
        if !ack.is_ok() {
            return Err(ClusterError::rejected(ack.code, ack.text()));
        }

        info!("Shard {} disconnected from the cluster", self.inner.shard_id);
        Ok(())
    }
}

impl<H: Host> AgentInner<H> {
    fn handshake(&self) -> Handshake<'_> {
        Handshake::new(self.secret_key.as_deref())
    }

    /// Open the registration connection and wait for the broker's verdict
    async fn register(&self) -> Result<BrokerStream> {
        let mut websocket = transport::open(
            &self.base_url,
            Route::InitializeShard,
            self.handshake().shard(&self.shard_id),
        )
        .await?;

        let body = RegisterShard {
            endpoints: self.endpoints.names_for(&self.shard_id),
            client_id: self.host.owner_id(),
        };
        debug!("Registering endpoints {:?}", body.endpoints);
        transport::send_json(&mut websocket, &body).await?;

        let ack: Ack = serde_json::from_str(&transport::recv_text(&mut websocket).await?)?;
        if !ack.is_ok() {
            let _ = websocket.close(None).await;
            return Err(ClusterError::rejected(ack.code, ack.text()));
        }

        Ok(websocket)
    }

    async fn deregister(&self) -> Result<Ack> {
        let mut websocket = transport::open(
            &self.base_url,
            Route::DisconnectShard,
            self.handshake().shard(&self.shard_id),
        )
        .await?;

        transport::send_json(&mut websocket, &json!({})).await?;
        let ack: Ack = serde_json::from_str(&transport::recv_text(&mut websocket).await?)?;
        let _ = websocket.close(None).await;

        Ok(ack)
    }

    /// Run one request to completion and deliver its response
    async fn handle_request(self: Arc<Self>, request: ForwardedRequest) {
        let _permit = match &self.limiter {
            Some(limiter) => match limiter.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };

        let correlation_id = request.uuid.clone();
        let response = self.execute(request).await;

        debug!("Sending response {}: {:?}", correlation_id, response);
        if let Err(e) = self.deliver(&correlation_id, &response).await {
            error!("Failed to deliver response {}: {}", correlation_id, e);
        }
    }

    /// Invoke the handler and normalize its result into a response object
    async fn execute(&self, request: ForwardedRequest) -> Map<String, Value> {
        debug!("Received request {:?} ({})", request.endpoint, request.uuid);
        self.metrics.shard.requests_handled.inc();

        let Some(endpoint) = self.endpoints.get(&request.endpoint) else {
            error!(
                "Broker forwarded {:?}, which this shard never registered",
                request.endpoint
            );
            return error_response("Unknown endpoint!");
        };

        let name = request.endpoint.clone();
        let started = Instant::now();
        let outcome = AssertUnwindSafe((endpoint.handler)(Payload::from(request)))
            .catch_unwind()
            .await;
        self.metrics
            .shard
            .handler_duration
            .observe(started.elapsed().as_secs_f64());

        let failure = match outcome {
            Ok(Ok(value)) => return normalize_response(value),
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic.as_ref()),
        };

        self.metrics.shard.handler_failures.inc();
        error!("Received error while executing {:?}: {}", name, failure);
        self.host.dispatch(AgentEvent::EndpointError {
            endpoint: name,
            message: failure,
        });

        error_response("Something went wrong while calling the route!")
    }

    async fn deliver(&self, correlation_id: &str, response: &Map<String, Value>) -> Result<()> {
        let mut websocket = transport::open(
            &self.base_url,
            Route::ReturnResponse,
            self.handshake().uuid(correlation_id),
        )
        .await?;

        transport::send_json(&mut websocket, response).await?;
        if let Err(e) = websocket.close(None).await {
            debug!("Closing response connection failed: {}", e);
        }

        Ok(())
    }
}

/// Read forwarded requests until the broker connection closes
async fn dispatch_loop<H: Host>(inner: Arc<AgentInner<H>>, mut stream: SplitStream<BrokerStream>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ForwardedRequest>(text.as_str()) {
                Ok(request) => {
                    tokio::spawn(inner.clone().handle_request(request));
                }
                Err(e) => warn!("Ignoring malformed message from the broker: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Broker connection failed: {}", e);
                break;
            }
        }
    }

    warn!("Shard {} lost its broker connection", inner.shard_id);
    inner.host.dispatch(AgentEvent::Disconnected);
}

/// Empty results become `{}`; a missing or null `code` becomes 200
pub fn normalize_response(value: Value) -> Map<String, Value> {
    let mut response = match value {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return error_response(&format!(
                "Expected a JSON object as response, got {} instead!",
                kind(&other)
            ))
        }
    };

    if response.get("code").map_or(true, Value::is_null) {
        response.insert("code".to_string(), json!(200));
    }

    response
}

fn error_response(message: &str) -> Map<String, Value> {
    let mut response = Map::new();
    response.insert("error".to_string(), json!(message));
    response.insert("code".to_string(), json!(500));
    response
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}
