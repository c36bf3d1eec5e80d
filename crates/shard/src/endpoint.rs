//! Endpoint registration table
//!
//! Maps endpoint names to handler closures together with the route key they
//! belong to. One table can back several agents with different route keys;
//! each agent advertises only its own endpoints.

use crate::payload::Payload;
use cluster_proto::RouteKey;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// What a handler produces: a JSON object (or `null` for an empty success)
pub type HandlerResult = anyhow::Result<Value>;

/// Type-erased endpoint handler
pub type Handler = Arc<dyn Fn(Payload) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A registered endpoint
#[derive(Clone)]
pub struct Endpoint {
    pub shard_id: RouteKey,
    pub handler: Handler,
}

/// Name → handler table, populated before connecting
#[derive(Default)]
pub struct EndpointTable {
    endpoints: RwLock<HashMap<String, Endpoint>>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as `name` for the shard `shard_id`.
    ///
    /// Registering a name twice replaces the earlier handler.
    pub fn route<F, Fut>(&self, shard_id: impl Into<RouteKey>, name: impl Into<String>, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = name.into();
        let endpoint = Endpoint {
            shard_id: shard_id.into(),
            handler: Arc::new(move |payload| handler(payload).boxed()),
        };

        let previous = self.endpoints.write().insert(name.clone(), endpoint);
        if previous.is_some() {
            debug!("Endpoint {:?} re-registered, replacing previous handler", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Endpoint> {
        self.endpoints.read().get(name).cloned()
    }

    /// Names of the endpoints belonging to `shard_id`, sorted
    pub fn names_for(&self, shard_id: &RouteKey) -> Vec<String> {
        let endpoints = self.endpoints.read();
        let mut names: Vec<String> = endpoints
            .iter()
            .filter(|(_, endpoint)| &endpoint.shard_id == shard_id)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
