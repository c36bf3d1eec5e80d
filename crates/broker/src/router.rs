//! Shard route table
//!
//! This module tracks the live shard connections keyed by route key and
//! resolves liveness before conflict whenever a route key is claimed twice.
//! Claims on one route key are serialized; the table itself is only locked
//! for lookups and the final insert, never across a liveness probe.

use crate::connection::Connection;
use cluster_proto::RouteKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Route entry for one registered shard
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Route key the shard registered under
    pub shard_id: RouteKey,

    /// Live shard connection
    pub connection: Arc<Connection>,

    /// Endpoints the shard declared
    pub endpoints: HashSet<String>,

    /// Identity of the shard's host application (informational)
    pub client_id: Option<u64>,
}

impl RouteEntry {
    /// Create new route entry
    pub fn new(
        shard_id: RouteKey,
        connection: Arc<Connection>,
        endpoints: impl IntoIterator<Item = String>,
        client_id: Option<u64>,
    ) -> Self {
        Self {
            shard_id,
            connection,
            endpoints: endpoints.into_iter().collect(),
            client_id,
        }
    }

    /// Check if the shard declared the endpoint
    pub fn serves(&self, endpoint: &str) -> bool {
        self.endpoints.contains(endpoint)
    }
}

/// Outcome of claiming a route key
#[derive(Debug)]
pub enum Registration {
    /// No previous owner
    Created,

    /// Previous owner failed its liveness probe and was evicted
    Replaced { previous: RouteEntry },

    /// Previous owner is alive, or is the claiming connection itself, and keeps the slot
    Rejected,
}

/// Outcome of resolving a request target
#[derive(Debug)]
pub enum Resolution {
    /// Shard is registered and declared the endpoint
    Target(Arc<Connection>),

    /// No shard under the route key
    UnknownShard,

    /// Shard is registered but did not declare the endpoint
    UnknownEndpoint,
}

/// Route table mapping route keys to live shards
pub struct RouteTable {
    /// Registered shards
    routes: RwLock<HashMap<RouteKey, RouteEntry>>,

    /// One lock per route key with a registration in flight
    claims: Mutex<HashMap<RouteKey, Arc<tokio::sync::Mutex<()>>>>,

    /// How long a liveness probe waits for the existing owner
    probe_timeout: Duration,
}

impl RouteTable {
    /// Create a new route table
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            probe_timeout,
        }
    }

    /// Claim the entry's route key.
    ///
    /// Registrations for the same route key run one at a time, so the check
    /// for an existing owner and the evict-or-reject decision cannot interleave
    /// with another claim on that key. Other keys stay readable and writable
    /// while the existing owner is probed.
    pub async fn register(&self, entry: RouteEntry) -> Registration {
        let shard_id = entry.shard_id.clone();
        let claim = self.claim(&shard_id);

        let guard = claim.lock().await;
        let outcome = self.register_claimed(entry).await;
        drop(guard);

        self.release(&shard_id, claim);
        outcome
    }

    async fn register_claimed(&self, entry: RouteEntry) -> Registration {
        let owner = self
            .routes
            .read()
            .await
            .get(&entry.shard_id)
            .map(|existing| existing.connection.clone());

        let Some(owner) = owner else {
            debug!("Route {} claimed by connection {}", entry.shard_id, entry.connection.id());
            self.routes.write().await.insert(entry.shard_id.clone(), entry);
            return Registration::Created;
        };

        // The owner's pong would be read by the loop that is waiting here
        if owner.id() == entry.connection.id() {
            return Registration::Rejected;
        }

        if owner.probe(self.probe_timeout).await {
            return Registration::Rejected;
        }

        let mut routes = self.routes.write().await;
        if let Some(current) = routes.get(&entry.shard_id) {
            if current.connection.id() != owner.id() {
                return Registration::Rejected;
            }
        }

        match routes.insert(entry.shard_id.clone(), entry) {
            Some(previous) => Registration::Replaced { previous },
            None => Registration::Created,
        }
    }

    fn claim(&self, shard_id: &RouteKey) -> Arc<tokio::sync::Mutex<()>> {
        self.claims
            .lock()
            .entry(shard_id.clone())
            .or_default()
            .clone()
    }

    /// Forget the claim lock once nobody else holds or waits on it
    fn release(&self, shard_id: &RouteKey, claim: Arc<tokio::sync::Mutex<()>>) {
        let mut claims = self.claims.lock();
        if Arc::strong_count(&claim) == 2 {
            claims.remove(shard_id);
        }
    }

    /// Remove a shard
    pub async fn deregister(&self, shard_id: &RouteKey) -> Option<RouteEntry> {
        let mut routes = self.routes.write().await;
        routes.remove(shard_id)
    }

    /// Check if a shard is registered
    pub async fn contains(&self, shard_id: &RouteKey) -> bool {
        let routes = self.routes.read().await;
        routes.contains_key(shard_id)
    }

    /// Resolve the connection serving `endpoint` on `shard_id`
    pub async fn resolve(&self, shard_id: &RouteKey, endpoint: &str) -> Resolution {
        let routes = self.routes.read().await;

        match routes.get(shard_id) {
            None => Resolution::UnknownShard,
            Some(entry) if !entry.serves(endpoint) => Resolution::UnknownEndpoint,
            Some(entry) => Resolution::Target(entry.connection.clone()),
        }
    }

    /// Snapshot of a route entry
    pub async fn get(&self, shard_id: &RouteKey) -> Option<RouteEntry> {
        let routes = self.routes.read().await;
        routes.get(shard_id).cloned()
    }

    /// Get all registered route keys
    pub async fn shard_ids(&self) -> Vec<RouteKey> {
        let routes = self.routes.read().await;
        let mut ids: Vec<RouteKey> = routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get number of registered shards
    pub async fn len(&self) -> usize {
        let routes = self.routes.read().await;
        routes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
