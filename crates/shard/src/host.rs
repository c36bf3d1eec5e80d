//! Hooks into the application that owns a shard agent

use futures_util::future::BoxFuture;

/// Notification raised by an agent to its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Registered with the broker and the host reported itself ready
    Ready,

    /// A handler failed; the caller received a generic 500 instead
    EndpointError { endpoint: String, message: String },

    /// The agent left the cluster or lost its broker connection
    Disconnected,
}

/// The application whose endpoints an agent serves
pub trait Host: Send + Sync + 'static {
    /// Identity reported to the broker as `client_id`
    fn owner_id(&self) -> Option<u64> {
        None
    }

    /// Resolves once the host is ready; `Ready` is dispatched after that
    fn ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn dispatch(&self, _event: AgentEvent) {}
}
