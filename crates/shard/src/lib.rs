//! Cluster Shard
//!
//! Worker-side agent: exposes named endpoints to the broker, runs the handlers
//! for forwarded requests and returns their results.

pub mod agent;
pub mod endpoint;
pub mod host;
pub mod payload;

pub use agent::{AgentOptions, ShardAgent};
pub use endpoint::{Endpoint, EndpointTable, Handler, HandlerResult};
pub use host::{AgentEvent, Host};
pub use payload::Payload;
