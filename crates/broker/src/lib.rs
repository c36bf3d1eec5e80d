//! Cluster Broker
//!
//! Routes named requests from callers to registered shards and correlates
//! each shard response back to the caller that is waiting for it.

pub mod broker;
pub mod connection;
pub mod pending;
pub mod router;
pub mod server;

pub use broker::Broker;
pub use connection::Connection;
pub use pending::PendingCalls;
pub use router::{Registration, Resolution, RouteEntry, RouteTable};
pub use server::BrokerServer;
