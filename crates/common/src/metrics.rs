//! Metrics collection for the cluster
//!
//! This module provides Prometheus metrics for observability.
//! Components take a `MetricsRegistry` handle; binaries use the global `METRICS`.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for the cluster
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub broker: BrokerMetrics,
    pub shard: ShardMetrics,
}

/// Broker-side metrics
#[derive(Debug, Clone)]
pub struct BrokerMetrics {
    /// Live route entries
    pub registered_shards: IntGauge,

    /// Stale route entries replaced after a failed liveness probe
    pub shard_evictions: IntCounter,

    /// Requests forwarded to shards
    pub requests_forwarded: IntCounter,

    /// Responses delivered back to callers
    pub responses_delivered: IntCounter,

    /// Responses that matched no pending call
    pub delivery_misses: IntCounter,

    /// Messages answered with a non-200 status
    pub rejections: IntCounter,

    /// Calls waiting for a response
    pub pending_calls: IntGauge,
}

/// Shard-agent metrics
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Requests handled, successful or not
    pub requests_handled: IntCounter,

    /// Handler invocations that failed
    pub handler_failures: IntCounter,

    /// Handler duration histogram
    pub handler_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let broker = BrokerMetrics {
            registered_shards: gauge(
                &registry,
                "broker_registered_shards",
                "Current number of registered shards",
            ),
            shard_evictions: counter(
                &registry,
                "broker_shard_evictions_total",
                "Stale shards replaced after a failed liveness probe",
            ),
            requests_forwarded: counter(
                &registry,
                "broker_requests_forwarded_total",
                "Total number of requests forwarded to shards",
            ),
            responses_delivered: counter(
                &registry,
                "broker_responses_delivered_total",
                "Total number of responses delivered to callers",
            ),
            delivery_misses: counter(
                &registry,
                "broker_delivery_misses_total",
                "Responses received for unknown correlation ids",
            ),
            rejections: counter(
                &registry,
                "broker_rejections_total",
                "Messages answered with an error status",
            ),
            pending_calls: gauge(
                &registry,
                "broker_pending_calls",
                "Current number of calls awaiting a response",
            ),
        };

        let handler_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "shard_handler_duration_seconds",
                "Endpoint handler duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .expect("valid histogram definition");
        registry
            .register(Box::new(handler_duration.clone()))
            .expect("histogram registered once");

        let shard = ShardMetrics {
            requests_handled: counter(
                &registry,
                "shard_requests_handled_total",
                "Total number of requests handled by the shard",
            ),
            handler_failures: counter(
                &registry,
                "shard_handler_failures_total",
                "Total number of failed handler invocations",
            ),
            handler_duration,
        };

        MetricsRegistry {
            registry,
            broker,
            shard,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
