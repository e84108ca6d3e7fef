//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade. Without an installed
//! recorder every call is a no-op, which is what libraries and tests get from
//! [`GatewayMetrics::detached`].

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheStats;
use crate::error::GatewayError;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the process-wide Prometheus recorder. Call once, from main.
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::MetricsInstall(e.to_string()))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Metrics that record into whatever recorder is current, without
    /// rendering support.
    pub fn detached() -> Self {
        Self { handle: None }
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Dispatch events received from the gateway"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Shard reconnects by reason"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway errors"
        );
        describe_counter!(
            "gateway_handler_failures_total",
            Unit::Count,
            "Event handlers that returned an error"
        );

        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Round trip between heartbeat and its acknowledgement"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards with a live session"
        );
        describe_gauge!(
            "gateway_cache_entries",
            Unit::Count,
            "Cached entities per kind"
        );
    }

    pub fn record_event(&self, shard_id: u32, event_type: &str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_type.to_owned()
        )
        .increment(1);
    }

    pub fn record_heartbeat_latency(&self, shard_id: u32, latency: Duration) {
        histogram!(
            "gateway_heartbeat_latency_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(latency.as_secs_f64());
    }

    pub fn record_reconnect(&self, shard_id: u32, reason: &'static str) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// `error_type` is a [`GatewayError::error_type_label`]
    pub fn record_error(&self, shard_id: u32, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    pub fn record_handler_failure(&self, event_type: &str) {
        counter!(
            "gateway_handler_failures_total",
            "event_type" => event_type.to_owned()
        )
        .increment(1);
    }

    pub fn set_shards_ready(&self, pool_id: u64, count: usize) {
        gauge!(
            "gateway_shards_ready",
            "pool_id" => pool_id.to_string()
        )
        .set(count as f64);
    }

    pub fn set_cache_entries(&self, stats: &CacheStats) {
        let kinds = [
            ("users", stats.users),
            ("guilds", stats.guilds),
            ("members", stats.members),
            ("channels", stats.channels),
            ("messages", stats.messages),
            ("roles", stats.roles),
            ("voice_states", stats.voice_states),
        ];

        for (kind, count) in kinds {
            gauge!("gateway_cache_entries", "kind" => kind).set(count as f64);
        }
    }

    /// Render metrics in Prometheus format; empty when detached
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}
