//! Health check endpoints

use crate::cache::{Cache, CacheStats};
use crate::metrics::GatewayMetrics;
use crate::shard::{ShardSnapshot, ShardState};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pool_id: u64,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub pool_id: u64,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub guilds_total: u64,
    pub events_received: u64,
    pub cache: CacheStats,
    pub shards: Vec<ShardSnapshot>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub cache: Arc<Cache>,
    pub metrics: Arc<GatewayMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        pool_id: state.shard_state.pool_id(),
    })
}

/// Readiness endpoint - returns 200 if at least one shard is connected
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let shards_ready = state.shard_state.ready_shards();
    let is_ready = shards_ready > 0;

    let response = ReadyResponse {
        ready: is_ready,
        pool_id: state.shard_state.pool_id(),
        shards_total: state.shard_state.shard_count(),
        shards_ready,
        guilds_total: state.shard_state.total_guilds(),
        events_received: state.shard_state.total_events_received(),
        cache: state.cache.stats(),
        shards: state.shard_state.snapshots(),
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    // Gauges are sampled on scrape
    state.metrics.set_shards_ready(
        state.shard_state.pool_id(),
        state.shard_state.ready_shards(),
    );
    state.metrics.set_cache_entries(&state.cache.stats());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheFlags;
    use crate::model::User;
    use crate::shard::ShardStage;

    fn app_state() -> AppState {
        AppState {
            shard_state: ShardState::new(0, [0, 1], 2),
            cache: Arc::new(Cache::new(CacheFlags::all())),
            metrics: Arc::new(GatewayMetrics::detached()),
        }
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.3.0",
            pool_id: 0,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
    }

    #[tokio::test]
    async fn test_ready_requires_a_connected_shard() {
        let state = app_state();

        let response = ready_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.shard_state.set_stage(1, ShardStage::Heartbeating);
        let response = ready_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_ready_response_includes_cache_and_shards() {
        let state = app_state();
        state.cache.put_user(User::from_id(crate::model::Id::new(1)));

        let response = ReadyResponse {
            ready: false,
            pool_id: 0,
            shards_total: 2,
            shards_ready: 0,
            guilds_total: 0,
            events_received: 0,
            cache: state.cache.stats(),
            shards: state.shard_state.snapshots(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["cache"]["users"], 1);
        assert_eq!(json["shards"][1]["stage"], "idle");
    }
}
