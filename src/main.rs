//! shardlink - sharded Discord gateway client
//!
//! - Manages multiple shards per process (shard pool)
//! - Mirrors guild state into an in-memory cache
//! - Exposes health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info};

use shardlink::events::{EventContext, HandlerError, ANY_EVENT};
use shardlink::health::{self, AppState};
use shardlink::{
    Cache, Event, EventDispatcher, GatewayConfig, GatewayMetrics, ShardPool, TokenBucket,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shardlink={}", gateway_config.log_level).parse()?)
                .add_directive("tokio_tungstenite=warn".parse()?)
                .add_directive("tungstenite=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pool_id = gateway_config.pool_id,
        total_shards = gateway_config.total_shards,
        "Starting shardlink"
    );

    let metrics = Arc::new(GatewayMetrics::install()?);
    info!("Prometheus metrics initialized");

    let cache = Arc::new(Cache::new(gateway_config.cache_flags));
    info!(flags = ?gateway_config.cache_flags, "Cache initialized");

    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::clone(&cache),
        Arc::clone(&metrics),
    ));
    register_handlers(&dispatcher);

    info!(intents = ?gateway_config.intents, "Using gateway intents");

    let limiter = Arc::new(TokenBucket::new(
        gateway_config.identify_concurrency,
        gateway_config.identify_interval,
    ));

    let pool = Arc::new(ShardPool::new(
        gateway_config.pool_id,
        gateway_config.total_shards,
        Arc::new(gateway_config.shard_config()),
        limiter,
        Arc::clone(&dispatcher),
        Arc::clone(&metrics),
    )?);

    let pool_state = pool.state();
    info!(
        pool_id = gateway_config.pool_id,
        shard_count = pool_state.shard_count(),
        "Shard pool created"
    );

    // Start health server
    let app_state = AppState {
        shard_state: pool_state,
        cache: Arc::clone(&cache),
        metrics: Arc::clone(&metrics),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();

    info!(port = gateway_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    let mut pool_task = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    // Run everything concurrently
    tokio::select! {
        result = &mut pool_task => {
            if let Err(e) = result {
                error!(error = %e, "Shard pool task failed");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down gateway...");

    pool.shutdown();
    if !pool_task.is_finished() {
        if let Err(e) = pool_task.await {
            error!(error = %e, "Shard pool task failed during shutdown");
        }
    }

    info!(stats = ?cache.stats(), "Gateway shutdown complete");
    Ok(())
}

/// Lifecycle logging on top of the cache mirroring the dispatcher always does
fn register_handlers(dispatcher: &EventDispatcher) {
    dispatcher.register(
        "GUILD_CREATE",
        |ctx: EventContext, event: Arc<Event>| async move {
            if let Event::GuildCreate(create) = event.as_ref() {
                info!(
                    shard_id = ctx.shard_id,
                    guild_id = %create.guild.id,
                    members = ctx.cache.guild_member_count(create.guild.id),
                    "Guild available"
                );
            }
            Ok::<_, HandlerError>(())
        },
    );

    dispatcher.register(
        "GUILD_DELETE",
        |ctx: EventContext, event: Arc<Event>| async move {
            if let Event::GuildDelete(guild) = event.as_ref() {
                info!(
                    shard_id = ctx.shard_id,
                    guild_id = %guild.id,
                    unavailable = guild.unavailable,
                    "Guild removed"
                );
            }
            Ok::<_, HandlerError>(())
        },
    );

    dispatcher.register(
        ANY_EVENT,
        |ctx: EventContext, event: Arc<Event>| async move {
            debug!(shard_id = ctx.shard_id, event_type = event.name(), "Event");
            Ok::<_, HandlerError>(())
        },
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
