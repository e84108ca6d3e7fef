//! Single funnel for decoded events from every shard
//!
//! `dispatch` runs on the calling shard's read loop: it decodes, updates the
//! cache, then hands the event to each registered handler on its own task.
//! Calls from one shard therefore hit the cache in receive order, while a
//! slow handler never holds up any read loop.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{update, Event};
use crate::cache::Cache;
use crate::metrics::GatewayMetrics;

/// Event name that matches every dispatch
pub const ANY_EVENT: &str = "*";

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler gets besides the event itself
#[derive(Clone)]
pub struct EventContext {
    pub shard_id: u32,
    pub cache: Arc<Cache>,
}

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: EventContext, event: Arc<Event>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(EventContext, Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: EventContext, event: Arc<Event>) -> Result<(), HandlerError> {
        (self)(ctx, event).await
    }
}

pub struct EventDispatcher {
    cache: Arc<Cache>,
    handlers: DashMap<String, Vec<Arc<dyn EventHandler>>>,
    metrics: Arc<GatewayMetrics>,
}

impl EventDispatcher {
    pub fn new(cache: Arc<Cache>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            cache,
            handlers: DashMap::new(),
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Run `handler` for every dispatch named `event_type` (e.g.
    /// `MESSAGE_CREATE`), or for all of them with [`ANY_EVENT`].
    pub fn register(&self, event_type: impl Into<String>, handler: impl EventHandler) {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, |handlers| handlers.len())
    }

    /// Decode a dispatch, mirror it into the cache and fan it out.
    ///
    /// Undecodable payloads are logged and dropped; the decoded event is
    /// returned so the connection can react to session-level events.
    pub fn dispatch(&self, shard_id: u32, event_type: &str, payload: Value) -> Option<Arc<Event>> {
        self.metrics.record_event(shard_id, event_type);

        let event = match Event::decode(event_type, payload) {
            Ok(event) => Arc::new(event),
            Err(e) => {
                warn!(shard_id, event_type, error = %e, "Discarding undecodable dispatch");
                self.metrics.record_error(shard_id, e.error_type_label());
                return None;
            }
        };

        update::apply(&self.cache, &event);

        let handlers = self.handlers_for(event_type);

        if !handlers.is_empty() {
            debug!(shard_id, event_type, handlers = handlers.len(), "Running handlers");
        }

        for handler in handlers {
            let ctx = EventContext {
                shard_id,
                cache: Arc::clone(&self.cache),
            };
            let event = Arc::clone(&event);
            let metrics = Arc::clone(&self.metrics);

            tokio::spawn(async move {
                if let Err(e) = handler.handle(ctx, Arc::clone(&event)).await {
                    error!(shard_id, event_type = event.name(), error = %e, "Event handler failed");
                    metrics.record_handler_failure(event.name());
                }
            });
        }

        Some(event)
    }

    fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut handlers = Vec::new();

        if let Some(specific) = self.handlers.get(event_type) {
            handlers.extend(specific.iter().cloned());
        }

        if let Some(any) = self.handlers.get(ANY_EVENT) {
            handlers.extend(any.iter().cloned());
        }

        handlers
    }
}
