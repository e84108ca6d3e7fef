//! Domain error types for the gateway client
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, GatewayError>.
//!
//! Note that none of these are fatal to a shard: a `ShardConnection` logs
//! them, counts them and goes back to its reconnect loop. Only an explicit
//! shutdown stops a shard.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Gateway domain errors
///
/// Every variant carries structured context fields for diagnostics, so the
/// variant alone tells which shard and which step failed.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Dialing the gateway endpoint failed
    #[error("shard {shard_id} failed to connect to {url}")]
    Connect {
        shard_id: u32,
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    /// Reading from the transport failed
    #[error("shard {shard_id} transport read failed")]
    Receive {
        shard_id: u32,
        #[source]
        source: tungstenite::Error,
    },

    /// The outbound frame could not be handed to the transport
    #[error("shard {shard_id} could not send {op}: connection writer is gone")]
    Send { shard_id: u32, op: &'static str },

    /// An inbound payload could not be decoded
    #[error("failed to decode {context} payload")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// An outbound payload could not be serialized
    #[error("failed to encode {op} payload")]
    Encode {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Shard id is not below the total shard count
    #[error("shard {shard_id} is out of range for {total_shards} total shards")]
    InvalidShard { shard_id: u32, total_shards: u32 },

    /// Prometheus recorder could not be installed
    #[error("failed to install metrics recorder: {0}")]
    MetricsInstall(String),
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on the `gateway_errors_total` counter.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Receive { .. } => "receive",
            Self::Send { .. } => "send",
            Self::Decode { .. } => "decode",
            Self::Encode { .. } => "encode",
            Self::Config(_) => "config",
            Self::InvalidShard { .. } => "invalid_shard",
            Self::MetricsInstall(_) => "metrics_install",
        }
    }

    pub(crate) fn decode(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            context: context.into(),
            source,
        }
    }
}
