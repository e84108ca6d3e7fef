//! Gateway envelope and the payloads carried inside it

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Intents, OpCode};
use crate::error::GatewayError;
use crate::model::{UnavailableGuild, User};

/// Gateway API version requested on connect
pub const API_VERSION: u8 = 10;

/// Members above this count are not sent with `GUILD_CREATE`
pub const LARGE_THRESHOLD: u64 = 250;

/// Inbound envelope: `{op, d, s, t}`
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayload {
    pub op: OpCode,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn decode(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::decode("gateway envelope", e))
    }
}

#[derive(Serialize)]
struct Outbound<'a, T> {
    op: OpCode,
    d: &'a T,
}

fn encode<T: Serialize>(op: OpCode, d: &T) -> Result<String, GatewayError> {
    serde_json::to_string(&Outbound { op, d }).map_err(|source| GatewayError::Encode {
        op: op.name(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HelloPayload {
    /// Milliseconds between heartbeats
    pub heartbeat_interval: u64,
}

/// Client labels sent along with Identify
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

// no Debug: carries the token
#[derive(Clone, Serialize)]
pub struct IdentifyPayload<'a> {
    pub token: &'a str,
    pub properties: &'a ConnectionProperties,
    pub shard: [u32; 2],
    pub intents: u64,
    pub large_threshold: u64,
    pub compress: bool,
}

impl<'a> IdentifyPayload<'a> {
    pub fn new(
        token: &'a str,
        properties: &'a ConnectionProperties,
        shard_id: u32,
        total_shards: u32,
        intents: Intents,
    ) -> Self {
        Self {
            token,
            properties,
            shard: [shard_id, total_shards],
            intents: intents.bits(),
            large_threshold: LARGE_THRESHOLD,
            compress: false,
        }
    }

    pub fn encode(&self) -> Result<String, GatewayError> {
        encode(OpCode::Identify, self)
    }
}

#[derive(Clone, Serialize)]
pub struct ResumePayload<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: u64,
}

impl ResumePayload<'_> {
    pub fn encode(&self) -> Result<String, GatewayError> {
        encode(OpCode::Resume, self)
    }
}

/// Heartbeat frame carrying the last seen sequence, `null` before the first dispatch
pub fn heartbeat(sequence: u64) -> Result<String, GatewayError> {
    let d = (sequence > 0).then_some(sequence);
    encode(OpCode::Heartbeat, &d)
}

/// `READY` dispatch body
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    #[serde(default, rename = "v")]
    pub version: u8,
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}
