//! Gateway configuration module
//!
//! Handles loading configuration from environment variables.

use crate::cache::CacheFlags;
use crate::error::GatewayError;
use crate::protocol::{ConnectionProperties, Intents};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Delay before answering an InvalidSession with a new handshake
pub const INVALID_SESSION_DELAY: Duration = Duration::from_secs(2);

/// Gateway configuration
#[derive(Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Pool ID for this gateway instance (0-indexed)
    /// Each pool manages SHARDS_PER_POOL shards
    pub pool_id: u64,

    /// Total number of shards across all pools
    pub total_shards: u32,

    /// Default gateway endpoint, without query string
    pub gateway_url: String,

    pub intents: Intents,

    /// Entity categories the cache keeps
    pub cache_flags: CacheFlags,

    /// Identify token-bucket capacity
    pub identify_concurrency: usize,

    /// Identify token-bucket refill interval
    pub identify_interval: Duration,

    pub reconnect_base: Duration,
    pub reconnect_max: Duration,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("discord_token", &"<redacted>")
            .field("pool_id", &self.pool_id)
            .field("total_shards", &self.total_shards)
            .field("gateway_url", &self.gateway_url)
            .field("intents", &self.intents)
            .field("cache_flags", &self.cache_flags)
            .field("identify_concurrency", &self.identify_concurrency)
            .field("identify_interval", &self.identify_interval)
            .field("reconnect_base", &self.reconnect_base)
            .field("reconnect_max", &self.reconnect_max)
            .field("http_port", &self.http_port)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let discord_token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map_err(|_| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let pool_id = parse_var("POOL_ID", 0)?;

        let total_shards = parse_var("TOTAL_SHARDS", 1)?;
        if total_shards == 0 {
            return Err(GatewayError::Config(
                "TOTAL_SHARDS must be at least 1".to_string(),
            ));
        }

        let gateway_url =
            env::var("GATEWAY_URL").unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string());

        let intents = match env::var("INTENTS") {
            Ok(raw) => {
                let bits = raw.trim().parse::<u64>().map_err(|e| {
                    GatewayError::Config(format!("INTENTS must be a numeric bitmask: {e}"))
                })?;
                Intents::from_bits_truncate(bits)
            }
            Err(_) => Self::default_intents(),
        };

        let cache_flags = match env::var("CACHE") {
            Ok(list) => CacheFlags::parse_list(&list)?,
            Err(_) => CacheFlags::all(),
        };

        let identify_concurrency = parse_var("IDENTIFY_CONCURRENCY", 1)?;
        let identify_interval = Duration::from_millis(parse_var("IDENTIFY_INTERVAL_MS", 5000)?);
        let reconnect_base = Duration::from_millis(parse_var("RECONNECT_BASE_MS", 1000)?);
        let reconnect_max = Duration::from_millis(parse_var("RECONNECT_MAX_MS", 60_000)?);

        let http_port = env::var("HTTP_PORT")
            .or_else(|_| env::var("METRICS_PORT")) // Backwards compat
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| {
                GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}"))
            })?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            discord_token,
            pool_id,
            total_shards,
            gateway_url,
            intents,
            cache_flags,
            identify_concurrency,
            identify_interval,
            reconnect_base,
            reconnect_max,
            http_port,
            log_level,
        })
    }

    /// Intents requested unless `INTENTS` overrides them
    ///
    /// GUILD_MEMBERS is privileged and must be enabled for the application.
    pub fn default_intents() -> Intents {
        Intents::GUILDS
            | Intents::GUILD_MEMBERS
            | Intents::GUILD_VOICE_STATES
            | Intents::GUILD_MESSAGES
    }

    /// Settings every shard connection in this process shares
    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            token: self.discord_token.clone(),
            intents: self.intents,
            gateway_url: self.gateway_url.clone(),
            properties: ConnectionProperties::default(),
            reconnect_base: self.reconnect_base,
            reconnect_max: self.reconnect_max,
            invalid_session_delay: INVALID_SESSION_DELAY,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T, GatewayError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{name} must be a valid number: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Per-connection settings
#[derive(Clone)]
pub struct ShardConfig {
    pub token: String,
    pub intents: Intents,
    pub gateway_url: String,
    pub properties: ConnectionProperties,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub invalid_session_delay: Duration,
}

impl ShardConfig {
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            properties: ConnectionProperties::default(),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            invalid_session_delay: INVALID_SESSION_DELAY,
        }
    }

    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max;
        self
    }

    pub fn with_invalid_session_delay(mut self, delay: Duration) -> Self {
        self.invalid_session_delay = delay;
        self
    }
}

impl fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("gateway_url", &self.gateway_url)
            .field("properties", &self.properties)
            .field("reconnect_base", &self.reconnect_base)
            .field("reconnect_max", &self.reconnect_max)
            .field("invalid_session_delay", &self.invalid_session_delay)
            .finish()
    }
}
