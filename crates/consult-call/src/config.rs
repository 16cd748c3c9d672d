//! Client configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > consult.toml > defaults

use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};
use serde::Deserialize;

use crate::signaling::ReconnectPolicy;

/// Load the client configuration.
///
/// Environment variables use the `CONSULT` prefix with `__` as the section
/// separator, e.g. `CONSULT__SIGNALING__URL=wss://rooms.example.com`.
pub fn load() -> Result<ClientConfig, ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    with_defaults(config::Config::builder())?
        // Optional config file
        .add_source(config::File::with_name("consult").required(false))
        .add_source(
            config::Environment::with_prefix("CONSULT")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("signaling.url", "ws://localhost:4000")?
        .set_default("signaling.heartbeat_interval_secs", 25)?
        .set_default("reconnect.base_delay_ms", 1_000)?
        .set_default("reconnect.max_delay_ms", 30_000)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub signaling: SignalingConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// Room-coordination server WebSocket URL.
    pub url: String,
    /// WebSocket ping interval; keeps idle links from being reaped by proxies.
    pub heartbeat_interval_secs: u64,
}

impl SignalingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Give up after this many consecutive failed connects. Unset = never.
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}
