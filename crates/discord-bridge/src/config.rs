use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use discord_bridge_protocol::ChannelId;

use crate::adapter::{AdapterConfig, PrefixPolicy};
use crate::delivery::{DISCORD_MAX_MESSAGE_CHARS, DeliveryConfig, seconds};
use crate::queue::OverflowPolicy;
use crate::reconnect::ReconnectPolicy;

/// Environment variable that overrides `discord_token`.
pub const TOKEN_ENV_VAR: &str = "DISCORD_TOKEN";

/// Token value shipped in the example config.
const PLACEHOLDER_TOKEN: &str = "YOUR_DISCORD_BOT_TOKEN_HERE";

// ============================================================================
// BridgeConfig (root)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub discord_token: String,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Empty allows every channel.
    #[serde(default, deserialize_with = "deserialize_channel_ids")]
    pub allowed_channel_ids: Vec<ChannelId>,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay: f64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: f64,
    #[serde(default)]
    pub prefix_policy: PrefixPolicy,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// How long `stop` waits for consumers to drain the queue.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: f64,
}

impl BridgeConfig {
    /// Defaults everywhere except the token.
    pub fn new(discord_token: impl Into<String>) -> Self {
        Self {
            discord_token: discord_token.into(),
            command_prefix: default_command_prefix(),
            allowed_channel_ids: Vec::new(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay: default_reconnect_base_delay(),
            reconnect_max_delay: default_reconnect_max_delay(),
            prefix_policy: PrefixPolicy::default(),
            queue: QueueConfig::default(),
            delivery: DeliveryConfig::default(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }

    /// Read, parse and validate a YAML config file.
    ///
    /// `DISCORD_TOKEN` in the environment replaces the file's token.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let mut config = Self::parse(&contents)?;
        config.apply_token_override(std::env::var(TOKEN_ENV_VAR).ok());
        config.validate()?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse and validate YAML text. No environment overrides.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(serde_saphyr::from_str(contents)?)
    }

    fn apply_token_override(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            debug!("Using bot token from {TOKEN_ENV_VAR}");
            self.discord_token = token;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let token = self.discord_token.trim();
        if token.is_empty() || token == PLACEHOLDER_TOKEN {
            return invalid("discord_token must be set to a real bot token");
        }

        let prefix_len = self.command_prefix.chars().count();
        if !(1..=10).contains(&prefix_len) {
            return invalid("command_prefix must be 1 to 10 characters");
        }

        if !(1..=20).contains(&self.max_reconnect_attempts) {
            return invalid("max_reconnect_attempts must be between 1 and 20");
        }
        if !(0.1..=60.0).contains(&self.reconnect_base_delay) {
            return invalid("reconnect_base_delay must be between 0.1 and 60 seconds");
        }
        if !self.reconnect_max_delay.is_finite()
            || self.reconnect_max_delay < self.reconnect_base_delay
        {
            return invalid("reconnect_max_delay must not be below reconnect_base_delay");
        }

        if self.queue.capacity == 0 {
            return invalid("queue.capacity must be at least 1");
        }

        let delivery = &self.delivery;
        if !(1..=DISCORD_MAX_MESSAGE_CHARS).contains(&delivery.max_chunk_chars) {
            return invalid(format!(
                "delivery.max_chunk_chars must be between 1 and {DISCORD_MAX_MESSAGE_CHARS}"
            ));
        }
        if delivery.max_send_attempts == 0 {
            return invalid("delivery.max_send_attempts must be at least 1");
        }
        if !non_negative(delivery.chunk_delay_seconds) || !non_negative(delivery.retry_delay_seconds)
        {
            return invalid("delivery delays must be non-negative");
        }

        if !non_negative(self.shutdown_grace_seconds) {
            return invalid("shutdown_grace_seconds must be non-negative");
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts.max(1),
            base_delay: seconds(self.reconnect_base_delay),
            max_delay: seconds(self.reconnect_max_delay),
        }
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            prefix: self.command_prefix.clone(),
            allowed_channels: self.allowed_channel_ids.iter().copied().collect::<HashSet<_>>(),
            prefix_policy: self.prefix_policy,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_seconds)
    }
}

fn invalid(message: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn default_command_prefix() -> String {
    "!".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay() -> f64 {
    1.0
}

fn default_reconnect_max_delay() -> f64 {
    60.0
}

fn default_shutdown_grace() -> f64 {
    5.0
}

/// Accepts numbers and numeric strings.
fn deserialize_channel_ids<'de, D>(deserializer: D) -> Result<Vec<ChannelId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    let raw: Option<Vec<RawId>> = Option::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|id| match id {
            RawId::Number(n) => Ok(ChannelId(n)),
            RawId::Text(s) => s
                .trim()
                .parse::<u64>()
                .map(ChannelId)
                .map_err(|_| D::Error::custom(format!("invalid channel id: {s:?}"))),
        })
        .collect()
}

// ============================================================================
// QueueConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

fn default_queue_capacity() -> usize {
    100
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("config file is empty")]
    Empty,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Tests
// ============================================================================
