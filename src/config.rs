use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::backoff::Backoff;
use crate::chat::machine::DEFAULT_MAX_RETRIES;
use crate::chat::ChatError;

/// WebSocket endpoint path on the backend.
const WS_PATH: &str = "/ws";

/// Status endpoint path on the backend.
const STATUS_PATH: &str = "/status";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Backend base URL, e.g. "http://192.168.49.2:30090".
    /// ws:// and wss:// are accepted too. Supports ${ENV_VAR} substitution.
    pub url: String,
    /// Overrides the status endpoint derived from `url`.
    #[serde(default)]
    pub status_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive reconnects before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_status_enabled() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl ServerConfig {
    /// WebSocket endpoint: the base URL with a ws/wss scheme and path `/ws`.
    pub fn ws_url(&self) -> Result<Url, ChatError> {
        let mut url = Url::parse(&self.url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ChatError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ChatError::UnsupportedScheme(scheme.to_string()))?;
        url.set_path(WS_PATH);
        url.set_query(None);
        Ok(url)
    }

    /// Status endpoint: `status_url` if set, else the base URL with an
    /// http/https scheme and path `/status`.
    pub fn status_url(&self) -> Result<Url, ChatError> {
        if let Some(explicit) = &self.status_url {
            return Ok(Url::parse(explicit)?);
        }
        let mut url = Url::parse(&self.url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "http",
            "https" | "wss" => "https",
            other => return Err(ChatError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ChatError::UnsupportedScheme(scheme.to_string()))?;
        url.set_path(STATUS_PATH);
        url.set_query(None);
        Ok(url)
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            2,
        )
    }
}

impl StatusConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses and validates TOML, expanding variables like ${CHAT_SERVER_URL}.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ChatError> {
        self.server.ws_url()?;
        if self.status.enabled {
            self.server.status_url()?;
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ChatError::Config(
                "reconnect.base_delay_ms must be greater than 0".into(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ChatError::Config(
                "reconnect.max_delay_ms must not be below reconnect.base_delay_ms".into(),
            ));
        }
        if self.status.poll_interval_secs == 0 {
            return Err(ChatError::Config(
                "status.poll_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
