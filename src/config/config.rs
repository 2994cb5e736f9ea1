use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use url::Url;

use crate::session::Session;

pub const TENANT_PLACEHOLDER: &str = "{tenant_id}";
pub const USER_PLACEHOLDER: &str = "{user_id}";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid endpoint {endpoint}: {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("invalid reconnect policy: {0}")]
    Reconnect(String),

    #[error("invalid timeout: {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Live event channel settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// WebSocket URL template, `{tenant_id}` and `{user_id}` come from the session
    pub endpoint: String,
    pub connect_timeout_ms: u64,
    /// How long `stop()` waits for a graceful close before dropping the socket
    pub close_timeout_ms: u64,
    /// Ping period while open, `None` disables keep-alive pings
    pub heartbeat_interval_ms: Option<u64>,
    /// Silence longer than this is treated as a dead connection
    pub idle_timeout_ms: Option<u64>,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Upward jitter as a fraction of the exponential delay (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8000/ws/{tenant_id}/{user_id}".to_string(),
            connect_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
            heartbeat_interval_ms: Some(30_000),
            idle_timeout_ms: Some(90_000),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.channel.validate()?;
        Ok(config)
    }

    pub fn get_version(&self) -> &str {
        &self.version
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let probe = self
            .endpoint
            .replace(TENANT_PLACEHOLDER, "tenant")
            .replace(USER_PLACEHOLDER, "user");
        parse_ws_url(&self.endpoint, &probe)?;

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Timeout("connect_timeout_ms must be positive".to_string()));
        }
        if self.idle_timeout_ms == Some(0) {
            return Err(ConfigError::Timeout("idle_timeout_ms must be positive when set".to_string()));
        }

        self.reconnect.validate()
    }

    /// Resolve the endpoint for a session. The token travels as the `token`
    /// query parameter, so the returned URL must not be logged as-is.
    pub fn endpoint_for(&self, session: &Session) -> Result<Url, ConfigError> {
        for value in [&session.user.tenant_id, &session.user.id] {
            if value.is_empty() || value.contains(['/', '?', '#']) {
                return Err(ConfigError::Endpoint {
                    endpoint: self.endpoint.clone(),
                    reason: format!("cannot address session identity {:?}", value),
                });
            }
        }

        let address = self
            .endpoint
            .replace(TENANT_PLACEHOLDER, &session.user.tenant_id)
            .replace(USER_PLACEHOLDER, &session.user.id);
        let mut url = parse_ws_url(&self.endpoint, &address)?;
        url.query_pairs_mut().append_pair("token", &session.token);
        Ok(url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::Reconnect("base_delay_ms must be positive".to_string()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Reconnect(format!(
                "max_delay_ms ({}) is below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Reconnect("multiplier must be at least 1.0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::Reconnect("jitter_factor must be within 0.0..=1.0".to_string()));
        }
        Ok(())
    }
}

fn parse_ws_url(template: &str, address: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::Endpoint {
        endpoint: template.to_string(),
        reason,
    };

    let url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(invalid(format!("unsupported scheme {}", other))),
    }
}
