//! Collaboration client configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::reconnect::ReconnectPolicy;

/// Client configuration.
///
/// Every field has a default, so a JSON file only needs the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Base server URL (`ws://` or `wss://`), without the `/collaboration` path.
    pub server_url: String,
    /// Identity used in outbound frames. Generated once per service when unset.
    pub local_user_id: Option<String>,
    /// Upper bound on a single connect attempt.
    pub connect_timeout_ms: u64,
    /// WebSocket ping interval (None = no keepalive).
    pub keepalive_interval_ms: Option<u64>,
    /// Outbound frames buffered per connection before sends are dropped.
    pub outbound_buffer: usize,
    /// Drop inbound frames carrying our own user id.
    pub ignore_own_echoes: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3001".to_string(),
            local_user_id: None,
            connect_timeout_ms: 10_000,
            keepalive_interval_ms: Some(30_000),
            outbound_buffer: 256,
            ignore_own_echoes: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CollabConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "server_url must start with ws:// or wss://, got `{}`",
                self.server_url
            )));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid("outbound_buffer must be at least 1".into()));
        }
        if self.local_user_id.as_deref() == Some("") {
            return Err(ConfigError::Invalid("local_user_id must not be empty".into()));
        }
        self.reconnect.validate().map_err(ConfigError::Invalid)
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_local_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.local_user_id = Some(user_id.into());
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// URL of the collaboration channel for `file_id`.
    pub fn session_url(&self, file_id: &str) -> String {
        format!(
            "{}/collaboration/{}",
            self.server_url.trim_end_matches('/'),
            urlencoding::encode(file_id)
        )
    }
}
