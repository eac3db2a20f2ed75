//! # Channel Configuration
//!
//! One explicit [`ChannelConfig`] is built by the caller and handed to the
//! channel; nothing reads process-wide state after construction.
//!
//! Precedence, lowest first: defaults, TOML file, environment
//! (`ARCHLINK_URI`, `ARCHLINK_API_KEY`), then whatever the caller sets with the
//! `with_*` builders.

use crate::error::{self, Result};
use crate::gate::DEFAULT_CRITICAL_ACTIONS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_URI: &str = "ARCHLINK_URI";
pub const ENV_API_KEY: &str = "ARCHLINK_API_KEY";

pub const DEFAULT_URI: &str = "ws://localhost:8080/unity";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Remote host endpoint
    pub uri: String,
    /// Credential sent in the handshake and the upgrade request
    pub api_key: String,
    /// Monitor tick between reconnect attempts
    pub reconnect_interval_secs: u64,
    /// Default wait for a correlated response
    pub response_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// A transport write stalled longer than this faults the link
    pub write_timeout_secs: u64,
    /// Outbound queue bound; `None` means unbounded
    pub queue_capacity: Option<usize>,
    /// Transmission attempts before a command is reported undeliverable
    pub max_delivery_attempts: u32,
    /// Action kinds withheld from autonomous dispatch
    pub critical_actions: Vec<String>,
    /// Match id-less replies to the oldest transmitted request
    pub legacy_correlation: bool,
    /// Reject unrecognised message categories
    pub strict_categories: bool,
    /// Start the autonomous action processor
    pub autonomous_mode: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            api_key: String::new(),
            reconnect_interval_secs: 5,
            response_timeout_secs: 30,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            write_timeout_secs: 10,
            queue_capacity: None,
            max_delivery_attempts: 5,
            critical_actions: DEFAULT_CRITICAL_ACTIONS.iter().map(|s| s.to_string()).collect(),
            legacy_correlation: true,
            strict_categories: false,
            autonomous_mode: false,
        }
    }
}

impl ChannelConfig {
    pub fn new(uri: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| {
            error::parse_error(format!("invalid channel config: {}", e))
                .with_operation("config::from_toml_str")
                .set_source(e)
        })
    }

    /// Load a TOML file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::error::Error::from(e)
                .with_operation("config::load")
                .with_context("path", path.display().to_string())
        })?;
        let config = Self::from_toml_str(&contents)?.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `ARCHLINK_URI` / `ARCHLINK_API_KEY` when set
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(uri) = lookup(ENV_URI).filter(|v| !v.is_empty()) {
            self.uri = uri;
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.is_empty()) {
            self.api_key = key;
        }
        self
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            error::serialization_error(e.to_string())
                .with_operation("config::to_toml_string")
                .set_source(e)
        })
    }

    pub fn validate(&self) -> Result<()> {
        let problem = if self.uri.trim().is_empty() {
            Some("uri must not be empty")
        } else if self.reconnect_interval_secs == 0 {
            Some("reconnect_interval_secs must be positive")
        } else if self.response_timeout_secs == 0 {
            Some("response_timeout_secs must be positive")
        } else if self.connect_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            Some("connect and handshake timeouts must be positive")
        } else if self.write_timeout_secs == 0 {
            Some("write_timeout_secs must be positive")
        } else if self.queue_capacity == Some(0) {
            Some("queue_capacity must be positive when set")
        } else if self.max_delivery_attempts == 0 {
            Some("max_delivery_attempts must be positive")
        } else {
            None
        };

        match problem {
            Some(reason) => Err(error::config_invalid(reason).with_operation("config::validate")),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Builders
    // ========================================================================

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_reconnect_interval(mut self, secs: u64) -> Self {
        self.reconnect_interval_secs = secs;
        self
    }

    pub fn with_response_timeout(mut self, secs: u64) -> Self {
        self.response_timeout_secs = secs;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn with_critical_actions<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_actions = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_legacy_correlation(mut self, enabled: bool) -> Self {
        self.legacy_correlation = enabled;
        self
    }

    // ========================================================================
    // Durations
    // ========================================================================

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.response_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.critical_actions.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ChannelConfig::from_toml_str(
            r#"
            uri = "ws://engine:9000/ws"
            queue_capacity = 64
            critical_actions = ["delete_environment"]
            "#,
        )
        .unwrap();

        assert_eq!(config.uri, "ws://engine:9000/ws");
        assert_eq!(config.queue_capacity, Some(64));
        assert_eq!(config.critical_actions, vec!["delete_environment".to_string()]);
        assert_eq!(config.response_timeout_secs, 30);
    }

    #[test]
    fn test_bad_toml() {
        let err = ChannelConfig::from_toml_str("uri = [").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseFailed);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "uri = \"ws://from-file\"\nresponse_timeout_secs = 3").unwrap();

        let config = ChannelConfig::load(file.path()).unwrap();
        assert_eq!(config.response_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChannelConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }

    #[test]
    fn test_overrides() {
        let config = ChannelConfig::default().with_overrides_from(|key| match key {
            ENV_URI => Some("ws://override".to_string()),
            ENV_API_KEY => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.uri, "ws://override");
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let err = ChannelConfig::default().with_queue_capacity(0).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);

        assert!(ChannelConfig::default().with_max_delivery_attempts(0).validate().is_err());
        assert!(ChannelConfig::default().with_uri(" ").validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ChannelConfig::new("ws://a", "k").with_queue_capacity(8);
        let text = config.to_toml_string().unwrap();
        assert_eq!(ChannelConfig::from_toml_str(&text).unwrap(), config);
    }
}
