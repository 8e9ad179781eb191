//! Monitor configuration
//!
//! Loaded once from a TOML file at startup and never mutated afterwards.
//! `feed.url` and `storage.database_path` have no defaults; a file that omits
//! them is rejected.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub feed: FeedConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    pub storage: StorageConfig,
}

/// Streaming feed endpoint and connection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Base URL of the feed, e.g. `wss://api.gemini.com/v1/marketdata/btcusd`.
    pub url: String,

    /// `key=value` pairs appended to the URL query string.
    #[serde(default)]
    pub query_params: Vec<String>,

    /// Channels named in the subscribe handshake. Empty skips the handshake.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Instruments named in the subscribe handshake.
    #[serde(default)]
    pub product_ids: Vec<String>,

    /// Fixed wait between connection attempts.
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,

    /// Upper bound for a single connection attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Attempts a checkpoint capture makes before abandoning its cycle.
    #[serde(default = "default_checkpoint_max_attempts")]
    pub checkpoint_max_attempts: u32,

    /// How long a checkpoint capture waits for the snapshot message.
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
}

fn default_connect_retry_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_checkpoint_max_attempts() -> u32 {
    8
}

fn default_snapshot_timeout_ms() -> u64 {
    10_000
}

/// Timers for the two persistence workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Default is 12 hours.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,

    /// Put a batch that failed to persist back at the head of the buffer
    /// instead of dropping it.
    #[serde(default = "default_requeue_failed_flush")]
    pub requeue_failed_flush: bool,
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_checkpoint_interval_ms() -> u64 {
    12 * 60 * 60 * 1_000
}

fn default_requeue_failed_flush() -> bool {
    true
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            requeue_failed_flush: default_requeue_failed_flush(),
        }
    }
}

/// Where records are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database_path: String,

    #[serde(default = "default_change_table")]
    pub change_table: String,

    #[serde(default = "default_checkpoint_table")]
    pub checkpoint_table: String,

    #[serde(default = "default_checkpoint_times_table")]
    pub checkpoint_times_table: String,
}

fn default_change_table() -> String {
    "change_events".to_string()
}

fn default_checkpoint_table() -> String {
    "checkpoints".to_string()
}

fn default_checkpoint_times_table() -> String {
    "checkpoint_times".to_string()
}

impl StorageConfig {
    /// Storage settings with default table names.
    pub fn with_path(database_path: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
            change_table: default_change_table(),
            checkpoint_table: default_checkpoint_table(),
            checkpoint_times_table: default_checkpoint_times_table(),
        }
    }
}

impl MonitorConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.feed.url.trim();
        if url.is_empty() {
            return Err(ConfigError::Invalid("feed.url is empty".into()));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "feed.url must be a ws:// or wss:// URL, got '{}'",
                url
            )));
        }
        if !self.feed.channels.is_empty() && self.feed.product_ids.is_empty() {
            return Err(ConfigError::Invalid(
                "feed.product_ids must be set when feed.channels is set".into(),
            ));
        }
        if self.feed.checkpoint_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "feed.checkpoint_max_attempts must be at least 1".into(),
            ));
        }

        for (name, value) in [
            ("feed.connect_retry_ms", self.feed.connect_retry_ms),
            ("feed.connect_timeout_ms", self.feed.connect_timeout_ms),
            ("feed.snapshot_timeout_ms", self.feed.snapshot_timeout_ms),
            ("recorder.flush_interval_ms", self.recorder.flush_interval_ms),
            (
                "recorder.checkpoint_interval_ms",
                self.recorder.checkpoint_interval_ms,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }

        if self.storage.database_path.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.database_path is empty".into()));
        }

        // Table names are interpolated into SQL.
        let tables = [
            ("storage.change_table", &self.storage.change_table),
            ("storage.checkpoint_table", &self.storage.checkpoint_table),
            (
                "storage.checkpoint_times_table",
                &self.storage.checkpoint_times_table,
            ),
        ];
        for (name, table) in tables {
            if !is_sql_identifier(table) {
                return Err(ConfigError::Invalid(format!(
                    "{} '{}' is not a valid table name",
                    name, table
                )));
            }
        }
        let mut distinct: Vec<&String> = tables.iter().map(|(_, t)| *t).collect();
        distinct.sort();
        distinct.dedup();
        if distinct.len() != tables.len() {
            return Err(ConfigError::Invalid("storage table names must differ".into()));
        }

        Ok(())
    }

    /// Feed URL with the configured query parameters appended.
    pub fn feed_endpoint(&self) -> String {
        let base = self.feed.url.trim();
        let params: Vec<&str> = self
            .feed
            .query_params
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();

        if params.is_empty() {
            return base.to_string();
        }
        let sep = if base.contains('?') { '&' } else { '?' };
        format!("{}{}{}", base, sep, params.join("&"))
    }

    /// Subscribe handshake payload, if any channels are configured.
    pub fn subscribe_message(&self) -> Option<String> {
        if self.feed.channels.is_empty() {
            return None;
        }
        let channels: Vec<serde_json::Value> = self
            .feed
            .channels
            .iter()
            .map(|name| {
                serde_json::json!({
                    "name": name,
                    "product_ids": self.feed.product_ids,
                })
            })
            .collect();
        Some(
            serde_json::json!({
                "type": "subscribe",
                "channels": channels,
            })
            .to_string(),
        )
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.feed.connect_retry_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.feed.connect_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.feed.snapshot_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.recorder.flush_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.recorder.checkpoint_interval_ms)
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [feed]
        url = "wss://api.gemini.com/v1/marketdata/btcusd"

        [storage]
        database_path = "book.db"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = MonitorConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.feed.connect_retry_ms, 1_000);
        assert_eq!(config.feed.checkpoint_max_attempts, 8);
        assert_eq!(config.recorder.checkpoint_interval_ms, 43_200_000);
        assert!(config.recorder.requeue_failed_flush);
        assert_eq!(config.storage.change_table, "change_events");
        assert!(config.subscribe_message().is_none());
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let toml = r#"
            [feed]
            url = "wss://example.com/feed"
        "#;
        assert!(matches!(
            MonitorConfig::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_endpoint_appends_query_params() {
        let mut config = MonitorConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(
            config.feed_endpoint(),
            "wss://api.gemini.com/v1/marketdata/btcusd"
        );

        config.feed.query_params = vec!["heartbeat=true".into(), "top_of_book=false".into()];
        assert_eq!(
            config.feed_endpoint(),
            "wss://api.gemini.com/v1/marketdata/btcusd?heartbeat=true&top_of_book=false"
        );

        config.feed.url = "wss://example.com/feed?a=1".into();
        assert_eq!(
            config.feed_endpoint(),
            "wss://example.com/feed?a=1&heartbeat=true&top_of_book=false"
        );
    }

    #[test]
    fn test_subscribe_message_shape() {
        let toml = r#"
            [feed]
            url = "wss://api.gemini.com/v2/marketdata"
            channels = ["l2"]
            product_ids = ["BTCUSD"]

            [storage]
            database_path = "book.db"
        "#;
        let config = MonitorConfig::from_toml(toml).unwrap();
        let msg: serde_json::Value =
            serde_json::from_str(&config.subscribe_message().unwrap()).unwrap();
        assert_eq!(msg["type"], "subscribe");
        assert_eq!(msg["channels"][0]["name"], "l2");
        assert_eq!(msg["channels"][0]["product_ids"][0], "BTCUSD");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = MonitorConfig::from_toml(MINIMAL).unwrap();
        config.storage.change_table = "events; DROP TABLE x".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = MonitorConfig::from_toml(MINIMAL).unwrap();
        config.recorder.flush_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::from_toml(MINIMAL).unwrap();
        config.feed.url = "https://api.gemini.com".into();
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::from_toml(MINIMAL).unwrap();
        config.storage.checkpoint_table = config.storage.change_table.clone();
        assert!(config.validate().is_err());
    }
}
