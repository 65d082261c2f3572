//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener and connection settings.
    pub server: ServerConfig,
    /// How inbound bytes are split into messages.
    pub framing: FramingConfig,
    /// Idle-session detection.
    pub keepalive: KeepAliveConfig,
    /// Which dispatcher handles messages.
    pub dispatch: DispatchConfig,
    /// Event bus sizing.
    pub events: EventsConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Listener and connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host or IP address to bind.
    pub host: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Maximum number of concurrent sessions.
    pub max_connections: usize,
    /// Upper bound on a single outbound write, in seconds.
    pub write_timeout_secs: u64,
    /// How long shutdown waits for sessions to close, in seconds.
    pub shutdown_grace_secs: u64,
    /// Pause after each handled message, in milliseconds.
    pub dispatch_delay_ms: u64,
    /// Inbound messages buffered per connection before the oldest is dropped.
    pub backpressure_capacity: usize,
}

/// Message framing strategy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    /// Newline-terminated text.
    #[default]
    Line,
    /// Terminated by a configurable single byte.
    Delimiter,
    /// 4-byte big-endian length header, then payload.
    LengthPrefixed,
}

/// Framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FramingConfig {
    pub strategy: FramingMode,
    /// Delimiter for the `delimiter` strategy. Must be a single-byte (ASCII) character.
    pub delimiter: char,
    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
}

/// Keep-alive configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Sessions idle longer than this are closed, in seconds.
    pub idle_timeout_secs: u64,
    /// How often idle sessions are swept, in seconds.
    pub sweep_interval_secs: u64,
}

/// Dispatch mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// `NAME arg1 arg2` text lines.
    Command,
    /// JSON objects routed by `type` and `command`.
    #[default]
    Structured,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per kind for slow subscribers.
    pub buffer: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or filter directive (e.g., "debug", "info,quay_net=trace").
    pub level: String,
    /// Also write JSON logs to a file in the log directory.
    pub file: bool,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7070,
            max_connections: 1024,
            write_timeout_secs: 5,
            shutdown_grace_secs: 5,
            dispatch_delay_ms: 0,
            backpressure_capacity: 1,
        }
    }
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            strategy: FramingMode::Line,
            delimiter: '\n',
            max_frame_size: 1024 * 1024,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            sweep_interval_secs: 10,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
        }
    }
}

// --- Derived values ---

impl ServerConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }
}

impl FramingConfig {
    /// The delimiter as a byte.
    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        u8::try_from(self.delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| ConfigError::Invalid {
                field: "framing.delimiter",
                reason: format!("{:?} is not a single-byte character", self.delimiter),
            })
    }
}

impl KeepAliveConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Check values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.framing.strategy == FramingMode::Delimiter {
            self.framing.delimiter_byte()?;
        }
        let positive = [
            ("server.max_connections", self.server.max_connections == 0),
            ("server.backpressure_capacity", self.server.backpressure_capacity == 0),
            ("framing.max_frame_size", self.framing.max_frame_size == 0),
            ("keepalive.idle_timeout_secs", self.keepalive.idle_timeout_secs == 0),
            ("keepalive.sweep_interval_secs", self.keepalive.sweep_interval_secs == 0),
            ("events.buffer", self.events.buffer == 0),
        ];
        match positive.into_iter().find(|(_, zero)| *zero) {
            Some((field, _)) => Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero".to_string(),
            }),
            None => Ok(()),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new().depth_limit(2);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Re-read the file: `Some(new_config)` if it differs from `self`, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let contents = std::fs::read_to_string(config_dir.join(CONFIG_FILE))
            .map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let ron_str =
            ron::ser::to_string_pretty(&Config::default(), ron::ser::PrettyConfig::new()).unwrap();
        assert!(ron_str.contains("port: 7070"));
        assert!(ron_str.contains("strategy: line"));
        assert!(ron_str.contains("mode: structured"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.framing.strategy = FramingMode::LengthPrefixed;
        config.framing.delimiter = '|';
        config.dispatch.mode = DispatchMode::Command;
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let ron_str = "(server: (port: 9000), framing: (strategy: delimiter, delimiter: ';'))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.framing.strategy, FramingMode::Delimiter);
        assert_eq!(config.framing.delimiter_byte().unwrap(), b';');
        assert_eq!(config.keepalive, KeepAliveConfig::default());
        assert_eq!(config.dispatch.mode, DispatchMode::Structured);
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_derived_durations() {
        let config = Config::default();
        assert_eq!(config.keepalive.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.keepalive.sweep_interval(), Duration::from_secs(10));
        assert_eq!(config.server.write_timeout(), Duration::from_secs(5));
        assert_eq!(config.server.dispatch_delay(), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.framing.strategy = FramingMode::Delimiter;
        config.framing.delimiter = 'é';
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "framing.delimiter", .. })
        ));

        let mut config = Config::default();
        config.server.backpressure_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "server.backpressure_capacity", .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.port = 9999;
        config.log.file = true;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.keepalive.idle_timeout_secs = 90;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.keepalive.idle_timeout_secs, 90);
        assert!(reloaded.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_ron_comments_allowed() {
        let ron_str = "// server settings\n(\n  // nothing overridden\n)";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config, Config::default());
    }
}
