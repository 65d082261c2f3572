//! Structured logging for the Quay server.
//!
//! Console output is human-readable with uptime timestamps and targets.
//! A JSON log file can be enabled for machine parsing. The filter comes
//! from `RUST_LOG` when set, otherwise from the configured log level.

use std::path::Path;
use std::sync::Mutex;

use quay_config::Config;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// File name of the JSON log inside the log directory.
pub const LOG_FILE: &str = "quay.log";

const DEFAULT_FILTER: &str = "info";

/// Build the subscriber without installing it.
///
/// The JSON file layer is added only when `file_logging` is set and the
/// log file can be created; otherwise logging continues on the console.
pub fn build_subscriber(
    log_dir: Option<&Path>,
    file_logging: bool,
    config: Option<&Config>,
) -> impl tracing::Subscriber + Send + Sync + 'static {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let file_layer = file_logging
        .then_some(log_dir)
        .flatten()
        .and_then(open_log_file)
        .map(|file| {
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_timer(fmt::time::uptime())
                .json()
        });

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(console_layer)
        .with(file_layer)
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(
    log_dir: Option<&Path>,
    file_logging: bool,
    config: Option<&Config>,
) -> Result<(), TryInitError> {
    build_subscriber(log_dir, file_logging, config).try_init()
}

/// `RUST_LOG` if set, else the config's level, else `info`.
pub fn env_filter(config: Option<&Config>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(config)))
}

/// `info` for every target.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

fn filter_directive(config: Option<&Config>) -> &str {
    match config {
        Some(config) if !config.log.level.trim().is_empty() => config.log.level.trim(),
        _ => DEFAULT_FILTER,
    }
}

fn open_log_file(log_dir: &Path) -> Option<std::fs::File> {
    std::fs::create_dir_all(log_dir).ok()?;
    std::fs::File::create(log_dir.join(LOG_FILE)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        assert_eq!(default_env_filter().to_string(), "info");
        assert_eq!(filter_directive(None), "info");
    }

    #[test]
    fn test_config_level_used() {
        let mut config = Config::default();
        config.log.level = "debug,quay_net=trace".to_string();
        assert_eq!(filter_directive(Some(&config)), "debug,quay_net=trace");

        config.log.level = "  ".to_string();
        assert_eq!(filter_directive(Some(&config)), "info");
    }

    #[test]
    fn test_env_filter_parsing() {
        let directives = [
            "info",
            "debug,quay_net=trace",
            "warn,quay_net::tcp_server=debug",
            "error",
        ];
        for directive in directives {
            assert!(EnvFilter::try_new(directive).is_ok(), "failed to parse filter: {directive}");
        }
    }

    #[test]
    fn test_file_layer_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let subscriber = build_subscriber(Some(&log_dir), true, None);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(port = 7070, "listener ready");
        });

        let contents = std::fs::read_to_string(log_dir.join(LOG_FILE)).unwrap();
        let line = contents.lines().find(|l| l.contains("listener ready")).unwrap();
        let record: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(record["level"], "WARN");
        assert_eq!(record["fields"]["message"], "listener ready");
        assert_eq!(record["fields"]["port"], 7070);
    }

    #[test]
    fn test_file_logging_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let subscriber = build_subscriber(Some(dir.path()), false, None);
        tracing::subscriber::with_default(subscriber, || tracing::warn!("console only"));
        assert!(!dir.path().join(LOG_FILE).exists());
    }
}
