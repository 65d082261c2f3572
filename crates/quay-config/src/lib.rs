//! Configuration for the Quay server.
//!
//! Settings persist to disk as RON (`config.ron`), every section falls back
//! to its defaults when missing, and command-line flags override the file.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DispatchConfig, DispatchMode, EventsConfig, FramingConfig, FramingMode, KeepAliveConfig,
    LogConfig, ServerConfig,
};
pub use error::ConfigError;
