//! Command-line argument parsing for the Quay server.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, DispatchMode, FramingMode};

/// Quay server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "quay", about = "Quay TCP application server", version)]
pub struct CliArgs {
    /// Address to bind.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Message framing strategy.
    #[arg(long, value_enum)]
    pub framing: Option<FramingMode>,

    /// Delimiter byte for `--framing delimiter`.
    #[arg(long)]
    pub delimiter: Option<char>,

    /// Dispatch mode.
    #[arg(long, value_enum)]
    pub mode: Option<DispatchMode>,

    /// Idle timeout in seconds before a session is closed.
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(framing) = args.framing {
            self.framing.strategy = framing;
        }
        if let Some(delimiter) = args.delimiter {
            self.framing.delimiter = delimiter;
        }
        if let Some(mode) = args.mode {
            self.dispatch.mode = mode;
        }
        if let Some(secs) = args.idle_timeout {
            self.keepalive.idle_timeout_secs = secs;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}
