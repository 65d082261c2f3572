//! Quay TCP application server.
//!
//! Run with: `cargo run -p quay-server -- --port 7070 --mode command`

mod app;
mod handlers;
mod platform;

use clap::Parser;
use quay_config::{CliArgs, Config};

use crate::platform::PlatformDirs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let dirs = match args.config.clone() {
        Some(dir) => PlatformDirs::from_config_dir(dir),
        None => PlatformDirs::resolve()?,
    };
    if let Err(e) = dirs.create_dirs() {
        eprintln!("Failed to create {}: {e}", dirs.config_dir.display());
    }

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&dirs.config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    if let Err(e) = quay_log::init_logging(Some(&dirs.log_dir), config.log.file, Some(&config)) {
        eprintln!("Failed to initialize logging: {e}");
    }

    app::run(config).await
}
