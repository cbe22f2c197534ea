//! Indriya - sensor hub daemon
//!
//! Multiplexes client subscriptions onto one sensor driver connection:
//! clients enable sensors at their own rates, the hub programs the hardware
//! at the fastest requested rate and downsamples and batches per client.

use indriya::app::HubApp;
use indriya::config::HubConfig;
use indriya::error::Result;
use std::env;
use std::path::Path;

/// Parse config path from command line arguments.
///
/// Supports:
/// - `indriya <path>` (positional)
/// - `indriya --config <path>` (flag-based)
/// - `indriya -c <path>` (short flag)
///
/// Defaults to `/etc/indriya.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    "/etc/indriya.toml".to_string()
}

fn main() -> Result<()> {
    let config_path = parse_config_path();
    let config = HubConfig::load_or_default(&config_path)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    log::info!("Indriya v{} starting...", env!("CARGO_PKG_VERSION"));
    if Path::new(&config_path).exists() {
        log::info!("Using config: {}", config_path);
    } else {
        log::warn!("Config {} not found, using defaults", config_path);
    }
    log::info!("Driver backend: {}", config.driver.backend);

    let mut app = HubApp::new(config)?;
    app.run()?;

    log::info!("Indriya stopped");
    Ok(())
}
