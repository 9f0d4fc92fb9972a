//! # Bastion - Control Panel Core
//!
//! Real-time event and action core for administering running game servers.
//! This entry crate handles CLI parsing, configuration loading, logging
//! setup and application lifecycle; the subsystems live in their own
//! crates.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration (bastion.toml, created if missing)
//! bastion
//!
//! # Specify custom configuration
//! bastion --config production.toml
//!
//! # Override specific settings
//! bastion --data /var/lib/bastion --log-level debug
//!
//! # JSON logging for production
//! bastion --json-logs
//! ```
//!
//! ## Signal Handling
//!
//! The panel handles graceful shutdown on SIGINT (Ctrl+C) and SIGTERM; a
//! second signal during teardown forces an immediate exit.

use tracing::error;

mod app;
mod cli;
mod config;
mod logging;
mod signals;
mod store;
mod wiring;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Main entry point for the Bastion control panel.
///
/// 1. Command-line argument parsing
/// 2. Configuration loading and validation
/// 3. Logging system initialization
/// 4. Application creation and execution
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();

    // Apply CLI overrides before logging comes up.
    if let Some(data_dir) = &args.data_dir {
        config.data.data_dir = data_dir.to_string_lossy().to_string();
    }
    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }

    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(config).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {e:?}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}

// Re-export main types for potential library usage
pub use config::{AppConfig as Config, DataSettings, LimitSettings, LoggingSettings, ServerEntry};
