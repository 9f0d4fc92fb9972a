//! Logging system setup.
//!
//! Initializes tracing-subscriber with either human-readable or JSON output,
//! honoring `RUST_LOG` when set.

use crate::config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system with the specified configuration.
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .init();
    }

    info!("🔧 Logging initialized with level: {}", config.level);
    Ok(())
}

/// Displays the startup banner through structured logging.
pub fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║           🏰 BASTION PANEL 🏰            ║");
    info!("║              Core v{version}                 ║");
    info!("║                                          ║");
    info!("║  Game Server Control Panel Core          ║");
    info!("║                                          ║");
    info!("║  🖥️  Persistent Console Sessions          ║");
    info!("║  📜 Streamed Log Ingest                  ║");
    info!("║  🔌 Sandboxed Plugin Reactors            ║");
    info!("║  ⚙️  Trigger→Step Workflows               ║");
    info!("║  🛡️  Capability-Gated Actions             ║");
    info!("║                                          ║");
    info!("╚══════════════════════════════════════════╝");
}
