//! Termination-signal handling.
//!
//! Bastion's teardown is phased (stop intake, drain deliveries, stop
//! reactors, stop connectors), so the signal layer stays thin: it flips the
//! shared [`ShutdownState`] and returns, and the composition root drives
//! the phases. A second signal while teardown is already running skips the
//! remaining phases and exits immediately.

use bastion_events::ShutdownState;
use tokio::signal;
use tracing::{info, warn};

/// Blocks until SIGINT or SIGTERM (Ctrl+C on Windows), then initiates
/// shutdown on the given state.
pub async fn wait_for_shutdown(shutdown: &ShutdownState) -> std::io::Result<()> {
    wait_for_signal().await?;
    shutdown.initiate_shutdown();
    info!("📡 Termination signal received - starting phased teardown");
    Ok(())
}

/// Arms the fast-exit path: one more termination signal kills the process
/// without waiting for the remaining teardown phases.
pub fn arm_fast_exit() {
    tokio::spawn(async {
        if wait_for_signal().await.is_ok() {
            warn!("Second termination signal - skipping remaining teardown phases");
            std::process::exit(1);
        }
    });
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(windows)]
    signal::ctrl_c().await?;

    Ok(())
}
