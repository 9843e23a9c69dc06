/*!
 * Signals Module
 * OS termination signals wired into the shutdown coordinator
 *
 * Handled: SIGINT, SIGTERM and SIGQUIT, plus `tokio::signal::ctrl_c` as a
 * fallback. The first one received triggers the shutdown sequence; later
 * ones attach to it.
 */

use crate::shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownReport};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Wait for a termination signal and return its name
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// Run `coordinator.shutdown` within `deadline` on the first signal
///
/// The returned task resolves to the report, or `None` if the signal
/// handlers could not be installed.
pub fn install_shutdown_handler(
    coordinator: ShutdownCoordinator,
    deadline: Duration,
) -> JoinHandle<Option<ShutdownReport>> {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(name) => {
                info!(signal = name, "termination signal received");
                let report = coordinator
                    .shutdown(ShutdownReason::Signal(name.to_string()), deadline)
                    .await;
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handlers");
                None
            }
        }
    })
}
