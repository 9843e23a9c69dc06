/*!
 * Shutdown Watchdog
 *
 * OS thread armed for the duration of a shutdown sequence. If the sequence
 * has not disarmed it in time, the forced-exit policy runs from the thread
 * itself, which still works when hooks are blocking every runtime worker and
 * no async timer can fire.
 */

use crate::core::config::ForcedExit;
use crate::core::limits::FORCED_EXIT_CODE;
use crate::core::types::millis;
use flume::RecvTimeoutError;
use nix::sys::signal::{raise, Signal};
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

pub(crate) struct Watchdog {
    disarm: Option<flume::Sender<()>>,
}

impl Watchdog {
    /// Start a watchdog firing `policy` after `budget`
    pub(crate) fn arm(budget: Duration, policy: ForcedExit, shutdown_id: String) -> Self {
        let (tx, rx) = flume::bounded::<()>(1);
        let spawned = thread::Builder::new()
            .name("shutdown-watchdog".to_string())
            .spawn(move || match rx.recv_timeout(budget) {
                // Disarmed, or the sequence dropped us
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => {
                    error!(
                        %shutdown_id,
                        budget_ms = millis(budget),
                        "shutdown sequence hung past its deadline"
                    );
                    force_exit(policy);
                }
            });

        if let Err(e) = spawned {
            warn!(error = %e, "failed to start shutdown watchdog");
        }
        Self { disarm: Some(tx) }
    }

    pub(crate) fn disarm(mut self) {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel, which also disarms
        self.disarm.take();
    }
}

/// Apply the forced-exit policy; returns only for `ForcedExit::Disabled`
pub fn force_exit(policy: ForcedExit) {
    match policy {
        ForcedExit::Kill => {
            error!("forcing process exit with SIGKILL");
            if let Err(e) = raise(Signal::SIGKILL) {
                error!(error = %e, "SIGKILL to self failed, exiting");
            }
            std::process::exit(FORCED_EXIT_CODE);
        }
        ForcedExit::Exit(code) => {
            error!(code, "forcing process exit");
            std::process::exit(code);
        }
        ForcedExit::Disabled => {
            warn!("forced exit disabled; process left running");
        }
    }
}
