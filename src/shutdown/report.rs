/*!
 * Shutdown Reports
 * What happened to every hook and handle during one shutdown sequence
 */

use super::hook::HookPriority;
use crate::core::errors::{HookError, ShutdownError};
use crate::handles::CleanupReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a shutdown was triggered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ShutdownReason {
    /// OS signal, e.g. `SIGTERM`
    Signal(String),
    Explicit(String),
    FatalError(String),
    TestTeardown,
    NormalExit,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(signal) => write!(f, "signal {}", signal),
            Self::Explicit(why) => write!(f, "requested: {}", why),
            Self::FatalError(error) => write!(f, "fatal error: {}", error),
            Self::TestTeardown => f.write_str("test teardown"),
            Self::NormalExit => f.write_str("normal exit"),
        }
    }
}

/// Lifecycle of a coordinator
///
/// ```text
/// idle -> collecting -> running -> finalizing -> { completed | forced_exit }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Nothing registered yet
    Idle,
    /// Hooks registered, shutdown not triggered
    Collecting,
    /// Hooks executing
    Running,
    /// Final handle sweep
    Finalizing,
    Completed,
    ForcedExit,
}

impl CoordinatorState {
    /// A sequence is in flight
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Finalizing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::ForcedExit)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::ForcedExit => "forced_exit",
        };
        f.write_str(s)
    }
}

/// Terminal state of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    Completed,
    Failed,
    TimedOut,
    Panicked,
    /// Never started: the global deadline ran out first
    Skipped,
}

/// Per-hook result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutcome {
    pub name: String,
    pub priority: HookPriority,
    pub status: HookStatus,
    /// Start time relative to the beginning of the sequence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_offset_ms: Option<u64>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HookError>,
}

impl HookOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == HookStatus::Completed
    }

    /// Finish time relative to the beginning of the sequence
    pub fn finished_offset_ms(&self) -> Option<u64> {
        self.started_offset_ms.map(|start| start + self.elapsed_ms)
    }
}

/// Result of `ShutdownCoordinator::shutdown`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub shutdown_id: String,
    pub reason: ShutdownReason,
    pub state: CoordinatorState,
    /// Hooks in the order they finished (skipped ones last)
    pub hooks: Vec<HookOutcome>,
    pub cleanup: CleanupReport,
    pub warnings: Vec<String>,
    pub deadline_ms: u64,
    pub elapsed_ms: u64,
    /// The global deadline was blown and the forced-exit path taken
    pub forced_exit: bool,
}

impl ShutdownReport {
    pub fn hook(&self, name: &str) -> Option<&HookOutcome> {
        self.hooks.iter().find(|h| h.name == name)
    }

    pub fn all_hooks_completed(&self) -> bool {
        self.hooks.iter().all(HookOutcome::is_completed)
    }

    /// Hooks that did not complete
    pub fn failed_hooks(&self) -> impl Iterator<Item = &HookOutcome> {
        self.hooks.iter().filter(|h| !h.is_completed())
    }

    pub fn hook_errors(&self) -> Vec<HookError> {
        self.hooks.iter().filter_map(|h| h.error.clone()).collect()
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Nothing failed, nothing was abandoned and nothing overran
    pub fn is_clean(&self) -> bool {
        self.all_hooks_completed() && self.cleanup.is_clean() && !self.forced_exit
    }

    /// The fatal error, when the global deadline was exceeded
    pub fn deadline_error(&self) -> Option<ShutdownError> {
        self.forced_exit.then(|| ShutdownError::DeadlineExceeded {
            elapsed_ms: self.elapsed_ms,
            deadline_ms: self.deadline_ms,
        })
    }

    pub fn summary(&self) -> ShutdownSummary {
        ShutdownSummary {
            abandoned_handles: self.cleanup.abandoned_count(),
            failed_handles: self.cleanup.failed_count(),
            failed_hooks: self.failed_hooks().map(|h| h.name.clone()).collect(),
            killed_processes: self.cleanup.killed_processes(),
            forced_exit: self.forced_exit,
        }
    }
}

/// What the CLI prints on exit; empty when everything went well
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownSummary {
    pub abandoned_handles: usize,
    pub failed_handles: usize,
    pub failed_hooks: Vec<String>,
    pub killed_processes: usize,
    pub forced_exit: bool,
}

impl ShutdownSummary {
    pub fn is_empty(&self) -> bool {
        self.abandoned_handles == 0
            && self.failed_handles == 0
            && self.failed_hooks.is_empty()
            && self.killed_processes == 0
            && !self.forced_exit
    }
}

impl fmt::Display for ShutdownSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }

        let mut parts = Vec::new();
        if self.abandoned_handles > 0 {
            parts.push(format!("{} handles abandoned", self.abandoned_handles));
        }
        if self.failed_handles > 0 {
            parts.push(format!("{} handles failed to close", self.failed_handles));
        }
        if !self.failed_hooks.is_empty() {
            parts.push(format!(
                "{} hooks failed ({})",
                self.failed_hooks.len(),
                self.failed_hooks.join(", ")
            ));
        }
        if self.killed_processes > 0 {
            parts.push(format!("{} processes killed", self.killed_processes));
        }
        if self.forced_exit {
            parts.push("deadline exceeded".to_string());
        }
        write!(f, "shutdown: {}", parts.join(", "))
    }
}
