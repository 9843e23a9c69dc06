/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 *
 * Per-resource and per-hook failures are data: they are captured into
 * `CleanupReport` / `ShutdownReport` rather than propagated. Only
 * `ShutdownError::DeadlineExceeded` is fatal at the process level.
 */

use crate::core::id::{HandleId, RunId};
use crate::core::types::Pid;
use crate::handles::HandleKind;
use crate::shutdown::HookPriority;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors recorded while force-closing tracked handles
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum HandleError {
    #[error("Handle {handle_id} ({kind}) failed to close: {cause}")]
    #[diagnostic(
        code(handle::close_failed),
        help("The close operation returned an error. Cleanup continued with the remaining handles.")
    )]
    CloseFailed {
        handle_id: HandleId,
        kind: HandleKind,
        cause: String,
    },

    #[error("Handle {handle_id} ({kind}) panicked while closing")]
    #[diagnostic(
        code(handle::close_panicked),
        help("A close operation panicked. The panic was contained and the handle dropped.")
    )]
    ClosePanicked { handle_id: HandleId, kind: HandleKind },

    #[error("Handle {handle_id} ({kind}) abandoned after {budget_ms}ms")]
    #[diagnostic(
        code(handle::abandoned),
        help("The close operation did not return within its share of the cleanup deadline.")
    )]
    Abandoned {
        handle_id: HandleId,
        kind: HandleKind,
        budget_ms: u64,
    },
}

impl HandleError {
    pub fn handle_id(&self) -> HandleId {
        match self {
            Self::CloseFailed { handle_id, .. }
            | Self::ClosePanicked { handle_id, .. }
            | Self::Abandoned { handle_id, .. } => *handle_id,
        }
    }
}

/// Runtime failures of individual shutdown hooks
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum HookError {
    #[error("Hook '{name}' failed: {cause}")]
    #[diagnostic(
        code(hook::failed),
        help("The hook returned an error. Its dependents were still allowed to run.")
    )]
    Failed { name: String, cause: String },

    #[error("Hook '{name}' timed out after {timeout_ms}ms")]
    #[diagnostic(
        code(hook::timed_out),
        help("The hook was abandoned. Raise its timeout or make the action bounded.")
    )]
    TimedOut { name: String, timeout_ms: u64 },

    #[error("Hook '{name}' panicked")]
    #[diagnostic(code(hook::panicked))]
    Panicked { name: String },

    #[error("Hook '{name}' skipped: {reason}")]
    #[diagnostic(
        code(hook::skipped),
        help("The global shutdown deadline was exhausted before the hook could start.")
    )]
    Skipped { name: String, reason: String },
}

impl HookError {
    pub fn name(&self) -> &str {
        match self {
            Self::Failed { name, .. }
            | Self::TimedOut { name, .. }
            | Self::Panicked { name }
            | Self::Skipped { name, .. } => name,
        }
    }
}

/// Errors raised while registering shutdown hooks
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum RegistrationError {
    #[error("Hook '{0}' is already registered")]
    #[diagnostic(
        code(registration::duplicate),
        help("Hook names must be unique within a coordinator.")
    )]
    DuplicateHook(String),

    #[error("Hook '{0}' depends on itself")]
    #[diagnostic(code(registration::self_dependency))]
    SelfDependency(String),

    #[error("Hook '{name}' would introduce a dependency cycle: {}", cycle.join(" -> "))]
    #[diagnostic(
        code(registration::cycle),
        help("Shutdown hooks must form a directed acyclic graph.")
    )]
    CycleDetected { name: String, cycle: Vec<String> },

    #[error(
        "Hook '{name}' ({priority}) depends on '{dependency}' ({dependency_priority}) which runs in a later tier"
    )]
    #[diagnostic(
        code(registration::priority_inversion),
        help("A hook may only depend on hooks of the same or a more urgent priority.")
    )]
    PriorityInversion {
        name: String,
        priority: HookPriority,
        dependency: String,
        dependency_priority: HookPriority,
    },

    #[error("Shutdown already started; hook '{0}' rejected")]
    #[diagnostic(
        code(registration::shutdown_in_progress),
        help("Register hooks during initialization, or reset the coordinator first.")
    )]
    ShutdownInProgress(String),
}

/// Which part of an isolated run exceeded its time budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    /// Child never acknowledged the IPC handshake
    Handshake,
    /// Child exceeded `process_timeout` while running
    Running,
    /// Child stopped sending heartbeats
    Unresponsive,
    /// Child ignored the graceful termination signal and was killed
    Termination,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Handshake => "handshake",
            Self::Running => "running",
            Self::Unresponsive => "unresponsive",
            Self::Termination => "termination",
        };
        f.write_str(s)
    }
}

/// Isolated process runner errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum RunError {
    #[error("Invalid work: {0}")]
    #[diagnostic(code(run::invalid_work))]
    InvalidWork(String),

    #[error("Failed to spawn '{program}': {cause}")]
    #[diagnostic(
        code(run::spawn_failed),
        help("Check that the worker program exists and is executable.")
    )]
    Spawn { program: String, cause: String },

    #[error("I/O error talking to child {pid}: {cause}")]
    #[diagnostic(code(run::io))]
    Io { pid: Pid, cause: String },

    #[error("Protocol violation from child {pid}: {detail}")]
    #[diagnostic(
        code(run::protocol),
        help("The child must answer the handshake with a Ready message.")
    )]
    Protocol { pid: Pid, detail: String },

    #[error("Child {pid} crashed (exit code {exit_code:?}, signal {signal:?})")]
    #[diagnostic(code(run::child_crashed))]
    ChildCrashed {
        pid: Pid,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("Child {pid} timed out during {phase}")]
    #[diagnostic(
        code(run::timeout),
        help("The child was terminated. Raise processTimeoutMs or check for hangs.")
    )]
    Timeout { pid: Pid, phase: TimeoutPhase },

    #[error("Child {pid} could not be killed")]
    #[diagnostic(
        code(run::kill_failed),
        help("The OS refused or ignored SIGKILL. The process may be in uninterruptible sleep.")
    )]
    ChildKillFailed { pid: Pid },

    #[error("Work in child {pid} failed: {message}")]
    #[diagnostic(code(run::work_failed))]
    WorkFailed { pid: Pid, message: String },

    #[error("Run {run_id} (child {pid}) was killed by a cleanup request")]
    #[diagnostic(code(run::killed))]
    Killed { run_id: RunId, pid: Pid },
}

impl RunError {
    /// Timeout phase, when this is a timeout
    pub fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self {
            Self::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Process-level shutdown failures
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum ShutdownError {
    #[error("Shutdown took {elapsed_ms}ms, exceeding the {deadline_ms}ms deadline")]
    #[diagnostic(
        code(shutdown::deadline_exceeded),
        help("The process is terminated forcefully to avoid hanging.")
    )]
    DeadlineExceeded { elapsed_ms: u64, deadline_ms: u64 },
}

/// Configuration errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    #[diagnostic(code(config::invalid_value))]
    InvalidValue { key: String, reason: String },
}

/// Unified error type with miette diagnostics
#[derive(Error, Debug, Diagnostic)]
pub enum LifecycleError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    #[diagnostic(code(lifecycle::io_error))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(lifecycle::serde_error))]
    Serde(#[from] serde_json::Error),
}

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
