/*!
 * Process Types
 * Work descriptions, run options and status records for isolated runs
 */

use crate::core::config::LifecycleConfig;
use crate::core::errors::RunError;
use crate::core::id::RunId;
use crate::core::types::{Owner, Pid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Work to execute in a separate OS process
///
/// `program` is a binary speaking the worker protocol (see `process::worker`);
/// `entry` selects what it runs and `payload` is handed to it verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolatedWork {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub entry: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl IsolatedWork {
    pub fn new(program: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            entry: entry.into(),
            payload: Value::Null,
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn validate(&self) -> Result<(), RunError> {
        let program = self.program.to_string_lossy();
        if program.trim().is_empty() {
            return Err(RunError::InvalidWork("empty program".to_string()));
        }
        if program.contains('\0') {
            return Err(RunError::InvalidWork(
                "program path contains a NUL byte".to_string(),
            ));
        }
        if self.entry.trim().is_empty() {
            return Err(RunError::InvalidWork("empty entry".to_string()));
        }
        if self.entry.chars().any(char::is_control) {
            return Err(RunError::InvalidWork(format!(
                "entry '{}' contains control characters",
                self.entry.escape_debug()
            )));
        }
        Ok(())
    }
}

/// Per-call supervision budgets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Bounds total wall-clock execution
    pub process_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub termination_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before the child counts as unresponsive
    pub heartbeat_miss_limit: u32,
    /// Owner of the child's handle; the runner's own owner when unset
    pub owner: Option<Owner>,
}

impl RunOptions {
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self {
            process_timeout: config.process_timeout,
            termination_timeout: config.termination_timeout,
            handshake_timeout: config.handshake_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_miss_limit: config.heartbeat_miss_limit,
            owner: None,
        }
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, miss_limit: u32) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_miss_limit = miss_limit.max(1);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<Owner>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Silence after which the child is treated as hung
    pub fn unresponsive_after(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.heartbeat_miss_limit.max(1))
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&LifecycleConfig::default())
    }
}

/// Result of a completed isolated run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutput {
    pub run_id: RunId,
    pub pid: Pid,
    pub value: Value,
    pub elapsed_ms: u64,
}

impl WorkOutput {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Lifecycle of a managed child
///
/// ```text
/// starting -> running -> { completed | timed_out | failed } -> killed?
/// ```
///
/// `Killed` is reachable from every state except itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    TimedOut,
    Failed,
    Killed,
}

impl ProcessStatus {
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        match (self, next) {
            (Killed, _) => false,
            (_, Killed) => true,
            (Starting, Running | TimedOut | Failed) => true,
            (Running, Completed | TimedOut | Failed) => true,
            _ => false,
        }
    }

    /// No further transition other than `Killed` is possible
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Starting | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a run for monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub run_id: RunId,
    pub pid: Pid,
    pub program: String,
    pub entry: String,
    pub owner: Owner,
    pub status: ProcessStatus,
    /// Wall-clock start, milliseconds since the Unix epoch
    pub started_at_ms: u64,
    pub elapsed_ms: u64,
    pub heartbeats: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ms_ago: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}
