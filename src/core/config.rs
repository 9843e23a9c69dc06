/*!
 * Lifecycle Configuration
 *
 * Recognized options for the runner, the handle registry and the shutdown
 * coordinator. Durations serialize as integer milliseconds under the
 * `...Ms` keys so a JSON config reads `{"processTimeoutMs": 5000}`.
 *
 * Precedence: defaults (`core::limits`) < JSON document < environment.
 */

use super::errors::ConfigError;
use super::limits::*;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::time::Duration;

/// What the coordinator does once the global shutdown deadline is blown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "code", rename_all = "snake_case")]
pub enum ForcedExit {
    /// SIGKILL the current process
    #[default]
    Kill,
    /// `std::process::exit` with the given code
    Exit(i32),
    /// Only record the overrun in the report (tests, embedding)
    Disabled,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleConfig {
    /// Bounds total child runtime
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "processTimeoutMs")]
    pub process_timeout: Duration,

    /// Grace period before force-kill
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "terminationTimeoutMs")]
    pub termination_timeout: Duration,

    /// Hard ceiling for the whole shutdown sequence
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "globalShutdownDeadlineMs")]
    pub global_shutdown_deadline: Duration,

    /// Bounded worker count for parallel close operations
    pub handle_cleanup_concurrency: usize,

    /// Ceiling for one forced handle sweep
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "handleCleanupMaxMs")]
    pub handle_cleanup_max: Duration,

    /// Minimum budget for the final sweep, even after hooks overran
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "finalizeFloorMs")]
    pub finalize_floor: Duration,

    /// Overrun tolerated before forced exit
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "exitGraceMs")]
    pub exit_grace: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "heartbeatIntervalMs")]
    pub heartbeat_interval: Duration,

    pub heartbeat_miss_limit: u32,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "handshakeTimeoutMs")]
    pub handshake_timeout: Duration,

    /// Timeout for hooks registered without one
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "hookTimeoutMs")]
    pub hook_timeout: Duration,

    pub forced_exit: ForcedExit,
}

impl LifecycleConfig {
    pub fn new() -> Self {
        Self {
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
            global_shutdown_deadline: DEFAULT_GLOBAL_SHUTDOWN_DEADLINE,
            handle_cleanup_concurrency: DEFAULT_HANDLE_CLEANUP_CONCURRENCY,
            handle_cleanup_max: DEFAULT_HANDLE_CLEANUP_MAX,
            finalize_floor: DEFAULT_FINALIZE_FLOOR,
            exit_grace: DEFAULT_EXIT_GRACE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_miss_limit: DEFAULT_HEARTBEAT_MISS_LIMIT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            forced_exit: ForcedExit::Kill,
        }
    }

    /// Parse a JSON document; missing keys keep their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::InvalidValue {
            key: "<document>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `LIFECYCLE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new().with_env_overrides()
    }

    /// Apply `LIFECYCLE_*` environment overrides on top of `self`
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(ms) = env_u64("LIFECYCLE_PROCESS_TIMEOUT_MS")? {
            self.process_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("LIFECYCLE_TERMINATION_TIMEOUT_MS")? {
            self.termination_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("LIFECYCLE_SHUTDOWN_DEADLINE_MS")? {
            self.global_shutdown_deadline = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("LIFECYCLE_CLEANUP_CONCURRENCY")? {
            self.handle_cleanup_concurrency = usize::try_from(n).unwrap_or(usize::MAX);
        }
        if let Some(ms) = env_u64("LIFECYCLE_HEARTBEAT_INTERVAL_MS")? {
            self.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("LIFECYCLE_HEARTBEAT_MISS_LIMIT")? {
            self.heartbeat_miss_limit = u32::try_from(n).unwrap_or(u32::MAX);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values that would make the subsystems unbounded or inert
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("processTimeoutMs", self.process_timeout),
            ("terminationTimeoutMs", self.termination_timeout),
            ("globalShutdownDeadlineMs", self.global_shutdown_deadline),
            ("handleCleanupMaxMs", self.handle_cleanup_max),
            ("heartbeatIntervalMs", self.heartbeat_interval),
            ("handshakeTimeoutMs", self.handshake_timeout),
            ("hookTimeoutMs", self.hook_timeout),
        ];
        for (key, value) in nonzero {
            if value.is_zero() {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        if self.handle_cleanup_concurrency == 0
            || self.handle_cleanup_concurrency > MAX_HANDLE_CLEANUP_CONCURRENCY
        {
            return Err(invalid(
                "handleCleanupConcurrency",
                &format!("must be between 1 and {}", MAX_HANDLE_CLEANUP_CONCURRENCY),
            ));
        }
        if self.heartbeat_miss_limit == 0 {
            return Err(invalid("heartbeatMissLimit", "must be at least 1"));
        }
        Ok(())
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    pub fn with_global_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.global_shutdown_deadline = deadline;
        self
    }

    pub fn with_handle_cleanup_concurrency(mut self, workers: usize) -> Self {
        self.handle_cleanup_concurrency = workers;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, miss_limit: u32) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_miss_limit = miss_limit;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_forced_exit(mut self, forced_exit: ForcedExit) -> Self {
        self.forced_exit = forced_exit;
        self
    }

    pub fn with_finalize_floor(mut self, floor: Duration) -> Self {
        self.finalize_floor = floor;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| invalid(key, &e.to_string())),
        Err(_) => Ok(None),
    }
}
