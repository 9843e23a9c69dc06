/*!
 * Handle Types
 * Kinds, registrations and snapshots of tracked resources
 */

use crate::core::id::HandleId;
use crate::core::types::{millis, CleanupFuture, Owner};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

/// Kind of a tracked resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Timer,
    Interval,
    ChildProcess,
    Stream,
    EventListener,
    Custom,
}

impl HandleKind {
    pub const ALL: [HandleKind; 6] = [
        Self::Timer,
        Self::Interval,
        Self::ChildProcess,
        Self::Stream,
        Self::EventListener,
        Self::Custom,
    ];

    /// Whether the forceful escalation runs even after a successful close
    #[inline]
    pub fn always_escalates(&self) -> bool {
        matches!(self, Self::ChildProcess)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Interval => "interval",
            Self::ChildProcess => "child_process",
            Self::Stream => "stream",
            Self::EventListener => "event_listener",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forceful escalation, e.g. SIGKILL for a child process group
pub type ForceKillFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// How a handle is released
pub(crate) enum CloseOp {
    /// Runs as a detached tokio task
    Async(Box<dyn FnOnce() -> CleanupFuture + Send + 'static>),
    /// Runs on its own OS thread so a stuck syscall can neither stall the
    /// runtime nor keep it from shutting down
    Blocking(Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>),
}

/// Everything needed to track one resource
///
/// # Example
///
/// ```ignore
/// let id = registry.register_with(
///     HandleRegistration::new(HandleKind::ChildProcess, "session-7", move || async move {
///         terminate_gracefully(pid).await
///     })
///     .with_force_kill(move || kill_group(pid))
///     .with_label(format!("worker {}", pid)),
/// );
/// ```
pub struct HandleRegistration {
    pub(crate) kind: HandleKind,
    pub(crate) owner: Owner,
    pub(crate) label: Option<String>,
    pub(crate) close: CloseOp,
    pub(crate) force_kill: Option<ForceKillFn>,
}

impl HandleRegistration {
    /// Registration with an async close operation
    pub fn new<F, Fut>(kind: HandleKind, owner: impl Into<Owner>, close: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            kind,
            owner: owner.into(),
            label: None,
            close: CloseOp::Async(Box::new(move || close().boxed())),
            force_kill: None,
        }
    }

    /// Registration with a synchronous close operation
    pub fn blocking<F>(kind: HandleKind, owner: impl Into<Owner>, close: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            kind,
            owner: owner.into(),
            label: None,
            close: CloseOp::Blocking(Box::new(close)),
            force_kill: None,
        }
    }

    /// Attach a forceful escalation
    ///
    /// For `ChildProcess` handles it is issued unconditionally after the
    /// graceful close; for other kinds only when the close failed or was
    /// abandoned.
    ///
    /// Runs on a detached thread and is waited on for the rest of the sweep
    /// deadline (at least `ESCALATION_FLOOR`); one that blocks longer is
    /// reported as failed and left behind.
    pub fn with_force_kill<F>(mut self, force_kill: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.force_kill = Some(Box::new(force_kill));
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Debug for HandleRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistration")
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("label", &self.label)
            .field("has_force_kill", &self.force_kill.is_some())
            .finish()
    }
}

/// Close operations of a registered handle
pub(crate) struct Closer {
    pub(crate) close: CloseOp,
    pub(crate) force_kill: Option<ForceKillFn>,
}

/// Registry-internal record
pub(crate) struct HandleEntry {
    pub(crate) kind: HandleKind,
    pub(crate) owner: Owner,
    pub(crate) label: Option<String>,
    pub(crate) registered_at: Instant,
    pub(crate) has_force_kill: bool,
    // The mutex only makes the boxed FnOnce values shareable; it is taken
    // exactly once, after the entry has been removed from the table.
    pub(crate) closer: Mutex<Closer>,
}

impl HandleEntry {
    pub(crate) fn from_registration(registration: HandleRegistration) -> Self {
        let HandleRegistration {
            kind,
            owner,
            label,
            close,
            force_kill,
        } = registration;

        Self {
            kind,
            owner,
            label,
            registered_at: Instant::now(),
            has_force_kill: force_kill.is_some(),
            closer: Mutex::new(Closer { close, force_kill }),
        }
    }

    pub(crate) fn info(&self, id: HandleId) -> HandleInfo {
        HandleInfo {
            id,
            kind: self.kind,
            owner: self.owner.clone(),
            label: self.label.clone(),
            age_ms: millis(self.registered_at.elapsed()),
            has_force_kill: self.has_force_kill,
        }
    }
}

/// Read-only snapshot of a tracked handle, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub id: HandleId,
    pub kind: HandleKind,
    pub owner: Owner,
    pub label: Option<String>,
    pub age_ms: u64,
    pub has_force_kill: bool,
}

impl HandleInfo {
    pub fn age(&self) -> Duration {
        Duration::from_millis(self.age_ms)
    }
}
