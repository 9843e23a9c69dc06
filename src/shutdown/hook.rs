/*!
 * Shutdown Hooks
 * Named cleanup actions with a priority tier, dependencies and a timeout
 */

use crate::core::types::CleanupFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Coarse ordering of hooks; tiers run strictly in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPriority {
    Critical,
    High,
    Normal,
    Low,
    Cleanup,
}

impl HookPriority {
    pub const ALL: [HookPriority; 5] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for HookPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cleanup action of a hook; invoked at most once per shutdown sequence
pub type HookAction = Arc<dyn Fn() -> CleanupFuture + Send + Sync + 'static>;

/// A named cleanup action
///
/// # Example
///
/// ```ignore
/// coordinator.register_hook(
///     ShutdownHook::new("flush-journal", HookPriority::Critical, move || {
///         let journal = journal.clone();
///         async move { journal.flush().await }
///     })
///     .with_timeout(Duration::from_millis(500)),
/// )?;
/// ```
#[derive(Clone)]
pub struct ShutdownHook {
    pub(crate) name: String,
    pub(crate) priority: HookPriority,
    pub(crate) depends_on: Vec<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) action: HookAction,
}

impl ShutdownHook {
    pub fn new<F, Fut>(name: impl Into<String>, priority: HookPriority, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority,
            depends_on: Vec::new(),
            timeout: None,
            action: Arc::new(move || action().boxed()),
        }
    }

    /// Require `hook` to finish (in any way) before this one starts
    pub fn depends_on(mut self, hook: impl Into<String>) -> Self {
        let hook = hook.into();
        if !self.depends_on.contains(&hook) {
            self.depends_on.push(hook);
        }
        self
    }

    pub fn depends_on_all<I, S>(self, hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        hooks.into_iter().fold(self, |hook, dep| hook.depends_on(dep))
    }

    /// Abandon the action after `timeout`; the coordinator default applies otherwise
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> HookPriority {
        self.priority
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for ShutdownHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHook")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("depends_on", &self.depends_on)
            .field("timeout", &self.timeout)
            .finish()
    }
}
