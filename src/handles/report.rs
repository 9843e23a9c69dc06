/*!
 * Cleanup Reports
 * Outcome of a forced handle sweep; never an error, always a report
 */

use super::types::HandleKind;
use crate::core::errors::HandleError;
use crate::core::id::HandleId;
use crate::core::types::{millis, Owner};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Which handles a sweep targeted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scope", content = "owner", rename_all = "snake_case")]
pub enum CleanupScope {
    #[default]
    All,
    Owner(Owner),
}

/// How a single close attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CloseStatus {
    Closed,
    Failed(String),
    Panicked,
    /// Did not return within its slice of the deadline
    Abandoned { budget_ms: u64 },
}

/// Per-handle result of a sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleOutcome {
    pub id: HandleId,
    pub kind: HandleKind,
    pub owner: Owner,
    pub status: CloseStatus,
    /// Forceful escalation was issued
    pub force_killed: bool,
    /// Escalation itself failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_kill_error: Option<String>,
}

impl HandleOutcome {
    /// Error view of this outcome, `None` when the handle closed cleanly
    pub fn error(&self) -> Option<HandleError> {
        match &self.status {
            CloseStatus::Closed => None,
            CloseStatus::Failed(cause) => Some(HandleError::CloseFailed {
                handle_id: self.id,
                kind: self.kind,
                cause: cause.clone(),
            }),
            CloseStatus::Panicked => Some(HandleError::ClosePanicked {
                handle_id: self.id,
                kind: self.kind,
            }),
            CloseStatus::Abandoned { budget_ms } => Some(HandleError::Abandoned {
                handle_id: self.id,
                kind: self.kind,
                budget_ms: *budget_ms,
            }),
        }
    }
}

/// Result of `force_cleanup_all` / `force_cleanup`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub scope: CleanupScope,
    pub outcomes: Vec<HandleOutcome>,
    pub deadline_ms: u64,
    pub elapsed_ms: u64,
}

impl CleanupReport {
    pub(crate) fn empty(scope: CleanupScope, deadline: Duration) -> Self {
        Self {
            scope,
            outcomes: Vec::new(),
            deadline_ms: millis(deadline),
            elapsed_ms: 0,
        }
    }

    /// Number of handles the sweep took out of the registry
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn closed(&self) -> impl Iterator<Item = &HandleOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == CloseStatus::Closed)
    }

    pub fn abandoned(&self) -> impl Iterator<Item = &HandleOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, CloseStatus::Abandoned { .. }))
    }

    /// Close operations that returned an error or panicked
    pub fn failed(&self) -> impl Iterator<Item = &HandleOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, CloseStatus::Failed(_) | CloseStatus::Panicked))
    }

    pub fn force_killed(&self) -> impl Iterator<Item = &HandleOutcome> {
        self.outcomes.iter().filter(|o| o.force_killed)
    }

    pub fn abandoned_count(&self) -> usize {
        self.abandoned().count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    /// Every recorded error, in handle order
    pub fn errors(&self) -> Vec<HandleError> {
        self.outcomes.iter().filter_map(HandleOutcome::error).collect()
    }

    /// Child processes that did not close gracefully and were force-killed
    pub fn killed_processes(&self) -> usize {
        self.force_killed()
            .filter(|o| o.kind == HandleKind::ChildProcess && o.status != CloseStatus::Closed)
            .count()
    }

    /// Nothing failed and nothing was abandoned
    pub fn is_clean(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == CloseStatus::Closed && o.force_kill_error.is_none())
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Outcomes per handle kind
    pub fn by_kind(&self) -> HashMap<HandleKind, usize> {
        let mut counts = HashMap::new();
        for outcome in &self.outcomes {
            *counts.entry(outcome.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Merge another sweep into this one
    pub fn merge(&mut self, other: CleanupReport) {
        self.outcomes.extend(other.outcomes);
        self.outcomes.sort_by_key(|o| o.id);
        self.deadline_ms = self.deadline_ms.max(other.deadline_ms);
        self.elapsed_ms += other.elapsed_ms;
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} handles: {} closed, {} failed, {} abandoned, {} force-killed in {}ms",
            self.attempted(),
            self.closed().count(),
            self.failed_count(),
            self.abandoned_count(),
            self.force_killed().count(),
            self.elapsed_ms
        )
    }
}
