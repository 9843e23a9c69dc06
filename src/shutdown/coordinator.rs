/*!
 * Shutdown Coordinator
 *
 * Runs registered hooks tier by tier, then sweeps the handle registry, all
 * inside one global deadline.
 *
 * # Sequence
 *
 * 1. plan: repair forward references (unknown dependencies, late priority
 *    inversions, cycles) and log what was repaired
 * 2. run each tier; inside a tier a hook starts once all its dependencies
 *    finished, whatever their outcome, and is abandoned after its timeout
 * 3. sweep every registered handle with what is left of the deadline, never
 *    less than the finalize floor; this step always runs
 * 4. if the sequence overran the deadline by more than the exit grace, take
 *    the forced-exit path
 *
 * A watchdog thread applies the forced exit on its own if the sequence
 * wedges the runtime entirely.
 *
 * `shutdown` is idempotent: concurrent callers attach to the sequence already
 * in flight and later callers get its report.
 */

use super::hook::ShutdownHook;
use super::plan::{self, PlannedHook, ShutdownPlan, Stage};
use super::report::{
    CoordinatorState, HookOutcome, HookStatus, ShutdownReason, ShutdownReport,
};
use super::watchdog::{force_exit, Watchdog};
use crate::core::config::{ForcedExit, LifecycleConfig};
use crate::core::deadline::Deadline;
use crate::core::errors::{HookError, RegistrationError};
use crate::core::types::millis;
use crate::handles::{CleanupReport, HandleRegistry};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Orchestrates process-wide shutdown
///
/// Cloning is cheap; clones share hooks and state.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: LifecycleConfig,
    hooks: RwLock<Vec<ShutdownHook>>,
    registry: RwLock<Option<HandleRegistry>>,
    state: Mutex<SequenceState>,
}

struct SequenceState {
    phase: CoordinatorState,
    in_flight: Option<watch::Receiver<Option<ShutdownReport>>>,
    last: Option<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                hooks: RwLock::new(Vec::new()),
                registry: RwLock::new(None),
                state: Mutex::new(SequenceState {
                    phase: CoordinatorState::Idle,
                    in_flight: None,
                    last: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    /// Register a hook
    ///
    /// Fails on duplicate names, self-dependencies, cycles and priority
    /// inversions visible now, and once a shutdown has started. Dependencies
    /// on hooks not registered yet are accepted and checked at shutdown start.
    pub fn register_hook(&self, hook: ShutdownHook) -> Result<(), RegistrationError> {
        let mut state = self.inner.state.lock();
        if state.phase.is_active() || state.phase.is_terminal() {
            return Err(RegistrationError::ShutdownInProgress(hook.name.clone()));
        }

        let mut hooks = self.inner.hooks.write();
        plan::validate_registration(&hooks, &hook)?;
        info!(
            hook = %hook.name,
            priority = %hook.priority,
            depends_on = ?hook.depends_on,
            "shutdown hook registered"
        );
        hooks.push(hook);
        state.phase = CoordinatorState::Collecting;
        Ok(())
    }

    /// Attach the registry swept as the final, non-skippable step
    pub fn set_handle_registry(&self, registry: HandleRegistry) {
        *self.inner.registry.write() = Some(registry);
        let mut state = self.inner.state.lock();
        if state.phase == CoordinatorState::Idle {
            state.phase = CoordinatorState::Collecting;
        }
    }

    pub fn handle_registry(&self) -> Option<HandleRegistry> {
        self.inner.registry.read().clone()
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.state.lock().phase
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().is_active()
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.inner.hooks.read().iter().map(|h| h.name.clone()).collect()
    }

    /// Report of the most recent finished sequence
    pub fn last_report(&self) -> Option<ShutdownReport> {
        self.inner.state.lock().last.clone()
    }

    /// Plan the registered hooks would run with right now
    pub fn plan(&self) -> ShutdownPlan {
        ShutdownPlan::build(&self.inner.hooks.read())
    }

    /// Return a finished coordinator to `Collecting`, keeping its hooks
    ///
    /// Refused (returns `false`) while a sequence is in flight.
    pub fn reset(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.phase.is_active() {
            return false;
        }
        let has_registrations =
            !self.inner.hooks.read().is_empty() || self.inner.registry.read().is_some();
        state.phase = if has_registrations {
            CoordinatorState::Collecting
        } else {
            CoordinatorState::Idle
        };
        state.last = None;
        info!(state = %state.phase, "shutdown coordinator reset");
        true
    }

    /// Shut down with the configured global deadline
    pub async fn shutdown_now(&self, reason: ShutdownReason) -> ShutdownReport {
        self.shutdown(reason, self.inner.config.global_shutdown_deadline)
            .await
    }

    /// Run the full shutdown sequence within `deadline`
    ///
    /// Must be called from within a tokio runtime.
    pub async fn shutdown(&self, reason: ShutdownReason, deadline: Duration) -> ShutdownReport {
        let mut rx = {
            let mut state = self.inner.state.lock();
            if let Some(report) = state.last.clone() {
                info!(shutdown_id = %report.shutdown_id, "shutdown already finished");
                return report;
            }
            match state.in_flight.clone() {
                Some(rx) => {
                    info!(%reason, "shutdown already in progress, attaching");
                    rx
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.phase = CoordinatorState::Running;
                    state.in_flight = Some(rx.clone());

                    let shutdown_id = Uuid::new_v4().to_string();
                    let span = info_span!("shutdown", %shutdown_id, %reason);
                    let sequence = Sequence {
                        inner: self.inner.clone(),
                        shutdown_id,
                        reason,
                        deadline: Deadline::after(deadline),
                    };
                    tokio::spawn(sequence.run(tx).instrument(span));
                    rx
                }
            }
        };

        let finished = rx.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
        match finished {
            Some(report) => report,
            // The sequence task died without publishing
            None => self.abort_report(deadline),
        }
    }

    fn abort_report(&self, deadline: Duration) -> ShutdownReport {
        error!("shutdown sequence terminated without a report");
        let mut state = self.inner.state.lock();
        state.phase = CoordinatorState::Completed;
        state.in_flight = None;
        ShutdownReport {
            shutdown_id: Uuid::new_v4().to_string(),
            reason: ShutdownReason::FatalError("shutdown sequence aborted".to_string()),
            state: CoordinatorState::Completed,
            hooks: Vec::new(),
            cleanup: CleanupReport::default(),
            warnings: vec!["shutdown sequence aborted before reporting".to_string()],
            deadline_ms: millis(deadline),
            elapsed_ms: 0,
            forced_exit: false,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(LifecycleConfig::default())
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("hooks", &self.inner.hooks.read().len())
            .finish()
    }
}

// ============================================================================
// Sequence execution
// ============================================================================

struct Sequence {
    inner: Arc<CoordinatorInner>,
    shutdown_id: String,
    reason: ShutdownReason,
    deadline: Deadline,
}

impl Sequence {
    async fn run(self, tx: watch::Sender<Option<ShutdownReport>>) {
        let config = &self.inner.config;
        let forced_exit_policy = config.forced_exit;
        let watchdog = Watchdog::arm(
            self.deadline.budget() + config.finalize_floor + config.exit_grace,
            forced_exit_policy,
            self.shutdown_id.clone(),
        );
        info!(deadline_ms = millis(self.deadline.budget()), "shutdown started");

        let hooks: Vec<ShutdownHook> = self.inner.hooks.read().clone();
        let plan = ShutdownPlan::build(&hooks);
        let mut warnings = plan.warnings.clone();
        for warning in &warnings {
            warn!(%warning, "shutdown plan repaired");
        }

        let by_name: HashMap<&str, &ShutdownHook> = hooks.iter().map(|h| (h.name(), h)).collect();
        let mut outcomes = Vec::with_capacity(hooks.len());
        for stage in &plan.stages {
            if self.deadline.is_expired() {
                outcomes.extend(stage.hooks.iter().map(|h| skipped(h, "global deadline exhausted")));
                continue;
            }
            self.run_stage(stage, &by_name, &mut outcomes).await;
        }

        self.set_phase(CoordinatorState::Finalizing);
        let cleanup = self.final_sweep(&mut warnings).await;
        watchdog.disarm();

        let elapsed = self.deadline.elapsed();
        let overrun = elapsed > self.deadline.budget() + config.exit_grace;
        let final_state = if overrun {
            CoordinatorState::ForcedExit
        } else {
            CoordinatorState::Completed
        };

        let report = ShutdownReport {
            shutdown_id: self.shutdown_id.clone(),
            reason: self.reason.clone(),
            state: final_state,
            hooks: outcomes,
            cleanup,
            warnings,
            deadline_ms: millis(self.deadline.budget()),
            elapsed_ms: millis(elapsed),
            forced_exit: overrun,
        };

        let summary = report.summary();
        if overrun {
            error!(
                elapsed_ms = report.elapsed_ms,
                deadline_ms = report.deadline_ms,
                %summary,
                "shutdown exceeded its deadline"
            );
        } else if summary.is_empty() {
            info!(elapsed_ms = report.elapsed_ms, "shutdown complete");
        } else {
            warn!(elapsed_ms = report.elapsed_ms, %summary, "shutdown complete with problems");
        }

        {
            let mut state = self.inner.state.lock();
            state.phase = final_state;
            state.in_flight = None;
            state.last = Some(report.clone());
        }
        tx.send_replace(Some(report));

        if overrun && forced_exit_policy != ForcedExit::Disabled {
            force_exit(forced_exit_policy);
        }
    }

    fn set_phase(&self, phase: CoordinatorState) {
        self.inner.state.lock().phase = phase;
    }

    /// Run one stage, honouring intra-stage dependencies
    async fn run_stage(
        &self,
        stage: &Stage,
        by_name: &HashMap<&str, &ShutdownHook>,
        outcomes: &mut Vec<HookOutcome>,
    ) {
        let label = stage
            .priority
            .map(|p| p.to_string())
            .unwrap_or_else(|| "deferred".to_string());
        info!(tier = %label, hooks = stage.hooks.len(), "running shutdown tier");

        let planned: HashMap<&str, &PlannedHook> =
            stage.hooks.iter().map(|h| (h.name.as_str(), h)).collect();
        let mut waiting_on: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for hook in &stage.hooks {
            waiting_on.insert(hook.name.as_str(), hook.depends_on.len());
            for dep in &hook.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(hook.name.as_str());
            }
        }

        let mut ready: VecDeque<&str> = stage
            .hooks
            .iter()
            .filter(|h| h.depends_on.is_empty())
            .map(|h| h.name.as_str())
            .collect();
        let mut running = FuturesUnordered::new();
        let mut started: HashMap<String, Instant> = HashMap::new();

        loop {
            while let Some(name) = ready.pop_front() {
                let Some(hook) = by_name.get(name) else {
                    continue;
                };
                started.insert(name.to_string(), Instant::now());
                running.push(run_hook(
                    (*hook).clone(),
                    self.deadline,
                    self.inner.config.hook_timeout,
                ));
            }

            match tokio::time::timeout_at(self.deadline.tokio_instant(), running.next()).await {
                Ok(Some(mut outcome)) => {
                    outcome.started_offset_ms = started
                        .remove(&outcome.name)
                        .map(|at| millis(at.saturating_duration_since(self.deadline.start())));
                    if let Some(next) = dependents.get(outcome.name.as_str()) {
                        for &dependent in next {
                            if let Some(count) = waiting_on.get_mut(dependent) {
                                *count = count.saturating_sub(1);
                                if *count == 0 {
                                    ready.push_back(dependent);
                                }
                            }
                        }
                    }
                    outcomes.push(outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(tier = %label, running = started.len(), "global deadline hit inside tier");
                    // Still running: abandoned at the deadline
                    let mut abandoned: Vec<(String, Instant)> = started.drain().collect();
                    abandoned.sort_by_key(|(_, at)| *at);
                    for (name, at) in abandoned {
                        let Some(hook) = planned.get(name.as_str()) else {
                            continue;
                        };
                        let elapsed = at.elapsed();
                        outcomes.push(HookOutcome {
                            error: Some(HookError::TimedOut {
                                name: name.clone(),
                                timeout_ms: millis(elapsed),
                            }),
                            name,
                            priority: hook.priority,
                            status: HookStatus::TimedOut,
                            started_offset_ms: Some(millis(
                                at.saturating_duration_since(self.deadline.start()),
                            )),
                            elapsed_ms: millis(elapsed),
                        });
                    }
                    break;
                }
            }
        }

        // Never became ready before the deadline
        for hook in &stage.hooks {
            if !outcomes.iter().any(|o| o.name == hook.name) {
                outcomes.push(skipped(hook, "global deadline exhausted before dependencies finished"));
            }
        }
    }

    async fn final_sweep(&self, warnings: &mut Vec<String>) -> CleanupReport {
        let registry = self.inner.registry.read().clone();
        let Some(registry) = registry else {
            warnings.push("no handle registry attached; final sweep skipped".to_string());
            return CleanupReport::default();
        };

        let config = &self.inner.config;
        let budget = self
            .deadline
            .remaining()
            .max(config.finalize_floor)
            .min(config.handle_cleanup_max);
        info!(
            handles = registry.len(),
            budget_ms = millis(budget),
            "sweeping remaining handles"
        );
        registry.force_cleanup_all(budget).await
    }
}

/// Run one hook detached, bounded by its timeout and the global deadline
async fn run_hook(hook: ShutdownHook, global: Deadline, default_timeout: Duration) -> HookOutcome {
    let budget = global.clamp(hook.timeout.unwrap_or(default_timeout));
    let started = Instant::now();
    let task = tokio::spawn((hook.action)());

    let (status, error) = match tokio::time::timeout(budget, task).await {
        Ok(Ok(Ok(()))) => (HookStatus::Completed, None),
        Ok(Ok(Err(e))) => (
            HookStatus::Failed,
            Some(HookError::Failed {
                name: hook.name.clone(),
                cause: format!("{:#}", e),
            }),
        ),
        Ok(Err(join_error)) if join_error.is_panic() => (
            HookStatus::Panicked,
            Some(HookError::Panicked {
                name: hook.name.clone(),
            }),
        ),
        Ok(Err(join_error)) => (
            HookStatus::Failed,
            Some(HookError::Failed {
                name: hook.name.clone(),
                cause: join_error.to_string(),
            }),
        ),
        // Dropping the JoinHandle abandons the action
        Err(_) => (
            HookStatus::TimedOut,
            Some(HookError::TimedOut {
                name: hook.name.clone(),
                timeout_ms: millis(budget),
            }),
        ),
    };

    let elapsed = started.elapsed();
    match &error {
        None => info!(hook = %hook.name, elapsed_ms = millis(elapsed), "hook completed"),
        Some(e) => warn!(hook = %hook.name, elapsed_ms = millis(elapsed), error = %e, "hook did not complete"),
    }

    HookOutcome {
        name: hook.name,
        priority: hook.priority,
        status,
        started_offset_ms: None,
        elapsed_ms: millis(elapsed),
        error,
    }
}

fn skipped(hook: &PlannedHook, reason: &str) -> HookOutcome {
    warn!(hook = %hook.name, reason, "hook skipped");
    HookOutcome {
        name: hook.name.clone(),
        priority: hook.priority,
        status: HookStatus::Skipped,
        started_offset_ms: None,
        elapsed_ms: 0,
        error: Some(HookError::Skipped {
            name: hook.name.clone(),
            reason: reason.to_string(),
        }),
    }
}
