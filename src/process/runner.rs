/*!
 * Isolated Process Runner
 *
 * Runs work in a child process and guarantees the child is gone afterwards.
 *
 * Each run is driven by a supervisor task:
 *
 * 1. spawn the child in its own process group and register a `ChildProcess`
 *    handle whose close requests termination and whose escalation SIGKILLs
 *    the group, so a global sweep reaps children nobody awaits
 * 2. wait for `Ready` (handshake timeout), then send `Start`
 * 3. race IPC messages against the process deadline, the heartbeat watchdog,
 *    child exit and kill requests
 * 4. on timeout: SIGTERM the group, wait `termination_timeout`, then SIGKILL
 *    and reap
 * 5. on every terminal transition: close IPC, unregister the handle and move
 *    the record into the bounded history
 */

use super::executor::{self, SpawnedChild};
use super::ipc::{ChildMessage, HostMessage, IpcChannel};
use super::types::{IsolatedWork, ProcessSnapshot, ProcessStatus, RunOptions, WorkOutput};
use crate::core::config::LifecycleConfig;
use crate::core::errors::{RegistrationError, RunError, TimeoutPhase};
use crate::core::id::{HandleId, RunId, RunIdGenerator};
use crate::core::limits::{
    IPC_DRAIN_TIMEOUT, KILL_REAP_TIMEOUT, RUNNER_HANDLE_OWNER, RUN_HISTORY_CAPACITY,
};
use crate::core::types::{millis, Owner, Pid};
use crate::handles::{HandleKind, HandleRegistration, HandleRegistry};
use crate::shutdown::{HookPriority, ShutdownCoordinator, ShutdownHook};
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Spawns and supervises isolated children
///
/// Cloning is cheap; clones share runs and history.
#[derive(Clone)]
pub struct IsolatedRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    registry: HandleRegistry,
    defaults: RunOptions,
    owner: Owner,
    ids: RunIdGenerator,
    active: DashMap<RunId, Arc<RunRecord>, RandomState>,
    history: Mutex<VecDeque<ProcessSnapshot>>,
}

/// Mutable part of a run record
#[derive(Debug)]
struct RunState {
    status: ProcessStatus,
    heartbeats: u64,
    last_heartbeat: Option<Instant>,
    exit_code: Option<i32>,
    signal: Option<i32>,
    error: Option<RunError>,
    finished: Option<Instant>,
}

/// A managed child process
struct RunRecord {
    run_id: RunId,
    pid: Pid,
    program: String,
    entry: String,
    owner: Owner,
    started: Instant,
    started_at_ms: u64,
    kill: Arc<watch::Sender<bool>>,
    state: Mutex<RunState>,
}

impl RunRecord {
    fn status(&self) -> ProcessStatus {
        self.state.lock().status
    }

    /// Apply a status transition; invalid ones are ignored
    fn transition(&self, next: ProcessStatus) -> bool {
        let mut state = self.state.lock();
        if !state.status.can_transition_to(next) {
            debug!(
                run_id = %self.run_id,
                from = %state.status,
                to = %next,
                "ignoring invalid status transition"
            );
            return false;
        }
        debug!(
            run_id = %self.run_id,
            pid = self.pid,
            from = %state.status,
            to = %next,
            "status changed"
        );
        state.status = next;
        true
    }

    fn heartbeat(&self) {
        let mut state = self.state.lock();
        state.heartbeats += 1;
        state.last_heartbeat = Some(Instant::now());
    }

    fn record_exit(&self, status: &ExitStatus) {
        let mut state = self.state.lock();
        state.exit_code = status.code();
        state.signal = status.signal();
    }

    fn finish(&self, error: Option<RunError>) {
        let mut state = self.state.lock();
        state.error = error;
        state.finished = Some(Instant::now());
    }

    fn snapshot(&self) -> ProcessSnapshot {
        let state = self.state.lock();
        let end = state.finished.unwrap_or_else(Instant::now);
        ProcessSnapshot {
            run_id: self.run_id,
            pid: self.pid,
            program: self.program.clone(),
            entry: self.entry.clone(),
            owner: self.owner.clone(),
            status: state.status,
            started_at_ms: self.started_at_ms,
            elapsed_ms: millis(end.saturating_duration_since(self.started)),
            heartbeats: state.heartbeats,
            last_heartbeat_ms_ago: state.last_heartbeat.map(|at| millis(at.elapsed())),
            exit_code: state.exit_code,
            signal: state.signal,
            error: state.error.clone(),
        }
    }
}

/// A run in flight
///
/// Dropping it does not stop the child: the supervisor keeps running and the
/// registered handle still lets a cleanup sweep reap it.
pub struct IsolatedRun {
    run_id: RunId,
    pid: Pid,
    kill: Arc<watch::Sender<bool>>,
    task: JoinHandle<Result<WorkOutput, RunError>>,
}

impl IsolatedRun {
    pub fn id(&self) -> RunId {
        self.run_id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Request termination; the result of `wait` becomes `RunError::Killed`
    pub fn kill(&self) {
        self.kill.send_replace(true);
    }

    /// Wait for the supervisor to finish
    pub async fn wait(self) -> Result<WorkOutput, RunError> {
        match self.task.await {
            Ok(result) => result,
            Err(join_error) => Err(RunError::Io {
                pid: self.pid,
                cause: format!("supervisor task failed: {}", join_error),
            }),
        }
    }
}

impl IsolatedRunner {
    pub fn new(registry: HandleRegistry, config: &LifecycleConfig) -> Self {
        Self::with_owner(registry, config, RUNNER_HANDLE_OWNER)
    }

    /// Runner registering its children under a custom owner
    pub fn with_owner(
        registry: HandleRegistry,
        config: &LifecycleConfig,
        owner: impl Into<Owner>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                registry,
                defaults: RunOptions::from_config(config),
                owner: owner.into(),
                ids: RunIdGenerator::default_start(),
                active: DashMap::with_hasher(RandomState::new()),
                history: Mutex::new(VecDeque::with_capacity(RUN_HISTORY_CAPACITY)),
            }),
        }
    }

    /// Options derived from the runner's configuration
    pub fn default_options(&self) -> RunOptions {
        self.inner.defaults.clone()
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Run `work` in a child process and wait for its result
    pub async fn run_isolated(
        &self,
        work: IsolatedWork,
        options: RunOptions,
    ) -> Result<WorkOutput, RunError> {
        self.spawn_isolated(work, options)?.wait().await
    }

    /// Spawn `work` and return immediately
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_isolated(
        &self,
        work: IsolatedWork,
        options: RunOptions,
    ) -> Result<IsolatedRun, RunError> {
        let SpawnedChild {
            child,
            pid,
            stdin,
            stdout,
        } = executor::spawn(&work, &options)?;

        let run_id = self.inner.ids.next();
        let owner = options
            .owner
            .clone()
            .unwrap_or_else(|| self.inner.owner.clone());
        let (kill_tx, kill_rx) = watch::channel(false);
        let kill = Arc::new(kill_tx);
        let (done_tx, done_rx) = watch::channel(None);

        let handle_id = self.inner.registry.register_with(
            self.child_handle(pid, &options, kill.clone(), done_rx)
                .with_label(format!("{} {} (pid {})", work.entry, run_id, pid)),
        );

        let record = Arc::new(RunRecord {
            run_id,
            pid,
            program: work.program.display().to_string(),
            entry: work.entry.clone(),
            owner,
            started: Instant::now(),
            started_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(millis)
                .unwrap_or(0),
            kill: kill.clone(),
            state: Mutex::new(RunState {
                status: ProcessStatus::Starting,
                heartbeats: 0,
                last_heartbeat: None,
                exit_code: None,
                signal: None,
                error: None,
                finished: None,
            }),
        });
        self.inner.active.insert(run_id, record.clone());

        let supervisor = Supervisor {
            inner: self.inner.clone(),
            record,
            child,
            ipc: IpcChannel::open(pid, stdin, stdout),
            options,
            entry: work.entry,
            payload: work.payload,
            handle_id,
            kill_rx,
            done_tx,
        };
        let span = info_span!("isolated_run", %run_id, pid);
        let task = tokio::spawn(supervisor.run().instrument(span));

        Ok(IsolatedRun {
            run_id,
            pid,
            kill,
            task,
        })
    }

    /// Handle registered for every child
    ///
    /// Close asks the supervisor to terminate and waits for the final status;
    /// escalation SIGKILLs the process group.
    fn child_handle(
        &self,
        pid: Pid,
        options: &RunOptions,
        kill: Arc<watch::Sender<bool>>,
        mut done: watch::Receiver<Option<ProcessStatus>>,
    ) -> HandleRegistration {
        let owner = options
            .owner
            .clone()
            .unwrap_or_else(|| self.inner.owner.clone());
        let reap_budget = options.termination_timeout + KILL_REAP_TIMEOUT;

        HandleRegistration::new(HandleKind::ChildProcess, owner, move || async move {
            kill.send_replace(true);
            // A supervisor gone without reporting counts as reaped; the
            // escalation follows either way
            let reaped = timeout(reap_budget, done.wait_for(Option::is_some))
                .await
                .is_ok();
            if reaped {
                Ok(())
            } else {
                Err(anyhow::anyhow!(
                    "child {} not reaped within {}ms",
                    pid,
                    millis(reap_budget)
                ))
            }
        })
        .with_force_kill(move || executor::kill_group(pid))
    }

    /// Request termination of a live run
    pub fn kill(&self, run_id: RunId) -> bool {
        match self.inner.active.get(&run_id) {
            Some(record) => {
                record.kill.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Current snapshot of a live or recently finished run
    pub fn status(&self, run_id: RunId) -> Option<ProcessSnapshot> {
        if let Some(record) = self.inner.active.get(&run_id) {
            return Some(record.snapshot());
        }
        self.inner
            .history
            .lock()
            .iter()
            .rev()
            .find(|snapshot| snapshot.run_id == run_id)
            .cloned()
    }

    /// Snapshots of all live runs
    pub fn snapshots(&self) -> Vec<ProcessSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .active
            .iter()
            .map(|record| record.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.run_id);
        snapshots
    }

    /// Final snapshots of finished runs, oldest first
    pub fn history(&self) -> Vec<ProcessSnapshot> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Register a high-priority hook that reaps this runner's children
    pub fn register_shutdown_hook(
        &self,
        coordinator: &ShutdownCoordinator,
    ) -> Result<(), RegistrationError> {
        let registry = self.inner.registry.clone();
        let owner = self.inner.owner.clone();
        let budget = self.inner.defaults.termination_timeout + KILL_REAP_TIMEOUT;

        let hook = ShutdownHook::new(RUNNER_HANDLE_OWNER, HookPriority::High, move || {
            let registry = registry.clone();
            let owner = owner.clone();
            async move {
                let report = registry.force_cleanup(&owner, budget).await;
                if report.abandoned_count() > 0 {
                    anyhow::bail!("{}", report);
                }
                Ok(())
            }
        })
        .with_timeout(budget + KILL_REAP_TIMEOUT);

        coordinator.register_hook(hook)
    }
}

impl std::fmt::Debug for IsolatedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedRunner")
            .field("owner", &self.inner.owner)
            .field("active", &self.inner.active.len())
            .finish()
    }
}

// ============================================================================
// Supervision
// ============================================================================

/// How a termination attempt ended
enum Termination {
    /// Exited after SIGTERM (or had already exited)
    Exited,
    /// Ignored SIGTERM and was SIGKILLed
    Killed,
    /// Still present after SIGKILL
    Unkillable,
}

enum Event {
    Message(Option<ChildMessage>),
    Exited(std::io::Result<ExitStatus>),
    HeartbeatCheck,
    ProcessDeadline,
    KillRequested,
}

struct Supervisor {
    inner: Arc<RunnerInner>,
    record: Arc<RunRecord>,
    child: Child,
    ipc: IpcChannel,
    options: RunOptions,
    entry: String,
    payload: serde_json::Value,
    handle_id: HandleId,
    kill_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<Option<ProcessStatus>>,
}

impl Supervisor {
    async fn run(mut self) -> Result<WorkOutput, RunError> {
        let result = self.drive().await;
        self.finish(&result);
        result
    }

    fn pid(&self) -> Pid {
        self.record.pid
    }

    async fn drive(&mut self) -> Result<WorkOutput, RunError> {
        let pid = self.pid();
        let started = tokio::time::Instant::from_std(self.record.started);
        let process_deadline = started + self.options.process_timeout;

        // The process timeout bounds the handshake too
        let handshake_deadline = started + self.options.handshake_timeout;
        let handshake_phase = if handshake_deadline < process_deadline {
            TimeoutPhase::Handshake
        } else {
            TimeoutPhase::Running
        };

        let event = tokio::select! {
            biased;
            _ = kill_requested(&mut self.kill_rx) => Event::KillRequested,
            message = self.ipc.recv() => Event::Message(message),
            _ = sleep_until(handshake_deadline.min(process_deadline)) => Event::ProcessDeadline,
        };
        match event {
            Event::Message(Some(ChildMessage::Ready { .. })) => {
                self.record.transition(ProcessStatus::Running);
                self.record.heartbeat();
            }
            Event::Message(Some(other)) => {
                self.record.transition(ProcessStatus::Failed);
                self.terminate().await;
                return Err(RunError::Protocol {
                    pid,
                    detail: format!("expected ready, got {:?}", other),
                });
            }
            Event::Message(None) => return Err(self.crashed().await),
            Event::KillRequested => return Err(self.killed().await),
            _ => return Err(self.time_out(handshake_phase).await),
        }

        if let Err(e) = self
            .ipc
            .send(&HostMessage::Start {
                entry: self.entry.clone(),
                payload: std::mem::take(&mut self.payload),
            })
            .await
        {
            // Child died between handshake and start
            if let Ok(Some(_)) = self.child.try_wait() {
                return Err(self.crashed().await);
            }
            self.record.transition(ProcessStatus::Failed);
            self.terminate().await;
            return Err(e);
        }

        let check_every = self.options.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat_check = interval_at(tokio::time::Instant::now() + check_every, check_every);
        heartbeat_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ipc_open = true;

        loop {
            let event = tokio::select! {
                biased;
                _ = kill_requested(&mut self.kill_rx) => Event::KillRequested,
                message = self.ipc.recv(), if ipc_open => Event::Message(message),
                status = self.child.wait() => Event::Exited(status),
                _ = sleep_until(process_deadline) => Event::ProcessDeadline,
                _ = heartbeat_check.tick() => Event::HeartbeatCheck,
            };

            match event {
                Event::Message(Some(ChildMessage::Heartbeat { seq })) => {
                    debug!(pid, seq, "heartbeat");
                    self.record.heartbeat();
                }
                Event::Message(Some(ChildMessage::Completed { output })) => {
                    return Ok(self.completed(output).await);
                }
                Event::Message(Some(ChildMessage::Failed { error })) => {
                    return Err(self.work_failed(error).await);
                }
                Event::Message(Some(ChildMessage::Ready { .. })) => {
                    debug!(pid, "ignoring repeated ready");
                }
                Event::Message(None) => {
                    debug!(pid, "child closed stdout");
                    ipc_open = false;
                }
                Event::Exited(Ok(status)) => {
                    self.record.record_exit(&status);
                    // The result may still be in flight on the pipe
                    let pending = self.ipc.drain(IPC_DRAIN_TIMEOUT).await;
                    for message in pending {
                        match message {
                            ChildMessage::Completed { output } => {
                                return Ok(self.completed(output).await)
                            }
                            ChildMessage::Failed { error } => {
                                return Err(self.work_failed(error).await)
                            }
                            _ => {}
                        }
                    }
                    return Err(self.crashed().await);
                }
                Event::Exited(Err(e)) => {
                    self.record.transition(ProcessStatus::Failed);
                    self.terminate().await;
                    return Err(RunError::Io {
                        pid,
                        cause: e.to_string(),
                    });
                }
                Event::HeartbeatCheck => {
                    let silent_for = self
                        .record
                        .state
                        .lock()
                        .last_heartbeat
                        .map(|at| at.elapsed())
                        .unwrap_or_default();
                    if silent_for > self.options.unresponsive_after() {
                        warn!(pid, silent_ms = millis(silent_for), "child stopped sending heartbeats");
                        return Err(self.time_out(TimeoutPhase::Unresponsive).await);
                    }
                }
                Event::ProcessDeadline => {
                    warn!(
                        pid,
                        timeout_ms = millis(self.options.process_timeout),
                        "child exceeded process timeout"
                    );
                    return Err(self.time_out(TimeoutPhase::Running).await);
                }
                Event::KillRequested => return Err(self.killed().await),
            }
        }
    }

    async fn completed(&mut self, value: serde_json::Value) -> WorkOutput {
        self.record.transition(ProcessStatus::Completed);
        // The worker exits right after reporting; anything else is stray
        match timeout(self.options.termination_timeout, self.child.wait()).await {
            Ok(Ok(status)) => self.record.record_exit(&status),
            _ => {
                warn!(pid = self.pid(), "child lingered after completing");
                self.terminate().await;
            }
        }
        WorkOutput {
            run_id: self.record.run_id,
            pid: self.pid(),
            value,
            elapsed_ms: millis(self.record.started.elapsed()),
        }
    }

    async fn work_failed(&mut self, message: String) -> RunError {
        self.record.transition(ProcessStatus::Failed);
        if timeout(self.options.termination_timeout, self.child.wait())
            .await
            .is_err()
        {
            self.terminate().await;
        }
        RunError::WorkFailed {
            pid: self.pid(),
            message,
        }
    }

    async fn crashed(&mut self) -> RunError {
        self.record.transition(ProcessStatus::Failed);
        let status = match timeout(IPC_DRAIN_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                self.terminate().await;
                None
            }
        };
        if let Some(status) = &status {
            self.record.record_exit(status);
        }
        RunError::ChildCrashed {
            pid: self.pid(),
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
        }
    }

    async fn time_out(&mut self, phase: TimeoutPhase) -> RunError {
        let pid = self.pid();
        self.record.transition(ProcessStatus::TimedOut);
        match self.terminate().await {
            Termination::Exited => RunError::Timeout { pid, phase },
            Termination::Killed => RunError::Timeout {
                pid,
                phase: TimeoutPhase::Termination,
            },
            Termination::Unkillable => RunError::ChildKillFailed { pid },
        }
    }

    async fn killed(&mut self) -> RunError {
        let pid = self.pid();
        info!(pid, "terminating child on request");
        let termination = self.terminate().await;
        self.record.transition(ProcessStatus::Killed);
        match termination {
            Termination::Unkillable => RunError::ChildKillFailed { pid },
            _ => RunError::Killed {
                run_id: self.record.run_id,
                pid,
            },
        }
    }

    /// SIGTERM the group, then SIGKILL once `termination_timeout` passes
    async fn terminate(&mut self) -> Termination {
        let pid = self.pid();
        if let Ok(Some(status)) = self.child.try_wait() {
            self.record.record_exit(&status);
            // Grandchildren may outlive the leader
            let _ = executor::kill_group(pid);
            return Termination::Exited;
        }

        if let Err(e) = executor::terminate_group(pid) {
            warn!(pid, error = %e, "SIGTERM to process group failed");
        }
        if let Ok(Ok(status)) = timeout(self.options.termination_timeout, self.child.wait()).await {
            self.record.record_exit(&status);
            let _ = executor::kill_group(pid);
            return Termination::Exited;
        }

        warn!(
            pid,
            grace_ms = millis(self.options.termination_timeout),
            "child ignored SIGTERM, killing"
        );
        if let Err(e) = executor::kill_group(pid) {
            warn!(pid, error = %e, "SIGKILL to process group failed");
        }
        let _ = self.child.start_kill();
        self.record.transition(ProcessStatus::Killed);

        match timeout(KILL_REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.record.record_exit(&status);
                Termination::Killed
            }
            _ => {
                warn!(pid, "child survived SIGKILL");
                Termination::Unkillable
            }
        }
    }

    fn finish(&mut self, result: &Result<WorkOutput, RunError>) {
        let pid = self.pid();
        self.ipc.close();
        self.inner.registry.unregister(self.handle_id);

        self.record.finish(result.as_ref().err().cloned());
        let snapshot = self.record.snapshot();
        match result {
            Ok(output) => info!(pid, elapsed_ms = output.elapsed_ms, "isolated run completed"),
            Err(e) => warn!(pid, status = %snapshot.status, error = %e, "isolated run ended with error"),
        }

        self.inner.active.remove(&self.record.run_id);
        {
            let mut history = self.inner.history.lock();
            if history.len() == RUN_HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(snapshot);
        }
        self.done_tx.send_replace(Some(self.record.status()));
    }
}

/// Resolves once a kill was requested; never if every sender is gone
async fn kill_requested(rx: &mut watch::Receiver<bool>) {
    let requested = rx.wait_for(|requested| *requested).await.is_ok();
    if !requested {
        futures::future::pending::<()>().await;
    }
}
