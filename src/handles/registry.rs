/*!
 * Handle Registry
 *
 * Tracks every timer, interval, child process, stream and listener the host
 * allocates so a shutdown can always release them.
 *
 * # Guarantees
 *
 * - **At most once**: a handle leaves the table before its close runs, so a
 *   forced sweep and an owner's `unregister` can never both act on it
 * - **Bounded**: `force_cleanup_all(d)` returns within `d` (plus
 *   `ESCALATION_FLOOR` for late escalations and scheduling overhead), no
 *   matter how many close operations or escalations hang
 * - **Never throws**: close failures, panics and hangs become report entries
 *
 * Close operations run on a bounded number of concurrent slots. Each one
 * gets `deadline / ceil(n / slots)` (at least `MIN_CLOSE_SLICE`) and is
 * abandoned, not cancelled, once that slice is spent: the detached task
 * keeps running but nobody waits on it. Blocking closes and escalations run
 * on detached OS threads rather than the runtime's blocking pool, which a
 * runtime waits for when it is dropped.
 */

use super::report::{CleanupReport, CleanupScope, CloseStatus, HandleOutcome};
use super::types::{CloseOp, Closer, ForceKillFn, HandleEntry, HandleInfo, HandleKind, HandleRegistration};
use crate::core::config::LifecycleConfig;
use crate::core::deadline::Deadline;
use crate::core::id::{HandleId, HandleIdGenerator};
use crate::core::limits::{
    DEFAULT_HANDLE_CLEANUP_CONCURRENCY, DEFAULT_HANDLE_CLEANUP_MAX, ESCALATION_FLOOR,
    MIN_CLOSE_SLICE,
};
use crate::core::types::{millis, Owner};
use ahash::RandomState;
use dashmap::DashMap;
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared table of tracked handles
///
/// Cloning is cheap and every clone sees the same table.
pub struct HandleRegistry {
    handles: Arc<DashMap<HandleId, HandleEntry, RandomState>>,
    ids: HandleIdGenerator,
    concurrency: usize,
    max_sweep: Duration,
}

/// A handle taken out of the table, waiting for its close result
struct PendingClose {
    kind: HandleKind,
    owner: Owner,
    force_kill: Option<ForceKillFn>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_HANDLE_CLEANUP_CONCURRENCY, DEFAULT_HANDLE_CLEANUP_MAX)
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self::with_limits(config.handle_cleanup_concurrency, config.handle_cleanup_max)
    }

    /// Registry with an explicit close worker budget and sweep ceiling
    pub fn with_limits(concurrency: usize, max_sweep: Duration) -> Self {
        Self {
            handles: Arc::new(DashMap::with_hasher(RandomState::new())),
            ids: HandleIdGenerator::default_start(),
            concurrency: concurrency.max(1),
            max_sweep,
        }
    }

    /// Track a resource released by an async close operation
    pub fn register<F, Fut>(&self, kind: HandleKind, owner: impl Into<Owner>, close: F) -> HandleId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_with(HandleRegistration::new(kind, owner, close))
    }

    /// Track a resource released by a synchronous close operation
    pub fn register_blocking<F>(&self, kind: HandleKind, owner: impl Into<Owner>, close: F) -> HandleId
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.register_with(HandleRegistration::blocking(kind, owner, close))
    }

    /// Track a resource described by a full registration
    pub fn register_with(&self, registration: HandleRegistration) -> HandleId {
        let id = self.ids.next();
        let entry = HandleEntry::from_registration(registration);
        debug!(handle_id = %id, kind = %entry.kind, owner = %entry.owner, "handle registered");
        self.handles.insert(id, entry);
        id
    }

    /// Forget a handle without closing it
    ///
    /// Used when the owner released the resource itself. Unknown ids (already
    /// swept, or unregistered twice) are a no-op; returns whether the handle
    /// was still tracked.
    pub fn unregister(&self, id: HandleId) -> bool {
        match self.handles.remove(&id) {
            Some((_, entry)) => {
                debug!(handle_id = %id, kind = %entry.kind, "handle unregistered");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Snapshot of all tracked handles, oldest first
    pub fn handles(&self) -> Vec<HandleInfo> {
        let mut infos: Vec<HandleInfo> = self
            .handles
            .iter()
            .map(|entry| entry.value().info(*entry.key()))
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Handles owned by `owner`
    pub fn owned_by(&self, owner: &str) -> Vec<HandleInfo> {
        self.handles()
            .into_iter()
            .filter(|info| info.owner == owner)
            .collect()
    }

    /// Handles registered longer ago than `older_than`, for leak diagnostics
    pub fn stale(&self, older_than: Duration) -> Vec<HandleInfo> {
        self.handles()
            .into_iter()
            .filter(|info| info.age() >= older_than)
            .collect()
    }

    pub fn count_by_kind(&self) -> HashMap<HandleKind, usize> {
        let mut counts = HashMap::new();
        for entry in self.handles.iter() {
            *counts.entry(entry.value().kind).or_insert(0) += 1;
        }
        counts
    }

    /// Close every tracked handle within `deadline`
    pub async fn force_cleanup_all(&self, deadline: Duration) -> CleanupReport {
        let taken = self.take_matching(|_| true);
        self.sweep(taken, deadline, CleanupScope::All).await
    }

    /// Close the handles of a single owner within `deadline`
    pub async fn force_cleanup(&self, owner: &str, deadline: Duration) -> CleanupReport {
        let taken = self.take_matching(|entry| entry.owner == owner);
        self.sweep(taken, deadline, CleanupScope::Owner(owner.to_string()))
            .await
    }

    /// Remove matching entries; whoever removes an entry owns its close
    fn take_matching<P>(&self, predicate: P) -> Vec<(HandleId, HandleEntry)>
    where
        P: Fn(&HandleEntry) -> bool,
    {
        let ids: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut taken: Vec<(HandleId, HandleEntry)> = ids
            .into_iter()
            .filter_map(|id| self.handles.remove(&id))
            .collect();
        taken.sort_by_key(|(id, _)| *id);
        taken
    }

    async fn sweep(
        &self,
        taken: Vec<(HandleId, HandleEntry)>,
        requested: Duration,
        scope: CleanupScope,
    ) -> CleanupReport {
        let budget = requested.min(self.max_sweep);
        if taken.is_empty() {
            return CleanupReport::empty(scope, budget);
        }

        let started = Instant::now();
        let deadline = Deadline::starting_at(started, budget);
        let waves = taken.len().div_ceil(self.concurrency);
        let slice = deadline.slice(waves, MIN_CLOSE_SLICE);

        info!(
            handles = taken.len(),
            budget_ms = millis(budget),
            slice_ms = millis(slice),
            concurrency = self.concurrency,
            "forcing handle cleanup"
        );

        // Escalations stay with the sweep rather than the close futures so
        // they are still issued for closes abandoned mid-flight.
        let mut pending: HashMap<HandleId, PendingClose> = HashMap::with_capacity(taken.len());
        let mut launches = Vec::with_capacity(taken.len());
        for (id, entry) in taken {
            let Closer { close, force_kill } = entry.closer.into_inner();
            pending.insert(
                id,
                PendingClose {
                    kind: entry.kind,
                    owner: entry.owner,
                    force_kill,
                },
            );
            launches.push((id, close));
        }

        let mut settled = Vec::with_capacity(pending.len());
        let mut closes = stream::iter(
            launches
                .into_iter()
                .map(|(id, close)| close_one(id, close, slice, deadline)),
        )
        .buffer_unordered(self.concurrency);

        loop {
            match tokio::time::timeout_at(deadline.tokio_instant(), closes.next()).await {
                Ok(Some((id, status))) => {
                    if let Some(pending_close) = pending.remove(&id) {
                        settled.push(settle(id, pending_close, status));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = pending.len(),
                        "handle cleanup deadline reached, abandoning remaining closes"
                    );
                    break;
                }
            }
        }
        drop(closes);

        let budget_ms = millis(slice.min(budget));
        for (id, pending_close) in pending {
            settled.push(settle(id, pending_close, CloseStatus::Abandoned { budget_ms }));
        }

        // Escalations are already running; wait for all of them together
        let wait = deadline.remaining().max(ESCALATION_FLOOR);
        let mut outcomes =
            futures::future::join_all(settled.into_iter().map(|s| s.complete(wait))).await;
        outcomes.sort_by_key(|o| o.id);

        let report = CleanupReport {
            scope,
            outcomes,
            deadline_ms: millis(budget),
            elapsed_ms: millis(started.elapsed()),
        };

        if report.is_clean() {
            info!(%report, "handle cleanup complete");
        } else {
            warn!(%report, "handle cleanup finished with errors");
        }
        report
    }
}

/// Run one close operation detached, waiting at most its slice
async fn close_one(
    id: HandleId,
    close: CloseOp,
    slice: Duration,
    deadline: Deadline,
) -> (HandleId, CloseStatus) {
    let budget = deadline.clamp(slice);
    let abandoned = CloseStatus::Abandoned {
        budget_ms: millis(budget),
    };

    let status = match close {
        CloseOp::Async(close) => match tokio::time::timeout(budget, tokio::spawn(close())).await {
            Ok(Ok(result)) => close_status(result),
            Ok(Err(join_error)) if join_error.is_panic() => CloseStatus::Panicked,
            Ok(Err(join_error)) => CloseStatus::Failed(join_error.to_string()),
            // Dropping the JoinHandle detaches the task
            Err(_) => abandoned,
        },
        CloseOp::Blocking(close) => match run_detached("handle-close", close) {
            Ok(result) => match tokio::time::timeout(budget, result.recv_async()).await {
                Ok(Ok(Ok(result))) => close_status(result),
                Ok(Ok(Err(_panic))) => CloseStatus::Panicked,
                Ok(Err(_)) => {
                    CloseStatus::Failed("close thread exited without a result".to_string())
                }
                Err(_) => abandoned,
            },
            Err(e) => CloseStatus::Failed(format!("failed to start close thread: {}", e)),
        },
    };
    (id, status)
}

fn close_status(result: anyhow::Result<()>) -> CloseStatus {
    match result {
        Ok(()) => CloseStatus::Closed,
        Err(e) => CloseStatus::Failed(format!("{:#}", e)),
    }
}

type Detached<T> = flume::Receiver<thread::Result<T>>;

/// Run `work` on a named OS thread nobody joins
///
/// The receiver yields the result or the panic payload. Work that never
/// returns just leaves its thread behind; it cannot hold up runtime shutdown.
fn run_detached<T, F>(name: &str, work: F) -> std::io::Result<Detached<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = flume::bounded(1);
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let _ = tx.send(panic::catch_unwind(AssertUnwindSafe(work)));
    })?;
    Ok(rx)
}

/// A close that has settled, with its escalation possibly still running
struct Settled {
    id: HandleId,
    kind: HandleKind,
    owner: Owner,
    status: CloseStatus,
    escalation: Option<std::io::Result<Detached<anyhow::Result<()>>>>,
}

/// Record a close result and start the forceful escalation when required
fn settle(id: HandleId, pending: PendingClose, status: CloseStatus) -> Settled {
    let PendingClose {
        kind,
        owner,
        force_kill,
    } = pending;

    let escalate = kind.always_escalates() || status != CloseStatus::Closed;
    let escalation = force_kill
        .filter(|_| escalate)
        .map(|force_kill| run_detached("handle-escalate", force_kill));

    Settled {
        id,
        kind,
        owner,
        status,
        escalation,
    }
}

impl Settled {
    /// Wait up to `wait` for the escalation and build the outcome
    async fn complete(self, wait: Duration) -> HandleOutcome {
        let Settled {
            id,
            kind,
            owner,
            status,
            escalation,
        } = self;

        let force_killed = escalation.is_some();
        let force_kill_error = match escalation {
            None => None,
            Some(Err(e)) => Some(format!("failed to start escalation thread: {}", e)),
            Some(Ok(result)) => match tokio::time::timeout(wait, result.recv_async()).await {
                Ok(Ok(Ok(Ok(())))) => None,
                Ok(Ok(Ok(Err(e)))) => Some(format!("{:#}", e)),
                Ok(Ok(Err(_panic))) => Some("escalation panicked".to_string()),
                Ok(Err(_)) => Some("escalation thread exited without a result".to_string()),
                Err(_) => Some(format!("escalation did not return within {}ms", millis(wait))),
            },
        };
        if let Some(error) = &force_kill_error {
            warn!(handle_id = %id, %kind, %error, "forceful escalation failed");
        }

        match &status {
            CloseStatus::Closed => debug!(handle_id = %id, %kind, force_killed, "handle closed"),
            CloseStatus::Failed(cause) => {
                warn!(handle_id = %id, %kind, %owner, %cause, "handle close failed")
            }
            CloseStatus::Panicked => warn!(handle_id = %id, %kind, %owner, "handle close panicked"),
            CloseStatus::Abandoned { budget_ms } => {
                warn!(handle_id = %id, %kind, %owner, budget_ms, "handle close abandoned")
            }
        }

        HandleOutcome {
            id,
            kind,
            owner,
            status,
            force_killed,
            force_kill_error,
        }
    }
}

impl Clone for HandleRegistry {
    fn clone(&self) -> Self {
        Self {
            handles: Arc::clone(&self.handles),
            ids: self.ids.clone(),
            concurrency: self.concurrency,
            max_sweep: self.max_sweep,
        }
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("handles", &self.handles.len())
            .field("concurrency", &self.concurrency)
            .field("max_sweep", &self.max_sweep)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = HandleRegistry::new();
        let id = registry.register_blocking(HandleKind::Timer, "tests", || Ok(()));

        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_handle_is_not_closed() {
        let registry = HandleRegistry::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();

        let id = registry.register(HandleKind::Stream, "tests", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.unregister(id);

        let report = registry.force_cleanup_all(Duration::from_millis(100)).await;
        assert_eq!(report.attempted(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_failure_is_recorded() {
        let registry = HandleRegistry::new();
        registry.register(HandleKind::Stream, "tests", || async {
            Err(anyhow::anyhow!("flush failed"))
        });
        registry.register_blocking(HandleKind::Timer, "tests", || Ok(()));

        let report = registry.force_cleanup_all(Duration::from_millis(500)).await;

        assert_eq!(report.attempted(), 2);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.closed().count(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_panic_is_contained() {
        let registry = HandleRegistry::new();
        registry.register_blocking(HandleKind::Custom, "tests", || panic!("boom"));

        let report = registry.force_cleanup_all(Duration::from_millis(500)).await;
        assert_eq!(report.outcomes[0].status, CloseStatus::Panicked);
    }

    #[tokio::test]
    async fn test_child_process_always_escalates() {
        let registry = HandleRegistry::new();
        let kills = Arc::new(AtomicUsize::new(0));
        let counter = kills.clone();

        registry.register_with(
            HandleRegistration::blocking(HandleKind::ChildProcess, "tests", || Ok(()))
                .with_force_kill(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        );

        let report = registry.force_cleanup_all(Duration::from_millis(500)).await;
        assert_eq!(report.closed().count(), 1);
        assert_eq!(report.force_killed().count(), 1);
        // Closed gracefully, so not counted as a kill in summaries
        assert_eq!(report.killed_processes(), 0);
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_kinds_escalate_only_on_failure() {
        let registry = HandleRegistry::new();
        let kills = Arc::new(AtomicUsize::new(0));

        let ok_counter = kills.clone();
        registry.register_with(
            HandleRegistration::blocking(HandleKind::Stream, "tests", || Ok(())).with_force_kill(
                move || {
                    ok_counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            ),
        );
        let failed_counter = kills.clone();
        registry.register_with(
            HandleRegistration::blocking(HandleKind::Stream, "tests", || {
                Err(anyhow::anyhow!("stuck"))
            })
            .with_force_kill(move || {
                failed_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        registry.force_cleanup_all(Duration::from_millis(500)).await;
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hanging_close_is_abandoned() {
        let registry = HandleRegistry::new();
        registry.register(HandleKind::Stream, "tests", || async {
            futures::future::pending::<()>().await;
            Ok(())
        });

        let start = Instant::now();
        let report = registry.force_cleanup_all(Duration::from_millis(100)).await;

        assert!(start.elapsed() < Duration::from_millis(400));
        assert_eq!(report.abandoned_count(), 1);
    }

    #[tokio::test]
    async fn test_force_cleanup_scoped_to_owner() {
        let registry = HandleRegistry::new();
        registry.register_blocking(HandleKind::Timer, "session-a", || Ok(()));
        registry.register_blocking(HandleKind::Timer, "session-a", || Ok(()));
        let keep = registry.register_blocking(HandleKind::Timer, "session-b", || Ok(()));

        let report = registry
            .force_cleanup("session-a", Duration::from_millis(500))
            .await;

        assert_eq!(report.attempted(), 2);
        assert_eq!(report.scope, CleanupScope::Owner("session-a".into()));
        assert!(registry.contains(keep));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_capped_by_max() {
        let registry = HandleRegistry::with_limits(4, Duration::from_millis(50));
        registry.register(HandleKind::Stream, "tests", || async {
            futures::future::pending::<()>().await;
            Ok(())
        });

        let start = Instant::now();
        let report = registry.force_cleanup_all(Duration::from_secs(10)).await;

        assert_eq!(report.deadline_ms, 50);
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_diagnostics() {
        let registry = HandleRegistry::new();
        registry.register_blocking(HandleKind::Timer, "a", || Ok(()));
        registry.register_blocking(HandleKind::Timer, "b", || Ok(()));
        registry.register_blocking(HandleKind::Stream, "a", || Ok(()));

        let counts = registry.count_by_kind();
        assert_eq!(counts.get(&HandleKind::Timer), Some(&2));
        assert_eq!(registry.owned_by("a").len(), 2);
        assert_eq!(registry.stale(Duration::ZERO).len(), 3);
        assert!(registry.stale(Duration::from_secs(3600)).is_empty());
    }
}
