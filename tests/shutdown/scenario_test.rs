/*!
 * Cascading Shutdown Scenario
 *
 * Hooks on three tiers plus a registry holding timers and child processes,
 * two of which never close, all under one global deadline.
 */

use ai_os_lifecycle::{
    CoordinatorState, ForcedExit, HandleKind, HandleRegistration, HandleRegistry, HookPriority,
    LifecycleConfig, ShutdownCoordinator, ShutdownHook, ShutdownReason,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cascading_shutdown_within_deadline() {
    let config = LifecycleConfig::new()
        .with_global_shutdown_deadline(Duration::from_millis(2000))
        .with_forced_exit(ForcedExit::Disabled);
    let registry = HandleRegistry::from_config(&config);
    let coordinator = ShutdownCoordinator::new(config);
    coordinator.set_handle_registry(registry.clone());

    for (name, priority) in [
        ("stop-accepting", HookPriority::Critical),
        ("drain-sessions", HookPriority::High),
        ("remove-temp-files", HookPriority::Cleanup),
    ] {
        coordinator
            .register_hook(ShutdownHook::new(name, priority, || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }))
            .unwrap();
    }

    let timers_closed = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let timers_closed = timers_closed.clone();
        registry.register(HandleKind::Timer, "scheduler", move || async move {
            timers_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    let kills = Arc::new(AtomicUsize::new(0));
    for i in 0..5 {
        let hangs = i < 2;
        let kills = kills.clone();
        registry.register_with(
            HandleRegistration::new(HandleKind::ChildProcess, "runner", move || async move {
                if hangs {
                    futures::future::pending::<()>().await;
                }
                Ok(())
            })
            .with_force_kill(move || {
                kills.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
    }

    let start = Instant::now();
    let report = coordinator.shutdown_now(ShutdownReason::TestTeardown).await;
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_millis(2250), "took {:?}", elapsed);
    assert_eq!(report.state, CoordinatorState::Completed);
    assert!(!report.forced_exit);
    assert!(report.all_hooks_completed());
    assert_eq!(report.hooks.len(), 3);

    assert_eq!(report.cleanup.attempted(), 10);
    assert_eq!(report.cleanup.abandoned_count(), 2);
    assert_eq!(report.cleanup.killed_processes(), 2);
    assert_eq!(timers_closed.load(Ordering::SeqCst), 5);
    // Children are always escalated, clean close or not
    assert_eq!(kills.load(Ordering::SeqCst), 5);
    assert!(registry.is_empty());

    let summary = report.summary();
    assert_eq!(summary.abandoned_handles, 2);
    assert_eq!(
        summary.to_string(),
        "shutdown: 2 handles abandoned, 2 processes killed"
    );
    assert_eq!(coordinator.state(), CoordinatorState::Completed);
}
