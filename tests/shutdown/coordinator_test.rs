/*!
 * Shutdown Coordinator Tests
 * Ordering, concurrency, timeouts and deadline handling of hook execution
 */

use ai_os_lifecycle::{
    CoordinatorState, ForcedExit, HandleKind, HandleRegistry, HookError, HookPriority,
    HookStatus, LifecycleConfig, RegistrationError, ShutdownCoordinator, ShutdownError,
    ShutdownHook, ShutdownReason,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn coordinator() -> ShutdownCoordinator {
    ShutdownCoordinator::new(LifecycleConfig::new().with_forced_exit(ForcedExit::Disabled))
}

fn sleeper(name: &str, priority: HookPriority, ms: u64) -> ShutdownHook {
    ShutdownHook::new(name, priority, move || async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    })
}

fn hanging(name: &str, priority: HookPriority) -> ShutdownHook {
    ShutdownHook::new(name, priority, || async {
        futures::future::pending::<()>().await;
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependents_run_concurrently_after_dependency() {
    let coordinator = coordinator();
    coordinator
        .register_hook(sleeper("a", HookPriority::Normal, 100))
        .unwrap();
    coordinator
        .register_hook(sleeper("b", HookPriority::Normal, 100).depends_on("a"))
        .unwrap();
    coordinator
        .register_hook(sleeper("c", HookPriority::Normal, 100).depends_on("a"))
        .unwrap();

    let report = coordinator
        .shutdown(ShutdownReason::TestTeardown, Duration::from_secs(2))
        .await;
    assert!(report.all_hooks_completed());

    let a = report.hook("a").unwrap();
    let b = report.hook("b").unwrap();
    let c = report.hook("c").unwrap();
    let a_done = a.finished_offset_ms().unwrap();
    let b_start = b.started_offset_ms.unwrap();
    let c_start = c.started_offset_ms.unwrap();

    assert!(b_start >= a_done);
    assert!(c_start >= a_done);
    assert!(b_start.abs_diff(c_start) < 50, "b and c did not overlap");
    // a then (b || c), not a then b then c
    assert!(report.elapsed_ms < 290, "took {}ms", report.elapsed_ms);
}

#[tokio::test]
async fn test_tiers_run_in_priority_order() {
    let coordinator = coordinator();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for (name, priority) in [
        ("cleanup", HookPriority::Cleanup),
        ("normal", HookPriority::Normal),
        ("critical", HookPriority::Critical),
        ("high", HookPriority::High),
        ("low", HookPriority::Low),
    ] {
        let order = order.clone();
        coordinator
            .register_hook(ShutdownHook::new(name, priority, move || {
                let order = order.clone();
                async move {
                    order.lock().push(name);
                    Ok(())
                }
            }))
            .unwrap();
    }

    coordinator
        .shutdown(ShutdownReason::TestTeardown, Duration::from_secs(1))
        .await;

    assert_eq!(
        *order.lock(),
        vec!["critical", "high", "normal", "low", "cleanup"]
    );
}

#[tokio::test]
async fn test_hook_timeout_does_not_block_others() {
    let coordinator = coordinator();
    coordinator
        .register_hook(hanging("stuck", HookPriority::High).with_timeout(Duration::from_millis(50)))
        .unwrap();
    coordinator
        .register_hook(sleeper("after", HookPriority::High, 5).depends_on("stuck"))
        .unwrap();
    coordinator
        .register_hook(sleeper("later", HookPriority::Low, 5))
        .unwrap();

    let report = coordinator
        .shutdown(ShutdownReason::TestTeardown, Duration::from_secs(2))
        .await;

    let stuck = report.hook("stuck").unwrap();
    assert_eq!(stuck.status, HookStatus::TimedOut);
    assert_eq!(
        stuck.error,
        Some(HookError::TimedOut {
            name: "stuck".into(),
            timeout_ms: 50
        })
    );
    assert_eq!(report.hook("after").unwrap().status, HookStatus::Completed);
    assert_eq!(report.hook("later").unwrap().status, HookStatus::Completed);
    assert!(report.elapsed_ms < 500);
}

#[tokio::test]
async fn test_global_deadline_skips_remaining_hooks() {
    let coordinator = coordinator();
    coordinator
        .register_hook(hanging("stuck", HookPriority::Critical).with_timeout(Duration::from_secs(10)))
        .unwrap();
    coordinator
        .register_hook(sleeper("never", HookPriority::Cleanup, 1))
        .unwrap();

    let start = Instant::now();
    let report = coordinator
        .shutdown(ShutdownReason::TestTeardown, Duration::from_millis(300))
        .await;

    assert!(start.elapsed() < Duration::from_millis(800));
    assert_eq!(report.hook("stuck").unwrap().status, HookStatus::TimedOut);
    assert_eq!(report.hook("never").unwrap().status, HookStatus::Skipped);
    assert!(!report.forced_exit);
    assert_eq!(report.state, CoordinatorState::Completed);
}

#[tokio::test]
async fn test_panicking_hook_is_contained() {
    let coordinator = coordinator();
    coordinator
        .register_hook(ShutdownHook::new("boom", HookPriority::Normal, || async {
            panic!("hook exploded");
        }))
        .unwrap();
    coordinator
        .register_hook(sleeper("fine", HookPriority::Normal, 1))
        .unwrap();

    let report = coordinator
        .shutdown(ShutdownReason::TestTeardown, Duration::from_secs(1))
        .await;

    assert_eq!(report.hook("boom").unwrap().status, HookStatus::Panicked);
    assert_eq!(report.hook("fine").unwrap().status, HookStatus::Completed);
    assert_eq!(report.summary().failed_hooks, vec!["boom".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_share_one_sequence() {
    let coordinator = coordinator();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = runs.clone();
    coordinator
        .register_hook(ShutdownHook::new("once", HookPriority::Normal, move || {
            let runs = runs_clone.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }
        }))
        .unwrap();

    let (first, second, third) = tokio::join!(
        coordinator.shutdown(
            ShutdownReason::Signal("SIGTERM".into()),
            Duration::from_secs(1)
        ),
        coordinator.shutdown(
            ShutdownReason::Signal("SIGINT".into()),
            Duration::from_secs(1)
        ),
        coordinator.shutdown_now(ShutdownReason::NormalExit),
    );

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(first.shutdown_id, second.shutdown_id);
    assert_eq!(first.shutdown_id, third.shutdown_id);
    assert_eq!(first.reason, ShutdownReason::Signal("SIGTERM".into()));
}

#[test]
fn test_registration_rejects_cycles_and_inversions() {
    let coordinator = coordinator();
    coordinator
        .register_hook(sleeper("a", HookPriority::Normal, 1).depends_on("b"))
        .unwrap();

    let cycle = coordinator.register_hook(sleeper("b", HookPriority::Normal, 1).depends_on("a"));
    assert!(matches!(cycle, Err(RegistrationError::CycleDetected { .. })));

    let inversion =
        coordinator.register_hook(sleeper("early", HookPriority::Critical, 1).depends_on("a"));
    assert!(matches!(
        inversion,
        Err(RegistrationError::PriorityInversion { .. })
    ));

    let duplicate = coordinator.register_hook(sleeper("a", HookPriority::Low, 1));
    assert!(matches!(duplicate, Err(RegistrationError::DuplicateHook(_))));

    assert_eq!(coordinator.hook_names(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_overrun_takes_forced_exit_path() {
    let config = LifecycleConfig::new()
        .with_global_shutdown_deadline(Duration::from_millis(100))
        .with_finalize_floor(Duration::from_millis(500))
        .with_exit_grace(Duration::from_millis(250))
        .with_forced_exit(ForcedExit::Disabled);
    let registry = HandleRegistry::from_config(&config);
    let coordinator = ShutdownCoordinator::new(config);
    coordinator.set_handle_registry(registry.clone());

    coordinator
        .register_hook(hanging("stuck", HookPriority::Normal).with_timeout(Duration::from_secs(10)))
        .unwrap();
    registry.register(HandleKind::Stream, "app", || async {
        futures::future::pending::<()>().await;
        Ok(())
    });

    // The sweep still gets its 500ms floor after the 100ms deadline, which
    // overshoots deadline + grace
    let report = coordinator.shutdown_now(ShutdownReason::TestTeardown).await;

    assert!(report.forced_exit);
    assert_eq!(report.state, CoordinatorState::ForcedExit);
    assert_eq!(coordinator.state(), CoordinatorState::ForcedExit);
    assert!(report.elapsed_ms > 350, "elapsed {}ms", report.elapsed_ms);
    assert_eq!(report.hook("stuck").unwrap().status, HookStatus::TimedOut);
    assert_eq!(report.cleanup.abandoned_count(), 1);
    assert!(matches!(
        report.deadline_error(),
        Some(ShutdownError::DeadlineExceeded { deadline_ms: 100, .. })
    ));
    assert!(report.summary().to_string().contains("deadline exceeded"));
}
