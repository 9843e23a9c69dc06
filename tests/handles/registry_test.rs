/*!
 * Handle Registry Tests
 * Bounded sweeps, at-most-once close and escalation under load
 */

use ai_os_lifecycle::{CloseStatus, HandleKind, HandleRegistration, HandleRegistry};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn counting_timer(registry: &HandleRegistry, owner: &str, closes: &Arc<AtomicUsize>) {
    let closes = closes.clone();
    registry.register(HandleKind::Timer, owner, move || async move {
        tokio::time::sleep(Duration::from_millis(2)).await;
        closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_is_bounded_with_hanging_handles() {
    let registry = HandleRegistry::with_limits(16, Duration::from_secs(5));
    let closes = Arc::new(AtomicUsize::new(0));

    for i in 0..300 {
        if i % 15 == 0 {
            registry.register(HandleKind::Stream, "load", || async {
                futures::future::pending::<()>().await;
                Ok(())
            });
        } else {
            counting_timer(&registry, "load", &closes);
        }
    }
    assert_eq!(registry.len(), 300);

    let start = Instant::now();
    let report = registry.force_cleanup_all(Duration::from_millis(500)).await;
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(800),
        "sweep took {:?}",
        elapsed
    );
    assert_eq!(report.attempted(), 300);
    assert_eq!(report.abandoned_count(), 20);
    assert_eq!(report.closed().count(), 280);
    assert_eq!(closes.load(Ordering::SeqCst), 280);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_second_sweep_is_a_no_op() {
    let registry = HandleRegistry::new();
    let closes = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        counting_timer(&registry, "app", &closes);
    }

    let first = registry.force_cleanup_all(Duration::from_secs(1)).await;
    let second = registry.force_cleanup_all(Duration::from_secs(1)).await;

    assert_eq!(first.attempted(), 5);
    assert_eq!(second.attempted(), 0);
    assert!(second.is_clean());
    assert_eq!(closes.load(Ordering::SeqCst), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sweeps_close_each_handle_once() {
    let registry = HandleRegistry::new();
    let closes = Arc::new(AtomicUsize::new(0));
    for i in 0..100 {
        let owner = if i % 2 == 0 { "even" } else { "odd" };
        counting_timer(&registry, owner, &closes);
    }

    let (all, even, again) = tokio::join!(
        registry.force_cleanup_all(Duration::from_secs(2)),
        registry.force_cleanup("even", Duration::from_secs(2)),
        registry.force_cleanup_all(Duration::from_secs(2)),
    );

    assert_eq!(all.attempted() + even.attempted() + again.attempted(), 100);
    assert_eq!(closes.load(Ordering::SeqCst), 100);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_unregister_races_with_sweep() {
    let registry = HandleRegistry::new();
    let closes = Arc::new(AtomicUsize::new(0));
    let ids: Vec<_> = (0..10)
        .map(|_| {
            let closes = closes.clone();
            registry.register(HandleKind::Interval, "app", move || async move {
                closes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .collect();

    // Owner released half of them on its own
    for id in &ids[..5] {
        assert!(registry.unregister(*id));
    }
    let report = registry.force_cleanup_all(Duration::from_secs(1)).await;

    assert_eq!(report.attempted(), 5);
    assert_eq!(closes.load(Ordering::SeqCst), 5);
    for id in &ids {
        assert!(!registry.unregister(*id));
    }
}

#[tokio::test]
async fn test_abandoned_child_is_force_killed() {
    let registry = HandleRegistry::new();
    let kills = Arc::new(AtomicUsize::new(0));
    let kills_clone = kills.clone();

    registry.register_with(
        HandleRegistration::new(HandleKind::ChildProcess, "runner", || async {
            futures::future::pending::<()>().await;
            Ok(())
        })
        .with_force_kill(move || {
            kills_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .with_label("stuck child"),
    );

    let report = registry.force_cleanup_all(Duration::from_millis(100)).await;
    let outcome = &report.outcomes[0];

    assert!(matches!(outcome.status, CloseStatus::Abandoned { .. }));
    assert!(outcome.force_killed);
    assert_eq!(kills.load(Ordering::SeqCst), 1);
    assert_eq!(report.killed_processes(), 1);
}

#[tokio::test]
async fn test_failed_escalation_is_reported() {
    let registry = HandleRegistry::new();
    registry.register_with(
        HandleRegistration::new(HandleKind::ChildProcess, "runner", || async { Ok(()) })
            .with_force_kill(|| Err(anyhow::anyhow!("EPERM"))),
    );

    let report = registry.force_cleanup_all(Duration::from_millis(200)).await;
    let outcome = &report.outcomes[0];

    assert_eq!(outcome.status, CloseStatus::Closed);
    assert!(outcome.force_kill_error.as_deref().unwrap().contains("EPERM"));
    assert!(!report.is_clean());
}

#[tokio::test]
async fn test_blocking_close_does_not_stall_sweep() {
    let registry = HandleRegistry::new();
    let closes = Arc::new(AtomicUsize::new(0));

    registry.register_blocking(HandleKind::Custom, "ffi", || {
        std::thread::sleep(Duration::from_millis(400));
        Ok(())
    });
    for _ in 0..3 {
        counting_timer(&registry, "app", &closes);
    }

    let start = Instant::now();
    let report = registry.force_cleanup_all(Duration::from_millis(100)).await;

    assert!(start.elapsed() < Duration::from_millis(350));
    assert_eq!(report.abandoned_count(), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 3);
}

#[test]
fn test_runtime_drops_after_abandoning_blocking_close() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let registry = HandleRegistry::new();
    registry.register_blocking(HandleKind::Custom, "ffi", || loop {
        std::thread::sleep(Duration::from_secs(3600));
    });

    let report = rt.block_on(registry.force_cleanup_all(Duration::from_millis(100)));
    assert_eq!(report.abandoned_count(), 1);

    // A runtime waits for its blocking pool on drop; the hung close must not be on it
    let (dropped_tx, dropped_rx) = flume::bounded(1);
    std::thread::spawn(move || {
        drop(rt);
        let _ = dropped_tx.send(());
    });
    assert!(
        dropped_rx.recv_timeout(Duration::from_secs(3)).is_ok(),
        "runtime did not finish dropping"
    );
}

#[tokio::test]
async fn test_hanging_escalation_is_time_boxed() {
    let registry = HandleRegistry::new();
    registry.register_with(
        HandleRegistration::new(HandleKind::ChildProcess, "runner", || async { Ok(()) })
            .with_force_kill(|| loop {
                std::thread::sleep(Duration::from_secs(3600));
            }),
    );

    let start = Instant::now();
    let report = registry.force_cleanup_all(Duration::from_millis(100)).await;

    assert!(start.elapsed() < Duration::from_millis(400), "took {:?}", start.elapsed());
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, CloseStatus::Closed);
    assert!(outcome.force_killed);
    assert!(outcome
        .force_kill_error
        .as_deref()
        .is_some_and(|e| e.contains("did not return")));
    assert!(!report.is_clean());
}
