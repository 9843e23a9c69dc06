/*!
 * Isolated Runner Tests
 * Real child processes running the built-in worker entries
 */

use ai_os_lifecycle::process::executor::is_alive;
use ai_os_lifecycle::{
    HandleRegistry, IsolatedRunner, IsolatedWork, LifecycleConfig, ProcessStatus, RunError,
    RunOptions, TimeoutPhase,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use serial_test::serial;
use std::time::{Duration, Instant};

fn work(entry: &str, payload: Value) -> IsolatedWork {
    IsolatedWork::new(env!("CARGO_BIN_EXE_lifecycle"), entry)
        .with_args(["worker"])
        .with_payload(payload)
}

fn runner() -> (HandleRegistry, IsolatedRunner) {
    let config = LifecycleConfig::new();
    let registry = HandleRegistry::from_config(&config);
    let runner = IsolatedRunner::new(registry.clone(), &config);
    (registry, runner)
}

fn options() -> RunOptions {
    RunOptions::default()
        .with_process_timeout(Duration::from_secs(10))
        .with_termination_timeout(Duration::from_millis(500))
}

#[tokio::test]
#[serial]
async fn test_work_completes() {
    let (registry, runner) = runner();
    let output = runner
        .run_isolated(
            work("sleep", json!({"ms": 50, "result": {"value": 42}})),
            options(),
        )
        .await
        .unwrap();

    assert_eq!(output.value, json!({"value": 42}));
    assert!(output.elapsed() >= Duration::from_millis(50));
    assert!(registry.is_empty());
    assert_eq!(runner.active_count(), 0);

    let history = runner.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ProcessStatus::Completed);
    assert_eq!(history[0].exit_code, Some(0));
}

#[tokio::test]
#[serial]
async fn test_runaway_child_times_out() {
    let (_registry, runner) = runner();
    let options = RunOptions::default()
        .with_process_timeout(Duration::from_millis(200))
        .with_termination_timeout(Duration::from_millis(100));

    let start = Instant::now();
    let run = runner.spawn_isolated(work("spin", Value::Null), options).unwrap();
    let pid = run.pid();
    let err = run.wait().await.unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err.timeout_phase(), Some(TimeoutPhase::Running));
    assert!(elapsed >= Duration::from_millis(200), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
    assert!(!is_alive(pid));
    assert_eq!(runner.history()[0].status, ProcessStatus::TimedOut);
}

#[tokio::test]
#[serial]
async fn test_sigterm_ignoring_child_is_killed() {
    let (_registry, runner) = runner();
    let options = RunOptions::default()
        .with_process_timeout(Duration::from_millis(200))
        .with_termination_timeout(Duration::from_millis(100));

    let run = runner
        .spawn_isolated(work("ignore-term", Value::Null), options)
        .unwrap();
    let pid = run.pid();
    let err = run.wait().await.unwrap_err();

    assert_eq!(err.timeout_phase(), Some(TimeoutPhase::Termination));
    assert!(!is_alive(pid));
    assert_eq!(runner.history()[0].status, ProcessStatus::Killed);
}

#[tokio::test]
#[serial]
async fn test_silent_child_is_unresponsive() {
    let (_registry, runner) = runner();
    let options = options().with_heartbeat(Duration::from_millis(50), 3);

    let err = runner
        .run_isolated(work("stall", Value::Null), options)
        .await
        .unwrap_err();

    assert_eq!(err.timeout_phase(), Some(TimeoutPhase::Unresponsive));
}

#[tokio::test]
#[serial]
async fn test_crash_is_reported() {
    let (_registry, runner) = runner();
    let err = runner
        .run_isolated(work("crash", json!({"code": 3})), options())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            RunError::ChildCrashed {
                exit_code: Some(3),
                ..
            }
        ),
        "unexpected error: {:?}",
        err
    );
    assert_eq!(runner.history()[0].status, ProcessStatus::Failed);
}

#[tokio::test]
#[serial]
async fn test_work_failure_is_reported() {
    let (_registry, runner) = runner();
    let err = runner
        .run_isolated(work("fail", json!({"message": "bad input"})), options())
        .await
        .unwrap_err();

    assert!(
        matches!(&err, RunError::WorkFailed { message, .. } if message == "bad input"),
        "unexpected error: {:?}",
        err
    );
}

#[tokio::test]
#[serial]
async fn test_missing_program_fails_to_spawn() {
    let (registry, runner) = runner();
    let err = runner
        .run_isolated(
            IsolatedWork::new("/nonexistent/lifecycle-worker", "echo"),
            options(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Spawn { .. }));
    assert!(registry.is_empty());
}

#[tokio::test]
#[serial]
async fn test_registry_sweep_kills_running_child() {
    let (registry, runner) = runner();
    let run = runner
        .spawn_isolated(work("sleep", json!({"ms": 10_000})), options())
        .unwrap();
    let pid = run.pid();
    assert_eq!(registry.len(), 1);

    let report = registry.force_cleanup_all(Duration::from_secs(3)).await;
    assert_eq!(report.attempted(), 1);
    assert_eq!(report.abandoned_count(), 0);

    let err = run.wait().await.unwrap_err();
    assert!(matches!(err, RunError::Killed { .. }), "unexpected error: {:?}", err);
    assert!(!is_alive(pid));
    assert!(registry.is_empty());
}

#[tokio::test]
#[serial]
async fn test_status_tracks_active_run() {
    let (_registry, runner) = runner();
    let run = runner
        .spawn_isolated(work("sleep", json!({"ms": 300})), options())
        .unwrap();
    let run_id = run.id();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let snapshot = runner.status(run_id).unwrap();
    assert_eq!(snapshot.status, ProcessStatus::Running);
    assert_eq!(snapshot.entry, "sleep");

    run.wait().await.unwrap();
    assert!(runner.status(run_id).map_or(true, |s| s.status.is_finished()));
}

/// A program that never speaks the worker protocol
fn silent_program() -> IsolatedWork {
    IsolatedWork::new("/bin/sleep", "none").with_args(["30"])
}

#[tokio::test]
#[serial]
async fn test_missing_handshake_times_out() {
    let (registry, runner) = runner();
    let options = options().with_handshake_timeout(Duration::from_millis(200));

    let start = Instant::now();
    let run = runner.spawn_isolated(silent_program(), options).unwrap();
    let pid = run.pid();
    let err = run.wait().await.unwrap_err();

    assert_eq!(err.timeout_phase(), Some(TimeoutPhase::Handshake));
    assert!(start.elapsed() < Duration::from_millis(1500), "took {:?}", start.elapsed());
    assert!(!is_alive(pid));
    assert!(registry.is_empty());
}

#[tokio::test]
#[serial]
async fn test_process_timeout_bounds_handshake() {
    let (_registry, runner) = runner();
    let options = RunOptions::default()
        .with_process_timeout(Duration::from_millis(200))
        .with_termination_timeout(Duration::from_millis(100))
        .with_handshake_timeout(Duration::from_secs(3));

    let start = Instant::now();
    let run = runner.spawn_isolated(silent_program(), options).unwrap();
    let pid = run.pid();
    let err = run.wait().await.unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err.timeout_phase(), Some(TimeoutPhase::Running));
    assert!(elapsed >= Duration::from_millis(200), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
    assert!(!is_alive(pid));
}
