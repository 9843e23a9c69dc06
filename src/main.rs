/*!
 * AI-OS Lifecycle - Main Entry Point
 *
 * Usage:
 *   lifecycle worker                  serve one isolated work request (child side)
 *   lifecycle [ENTRY] [PAYLOAD_JSON]  run ENTRY in an isolated child and print its output
 *
 * The host runs the work with every lifecycle component wired up: children
 * are tracked as handles, a termination signal triggers the coordinated
 * shutdown, and the exit summary is printed only when something went wrong.
 */

use std::error::Error;
use tracing::{info, warn};

use ai_os_lifecycle::{
    init_tracing, install_shutdown_handler, HandleRegistry, HookPriority, IsolatedRunner,
    IsolatedWork, LifecycleConfig, ShutdownCoordinator, ShutdownHook, ShutdownReason, Worker,
};

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("worker") {
        std::process::exit(Worker::with_builtins().run());
    }
    host(args)
}

#[tokio::main]
async fn host(args: Vec<String>) -> Result<(), Box<dyn Error>> {
    let config = LifecycleConfig::from_env()?;
    let entry = args.first().cloned().unwrap_or_else(|| "echo".to_string());
    let payload = match args.get(1) {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::json!({"value": 42}),
    };

    info!("AI-OS lifecycle host starting...");

    let registry = HandleRegistry::from_config(&config);
    let coordinator = ShutdownCoordinator::new(config.clone());
    coordinator.set_handle_registry(registry.clone());

    let runner = IsolatedRunner::new(registry.clone(), &config);
    runner.register_shutdown_hook(&coordinator)?;
    coordinator.register_hook(ShutdownHook::new(
        "report-runs",
        HookPriority::Cleanup,
        {
            let runner = runner.clone();
            move || {
                let runner = runner.clone();
                async move {
                    for snapshot in runner.history() {
                        info!(
                            run_id = %snapshot.run_id,
                            status = %snapshot.status,
                            elapsed_ms = snapshot.elapsed_ms,
                            "run finished"
                        );
                    }
                    Ok(())
                }
            }
        },
    ))?;

    let signals = install_shutdown_handler(coordinator.clone(), config.global_shutdown_deadline);

    let work = IsolatedWork::new(std::env::current_exe()?, entry)
        .with_args(["worker"])
        .with_payload(payload);
    let result = runner.run_isolated(work, runner.default_options()).await;

    let succeeded = match &result {
        Ok(output) => {
            println!("{}", serde_json::to_string(&output.value)?);
            true
        }
        Err(e) => {
            warn!(error = %e, "isolated run failed");
            eprintln!("{:?}", miette::Report::new(e.clone()));
            false
        }
    };

    // Attaches to a signal-triggered sequence if one already ran
    let report = coordinator.shutdown_now(ShutdownReason::NormalExit).await;
    signals.abort();

    let summary = report.summary();
    if !summary.is_empty() {
        eprintln!("{}", summary);
    }
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
