/*!
 * Worker Protocol (child side)
 *
 * Runs inside the isolated child: acknowledges the handshake, emits
 * heartbeats from a dedicated thread, executes one entry and reports its
 * result. Entries are plain functions so a heartbeat keeps flowing even while
 * the entry is CPU-bound; a genuinely wedged child is caught by the host's
 * process timeout instead.
 *
 * Built-in entries:
 *
 * | entry         | payload               | behaviour                         |
 * |---------------|-----------------------|-----------------------------------|
 * | `echo`        | any                   | returns the payload               |
 * | `sleep`       | `{ms, result}`        | sleeps, then returns `result`     |
 * | `spin`        | -                     | busy loops forever                |
 * | `ignore-term` | -                     | ignores SIGTERM, sleeps forever   |
 * | `stall`       | -                     | stops heartbeats, sleeps forever  |
 * | `crash`       | `{code}`              | exits without reporting           |
 * | `fail`        | `{message}`           | reports a failure                 |
 */

use super::ipc::{encode, ChildMessage, HostMessage, HEARTBEAT_ENV};
use crate::core::limits::DEFAULT_HEARTBEAT_INTERVAL;
use nix::sys::signal::{self, SigHandler, Signal};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

/// Entry point executed by the worker
pub type EntryFn = fn(&Value, &WorkerContext) -> Result<Value, String>;

/// Handed to entries so they can influence the protocol
pub struct WorkerContext {
    heartbeats_paused: Arc<AtomicBool>,
}

impl WorkerContext {
    /// Stop emitting heartbeats, simulating a wedged child
    pub fn pause_heartbeats(&self) {
        self.heartbeats_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_heartbeats(&self) {
        self.heartbeats_paused.store(false, Ordering::SeqCst);
    }
}

/// Table of named entries served by a worker process
pub struct Worker {
    entries: HashMap<String, EntryFn>,
    heartbeat_interval: Duration,
}

impl Worker {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            heartbeat_interval: heartbeat_from_env(),
        }
    }

    /// Worker serving the built-in entries
    pub fn with_builtins() -> Self {
        Self::new()
            .entry("echo", echo)
            .entry("sleep", sleep)
            .entry("spin", spin)
            .entry("ignore-term", ignore_term)
            .entry("stall", stall)
            .entry("crash", crash)
            .entry("fail", fail)
    }

    pub fn entry(mut self, name: &str, entry: EntryFn) -> Self {
        self.entries.insert(name.to_string(), entry);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Serve one request on stdin/stdout; returns the process exit code
    pub fn run(&self) -> i32 {
        match self.serve() {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "worker protocol failure");
                1
            }
        }
    }

    fn serve(&self) -> io::Result<()> {
        send(&ChildMessage::Ready {
            pid: std::process::id(),
        })?;

        let paused = Arc::new(AtomicBool::new(false));
        spawn_heartbeat(self.heartbeat_interval, paused.clone());

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            debug!("host closed stdin before sending work");
            return Ok(());
        }
        let HostMessage::Start { entry, payload } = serde_json::from_str(line.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let context = WorkerContext {
            heartbeats_paused: paused,
        };
        let result = match self.entries.get(&entry) {
            Some(run) => run(&payload, &context),
            None => Err(format!("unknown entry '{}'", entry)),
        };

        match result {
            Ok(output) => send(&ChildMessage::Completed { output }),
            Err(error) => send(&ChildMessage::Failed { error }),
        }
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Write one message as an atomic line on stdout
fn send(message: &ChildMessage) -> io::Result<()> {
    let line = encode(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(line.as_bytes())?;
    stdout.flush()
}

fn spawn_heartbeat(interval: Duration, paused: Arc<AtomicBool>) {
    let seq = AtomicU64::new(0);
    let spawned = thread::Builder::new()
        .name("heartbeat".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            if paused.load(Ordering::SeqCst) {
                continue;
            }
            let seq = seq.fetch_add(1, Ordering::Relaxed) + 1;
            // Host hung up; nobody is listening any more
            if send(&ChildMessage::Heartbeat { seq }).is_err() {
                break;
            }
        });
    if let Err(e) = spawned {
        error!(error = %e, "failed to start heartbeat thread");
    }
}

fn heartbeat_from_env() -> Duration {
    std::env::var(HEARTBEAT_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL)
}

fn sleep_forever() -> ! {
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

// ============================================================================
// Built-in entries
// ============================================================================

fn echo(payload: &Value, _: &WorkerContext) -> Result<Value, String> {
    Ok(payload.clone())
}

fn sleep(payload: &Value, _: &WorkerContext) -> Result<Value, String> {
    let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
    thread::sleep(Duration::from_millis(ms));
    Ok(payload.get("result").cloned().unwrap_or(Value::Null))
}

fn spin(_: &Value, _: &WorkerContext) -> Result<Value, String> {
    let mut counter = 0u64;
    loop {
        counter = std::hint::black_box(counter.wrapping_add(1));
    }
}

fn ignore_term(_: &Value, _: &WorkerContext) -> Result<Value, String> {
    // SAFETY: SigIgn installs no handler code; nothing else in the worker
    // manages SIGTERM.
    unsafe { signal::signal(Signal::SIGTERM, SigHandler::SigIgn) }.map_err(|e| e.to_string())?;
    sleep_forever()
}

fn stall(_: &Value, context: &WorkerContext) -> Result<Value, String> {
    context.pause_heartbeats();
    sleep_forever()
}

fn crash(payload: &Value, _: &WorkerContext) -> Result<Value, String> {
    let code = payload
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .unwrap_or(3);
    std::process::exit(code)
}

fn fail(payload: &Value, _: &WorkerContext) -> Result<Value, String> {
    Err(payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("work failed")
        .to_string())
}
