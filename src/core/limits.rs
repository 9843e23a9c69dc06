/*!
 * System Limits and Constants
 *
 * Centralized location for lifecycle timeouts, budgets and thresholds.
 * Organized by subsystem; every default in `LifecycleConfig` comes from here.
 */

use std::time::Duration;

// =============================================================================
// HANDLE REGISTRY
// =============================================================================

/// Concurrent close operations during a forced sweep
/// Bounded to avoid a thundering herd of syscalls with hundreds of handles
pub const DEFAULT_HANDLE_CLEANUP_CONCURRENCY: usize = 8;

/// Upper bound accepted for the close worker budget
pub const MAX_HANDLE_CLEANUP_CONCURRENCY: usize = 64;

/// Hard ceiling for a single forced handle sweep (5s)
pub const DEFAULT_HANDLE_CLEANUP_MAX: Duration = Duration::from_secs(5);

/// Smallest slice of the sweep deadline given to one close operation
pub const MIN_CLOSE_SLICE: Duration = Duration::from_millis(10);

/// Time a forceful escalation gets after its close settled, even past the
/// sweep deadline
pub const ESCALATION_FLOOR: Duration = Duration::from_millis(50);

/// Handles older than this show up in staleness diagnostics (60s)
pub const DEFAULT_STALE_HANDLE_AGE: Duration = Duration::from_secs(60);

// =============================================================================
// ISOLATED PROCESS RUNNER
// =============================================================================

/// Total wall-clock budget for one isolated run (5 min)
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period between SIGTERM and SIGKILL (5s)
pub const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a freshly spawned child has to send its Ready message (10s)
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval at which children emit heartbeats (1s)
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive missed heartbeats before a child is considered unresponsive
pub const DEFAULT_HEARTBEAT_MISS_LIMIT: u32 = 3;

/// How long to wait for the OS to reap a child after SIGKILL
/// Anything longer means the kernel is not honoring the kill
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Time allowed to drain buffered IPC messages after the child exits
pub const IPC_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Capacity of the child -> host message channel
pub const IPC_CHANNEL_CAPACITY: usize = 64;

/// Finished runs kept for status queries
pub const RUN_HISTORY_CAPACITY: usize = 256;

/// Owner tag used for child-process handles registered by the runner
pub const RUNNER_HANDLE_OWNER: &str = "isolated-runner";

// =============================================================================
// SHUTDOWN COORDINATOR
// =============================================================================

/// Hard ceiling for the whole shutdown sequence (5s)
pub const DEFAULT_GLOBAL_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Minimum budget always given to the final handle sweep (500ms)
pub const DEFAULT_FINALIZE_FLOOR: Duration = Duration::from_millis(500);

/// Overrun tolerated past the global deadline before forced exit (250ms)
/// Absorbs timer granularity so a sweep that ends on the deadline is not fatal
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(250);

/// Per-hook timeout when a hook does not set one (2s)
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit code used when forced exit is configured as a plain exit
pub const FORCED_EXIT_CODE: i32 = 137;
