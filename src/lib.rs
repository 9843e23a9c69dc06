/*!
 * AI-OS Lifecycle Library
 * Handle tracking, isolated process execution and coordinated shutdown
 */

pub mod core;
pub mod handles;
pub mod monitoring;
pub mod process;
pub mod shutdown;
pub mod signals;

// Re-exports
pub use crate::core::{
    Deadline, ForcedExit, HandleError, HandleId, HookError, LifecycleConfig, LifecycleError,
    RegistrationError, Result, RunError, RunId, ShutdownError, TimeoutPhase,
};
pub use handles::{
    CleanupReport, CleanupScope, CloseStatus, HandleInfo, HandleKind, HandleOutcome,
    HandleRegistration, HandleRegistry,
};
pub use monitoring::init_tracing;
pub use process::{
    IsolatedRun, IsolatedRunner, IsolatedWork, ProcessSnapshot, ProcessStatus, RunOptions,
    Worker, WorkOutput,
};
pub use shutdown::{
    CoordinatorState, HookOutcome, HookPriority, HookStatus, ShutdownCoordinator, ShutdownHook,
    ShutdownReason, ShutdownReport, ShutdownSummary,
};
pub use signals::{install_shutdown_handler, wait_for_shutdown_signal};
