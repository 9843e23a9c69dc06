/*!
 * Shutdown Module
 * Coordinated, deadline-bounded process shutdown
 */

pub mod coordinator;
pub mod hook;
pub mod plan;
pub mod report;
mod watchdog;

pub use coordinator::ShutdownCoordinator;
pub use hook::{HookAction, HookPriority, ShutdownHook};
pub use plan::{PlannedHook, ShutdownPlan, Stage};
pub use report::{
    CoordinatorState, HookOutcome, HookStatus, ShutdownReason, ShutdownReport, ShutdownSummary,
};
pub use watchdog::force_exit;
