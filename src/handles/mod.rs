/*!
 * Handles Module
 * Registry of live OS resources and bounded forced cleanup
 */

pub mod registry;
pub mod report;
pub mod types;

pub use registry::HandleRegistry;
pub use report::{CleanupReport, CleanupScope, CloseStatus, HandleOutcome};
pub use types::{ForceKillFn, HandleInfo, HandleKind, HandleRegistration};
