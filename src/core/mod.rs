/*!
 * Core Module
 * Fundamental types, configuration, deadlines and error handling
 */

pub mod config;
pub mod deadline;
pub mod errors;
pub mod id;
pub mod limits;
pub mod types;

// Re-export for convenience
pub use config::{ForcedExit, LifecycleConfig};
pub use deadline::Deadline;
pub use errors::*;
pub use id::{AtomicGenerator, HandleId, HandleIdGenerator, RunId, RunIdGenerator};
pub use types::*;
