/*!
 * Process Module
 * Isolated execution of work in supervised child processes
 */

pub mod executor;
pub mod ipc;
pub mod runner;
pub mod types;
pub mod worker;

// Re-export for convenience
pub use ipc::{ChildMessage, HostMessage};
pub use runner::{IsolatedRun, IsolatedRunner};
pub use types::{IsolatedWork, ProcessSnapshot, ProcessStatus, RunOptions, WorkOutput};
pub use worker::{EntryFn, Worker, WorkerContext};
