/*!
 * Monitoring
 * Tracing setup shared by the host and worker processes
 */

mod tracer;

pub use tracer::{init_tracing, TRACE_JSON_ENV};
