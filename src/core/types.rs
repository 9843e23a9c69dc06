/*!
 * Core Types
 * Common types used across the lifecycle subsystems
 */

use futures::future::BoxFuture;
use std::time::Duration;

/// OS process ID type
pub type Pid = u32;

/// Identifier of the subsystem or session that owns a handle
pub type Owner = String;

/// Boxed async cleanup operation returning a user-level error
pub type CleanupFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Milliseconds in a duration, saturating
#[inline]
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
