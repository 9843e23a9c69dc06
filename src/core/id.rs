/*!
 * ID Generation System
 * Type-safe identifiers for tracked handles and isolated runs
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Type-Safe ID Wrappers
// ============================================================================

/// Opaque identifier of a tracked handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

/// Identifier of an isolated run (independent of the OS pid, which may be reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

impl From<u64> for HandleId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<u64> for RunId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

// ============================================================================
// Atomic Counter Generator
// ============================================================================

/// Lock-free monotonic ID generator
///
/// IDs are never recycled: a stale `HandleId` held by an owner must not alias
/// a handle registered later.
#[repr(C, align(64))]
pub struct AtomicGenerator<T> {
    counter: Arc<AtomicU64>,
    _marker: PhantomData<T>,
}

impl<T: From<u64>> AtomicGenerator<T> {
    /// Create new generator starting at given value
    #[inline]
    pub fn new(start: u64) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(start)),
            _marker: PhantomData,
        }
    }

    /// Create new generator starting at 1
    #[inline]
    pub fn default_start() -> Self {
        Self::new(1)
    }

    #[inline]
    pub fn next(&self) -> T {
        T::from(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Value the next call to `next` will hand out
    #[inline]
    pub fn peek(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl<T> Clone for AtomicGenerator<T> {
    fn clone(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
            _marker: PhantomData,
        }
    }
}

impl<T: From<u64>> Default for AtomicGenerator<T> {
    fn default() -> Self {
        Self::default_start()
    }
}

/// Handle ID generator
pub type HandleIdGenerator = AtomicGenerator<HandleId>;

/// Run ID generator
pub type RunIdGenerator = AtomicGenerator<RunId>;

// ============================================================================
// Tests
// ============================================================================
