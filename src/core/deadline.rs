/*!
 * Deadlines
 *
 * Wall-clock budgets for every suspension point in the lifecycle subsystems.
 * Nothing here may await unboundedly: hook actions, handle closes and child
 * IPC reads are all raced against a `Deadline`.
 */

use std::time::{Duration, Instant};

/// A hard wall-clock bound measured from a fixed start
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// Deadline `budget` from an explicit start
    pub fn starting_at(start: Instant, budget: Duration) -> Self {
        Self { start, budget }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Instant at which the deadline expires
    pub fn expires_at(&self) -> Instant {
        self.start + self.budget
    }

    /// Expiry as a tokio instant, for `timeout_at` / `sleep_until`
    pub fn tokio_instant(&self) -> tokio::time::Instant {
        tokio::time::Instant::from_std(self.expires_at())
    }

    /// Bound `timeout` by what is left of this deadline
    pub fn clamp(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }

    /// Split the full budget into `waves` equal slices, never below `floor`
    pub fn slice(&self, waves: usize, floor: Duration) -> Duration {
        let waves = u32::try_from(waves.max(1)).unwrap_or(u32::MAX);
        (self.budget / waves).max(floor)
    }

    /// How far past the deadline we are, if at all
    pub fn overrun(&self) -> Option<Duration> {
        self.elapsed().checked_sub(self.budget).filter(|d| !d.is_zero())
    }
}
