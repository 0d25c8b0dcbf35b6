//! Reconciliation loop primitives.
//!
//! Helpers shared by the scheduler's decision functions. Everything here is
//! pure: no clocks are read and no I/O is performed, so callers pass the
//! current time or elapsed durations in.
//!
//! - [`BackoffPolicy`]: restart delay for a slot after unplanned terminations
//! - [`AttemptStrategy`]: bounded retry budget for collaborator RPCs
//! - [`select_for_stop`]: deterministic choice of which slots to stop
//! - [`Checkpoint`]: last-delivered cursor for ordered event delivery
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Checkpoints only move forward

use std::cmp::Reverse;
use std::time::Duration;

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A policy was configured with values it cannot work with.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// A cursor was asked to move backwards.
    #[error("checkpoint regression: at {current}, got {requested}")]
    Regression { current: u64, requested: u64 },
}

/// Convergence status for a group of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Live count matches desired count.
    Converged,

    /// Live count is moving toward desired count.
    Converging,
}

impl ConvergenceStatus {
    /// Compare a live count with a desired count.
    pub fn of(live: usize, desired: usize) -> Self {
        if live == desired {
            Self::Converged
        } else {
            Self::Converging
        }
    }

    /// Returns true if the group has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Converging => "converging",
        }
    }
}

// =============================================================================
// Restart Backoff
// =============================================================================

/// Exponential restart backoff for a slot.
///
/// The first unplanned termination of a slot is replaced immediately; each
/// consecutive one waits `base * 2^(n-1)`, capped at `max`. A slot whose
/// instantiation stayed up for at least `base` starts over at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_PERIOD,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy. `base` must be non-zero and `max` at least `base`.
    pub fn new(base: Duration, max: Duration) -> Result<Self, ReconcileError> {
        if base.is_zero() {
            return Err(ReconcileError::InvalidPolicy(
                "backoff period must be non-zero".to_string(),
            ));
        }
        if max < base {
            return Err(ReconcileError::InvalidPolicy(format!(
                "backoff max {max:?} is below backoff period {base:?}"
            )));
        }
        Ok(Self { base, max })
    }

    /// The backoff base period.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before replacing a slot that has already been restarted
    /// `restart_count` times in a row.
    pub fn delay(&self, restart_count: u32) -> Duration {
        if restart_count == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(restart_count - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Whether an instantiation that has been up for `up_for` resets the
    /// slot's restart count.
    pub fn survived(&self, up_for: Duration) -> bool {
        up_for >= self.base
    }
}

// =============================================================================
// Attempt Strategy
// =============================================================================

/// Bounded retry budget: at least `min_attempts` tries, and further tries
/// while the next one would still start within `total`, with a fixed
/// `delay` between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStrategy {
    pub min_attempts: u32,
    pub total: Duration,
    pub delay: Duration,
}

impl Default for AttemptStrategy {
    fn default() -> Self {
        Self {
            min_attempts: 3,
            total: Duration::from_secs(30),
            delay: Duration::from_millis(500),
        }
    }
}

impl AttemptStrategy {
    /// Given `attempts` tries made so far over `elapsed`, how long to wait
    /// before the next try, or `None` when the budget is spent.
    pub fn next_delay(&self, attempts: u32, elapsed: Duration) -> Option<Duration> {
        if attempts < self.min_attempts || elapsed + self.delay < self.total {
            Some(self.delay)
        } else {
            None
        }
    }
}

// =============================================================================
// Stop Selection
// =============================================================================

/// Stop selection priority for live slots.
///
/// Lower priority values are stopped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopPriority {
    /// Waiting for a host or a backoff timer; nothing is running yet.
    Unplaced = 0,

    /// Start dispatched, not yet up.
    Starting = 1,

    /// Running.
    Up = 2,
}

/// Pick `count` items to stop.
///
/// Items are ordered by [`StopPriority`] and, within one priority, by
/// descending instance index, so the highest-numbered slots go first. The
/// sort is stable, so equal keys keep their input order.
pub fn select_for_stop<T, F>(items: Vec<T>, count: usize, key: F) -> Vec<T>
where
    F: Fn(&T) -> (StopPriority, u32),
{
    let mut keyed: Vec<_> = items
        .into_iter()
        .map(|i| {
            let (priority, index) = key(&i);
            ((priority, Reverse(index)), i)
        })
        .collect();

    keyed.sort_by_key(|(k, _)| *k);
    keyed.into_iter().take(count).map(|(_, i)| i).collect()
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Cursor over a strictly ordered event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last delivered sequence number.
    pub last_sequence_id: u64,

    /// Timestamp of last checkpoint update.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Create a new checkpoint.
    pub fn new(last_sequence_id: u64) -> Self {
        Self {
            last_sequence_id,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Check if an event has already been delivered.
    pub fn is_processed(&self, sequence_id: u64) -> bool {
        sequence_id <= self.last_sequence_id
    }

    /// Advance to `sequence_id`, which must be strictly greater than the
    /// current position.
    pub fn advance(&mut self, sequence_id: u64) -> Result<(), ReconcileError> {
        if self.is_processed(sequence_id) {
            return Err(ReconcileError::Regression {
                current: self.last_sequence_id,
                requested: sequence_id,
            });
        }
        self.last_sequence_id = sequence_id;
        self.updated_at = chrono::Utc::now();
        Ok(())
    }
}

/// Default restart backoff base period.
pub const DEFAULT_BACKOFF_PERIOD: Duration = Duration::from_secs(10);

/// Default cap on a single restart delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10 * 60); // 10 minutes
