//! Retry backoff schedules.
//!
//! Failed jobs are re-queued with an increasing delay between attempts. The
//! delay is computed by a [`Strategy`]: a pure, total function from the
//! attempt number to a [`TimeDelta`].
//!
//! The engine ships with [`Stepped`], a table-driven schedule with a hard
//! cap, and uses [`DEFAULT_RETRY_SCHEDULE`] unless configured otherwise.
//!
//! # Example
//!
//! ```
//! # use conductor::backoff::{Strategy, DEFAULT_RETRY_SCHEDULE};
//! # use chrono::TimeDelta;
//! assert_eq!(DEFAULT_RETRY_SCHEDULE.delay_for(1), TimeDelta::seconds(10));
//! assert_eq!(DEFAULT_RETRY_SCHEDULE.delay_for(5), TimeDelta::minutes(30));
//! assert_eq!(DEFAULT_RETRY_SCHEDULE.delay_for(100), TimeDelta::minutes(60));
//! ```

use chrono::TimeDelta;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given a job attempt as a number returns the [`TimeDelta`] to wait
    /// before the job should be retried.
    ///
    /// Implementations must be deterministic and non-decreasing in the
    /// attempt number: retry storms are bounded by the schedule reaching and
    /// holding its cap.
    fn delay_for(&self, attempt: u16) -> TimeDelta;
}

/// A stepwise backoff schedule.
///
/// Attempt `n` maps to the `n`-th entry of the step table; attempts beyond
/// the table return the cap. Attempt `0` is treated as attempt `1` so the
/// function is total.
///
/// __Note:__ the step table must be non-decreasing and the cap must not be
/// smaller than the last step, otherwise the schedule would shrink under
/// growing attempt numbers.
///
/// # Example
///
/// ```
/// # use conductor::backoff::{Stepped, Strategy};
/// # use chrono::TimeDelta;
/// const SCHEDULE: Stepped = Stepped::new(
///     &[TimeDelta::seconds(5), TimeDelta::seconds(15)],
///     TimeDelta::minutes(1),
/// );
///
/// assert_eq!(SCHEDULE.delay_for(1), TimeDelta::seconds(5));
/// assert_eq!(SCHEDULE.delay_for(2), TimeDelta::seconds(15));
/// assert_eq!(SCHEDULE.delay_for(3), TimeDelta::minutes(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stepped {
    steps: &'static [TimeDelta],
    cap: TimeDelta,
}

impl Stepped {
    /// Creates a schedule from an explicit step table and a cap held for all
    /// attempts beyond the table.
    pub const fn new(steps: &'static [TimeDelta], cap: TimeDelta) -> Self {
        Self { steps, cap }
    }
}

impl Strategy for Stepped {
    fn delay_for(&self, attempt: u16) -> TimeDelta {
        let step = (attempt.max(1) - 1) as usize;
        self.steps.get(step).copied().unwrap_or(self.cap)
    }
}

/// The schedule applied to retried jobs unless overridden:
/// 10s, 30s, 2m, 10m, 30m, then 60m for every further attempt.
pub const DEFAULT_RETRY_SCHEDULE: Stepped = Stepped::new(
    &[
        TimeDelta::seconds(10),
        TimeDelta::seconds(30),
        TimeDelta::minutes(2),
        TimeDelta::minutes(10),
        TimeDelta::minutes(30),
    ],
    TimeDelta::minutes(60),
);
