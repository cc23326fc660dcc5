//! Helpers for testing.

/// A macro for making assertions about tasks scheduled on an
/// [`crate::dispatch::memory::InMemoryDispatcher`].
///
/// Assertions can be made on the job a task references, its earliest
/// delivery time, and the total number of scheduled tasks.
///
/// # Example
///
/// ```
/// # use conductor::testing::assert_dispatched;
/// # use conductor::dispatch::{memory::InMemoryDispatcher, Task, TaskDispatcher};
/// # use chrono::{TimeDelta, Utc};
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let dispatcher = InMemoryDispatcher::new();
/// let task = Task {
///     job_id: uuid::Uuid::new_v4().into(),
///     idempotency_key: uuid::Uuid::new_v4().into(),
/// };
/// let not_before = Utc::now() + TimeDelta::minutes(5);
///
/// dispatcher.enqueue(task.clone(), Some(not_before)).await.unwrap();
///
/// assert_dispatched!(to: dispatcher, job_id: task.job_id);
/// assert_dispatched!(to: dispatcher, job_id: task.job_id, not_before: not_before);
/// assert_dispatched!(1 task, to: dispatcher);
/// # });
/// ```
#[macro_export]
macro_rules! assert_dispatched {
    (to: $dispatcher:expr, job_id: $job_id:expr, not_before: $not_before:expr) => {{
        let scheduled = $dispatcher.scheduled();
        assert!(
            scheduled
                .iter()
                .any(|s| s.task.job_id == $job_id && s.not_before == $not_before),
            "No task scheduled for {} at {}\n\nAll scheduled tasks:\n{scheduled:#?}",
            $job_id,
            $not_before,
        );
    }};
    (to: $dispatcher:expr, job_id: $job_id:expr) => {{
        let scheduled = $dispatcher.scheduled();
        assert!(
            scheduled.iter().any(|s| s.task.job_id == $job_id),
            "No task scheduled for {}\n\nAll scheduled tasks:\n{scheduled:#?}",
            $job_id,
        );
    }};
    (1 task, to: $dispatcher:expr) => {
        assert_dispatched!(@count 1, to: $dispatcher);
    };
    ($n:literal tasks, to: $dispatcher:expr) => {
        assert_dispatched!(@count $n, to: $dispatcher);
    };
    (@count $n:literal, to: $dispatcher:expr) => {{
        let scheduled = $dispatcher.scheduled();
        assert!(
            scheduled.len() == $n,
            "Expected {} scheduled tasks, found {}:\n{scheduled:#?}",
            $n,
            scheduled.len(),
        );
    }};
}

pub use assert_dispatched;
