//! Abstraction over the distributed task queue.
//!
//! The queue delivers each enqueued [`Task`] at least once, possibly
//! arbitrarily later than its `not_before` time. It is append-only and
//! requires no coordination; the claim transaction in the worker is the sole
//! correctness boundary against duplicate deliveries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{IdempotencyKey, JobId};

pub mod memory;

/// The payload delivered to a worker: which job to execute, and the key of
/// the logical execution that enqueued it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub job_id: JobId,
    pub idempotency_key: IdempotencyKey,
}

/// Receipt returned by the queue for an accepted task.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DispatchHandle(String);

impl DispatchHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task queue rejected the task: {0}")]
    Rejected(String),
    #[error("task queue unavailable")]
    Unavailable,
}

/// The task queue contract.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Enqueues a task for delivery no earlier than `not_before`
    /// (immediately when `None`).
    ///
    /// Delivery is at least once: the same task may reach a worker several
    /// times, and may arrive long after `not_before`.
    async fn enqueue(
        &self,
        task: Task,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<DispatchHandle, DispatchError>;
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A dispatcher recording every enqueue, with scripted failures.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedDispatcher {
        enqueued: Arc<Mutex<Vec<(Task, Option<DateTime<Utc>>)>>>,
        failures: Arc<Mutex<Vec<DispatchError>>>,
    }

    impl ScriptedDispatcher {
        pub(crate) fn fail_next(&self, error: DispatchError) {
            self.failures.lock().unwrap().push(error);
        }

        pub(crate) fn enqueued(&self) -> Vec<(Task, Option<DateTime<Utc>>)> {
            self.enqueued.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskDispatcher for ScriptedDispatcher {
        async fn enqueue(
            &self,
            task: Task,
            not_before: Option<DateTime<Utc>>,
        ) -> Result<DispatchHandle, DispatchError> {
            if let Some(error) = self.failures.lock().unwrap().pop() {
                return Err(error);
            }
            let mut enqueued = self.enqueued.lock().unwrap();
            enqueued.push((task, not_before));
            Ok(DispatchHandle::new(format!("task-{}", enqueued.len())))
        }
    }
}
