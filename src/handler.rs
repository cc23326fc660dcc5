//! Job handlers and the registry dispatching to them.
//!
//! A handler is the opaque business logic behind one [`JobKind`]: it receives
//! the job document and a [`ProgressSink`], and either returns a
//! [`Completion`] or fails. Failures are uniformly retryable until the job's
//! attempts are exhausted.
//!
//! The [`HandlerRegistry`] is built once at startup and injected into the
//! worker; there is no process-global registration.

use std::sync::Arc;

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::Serialize;

use crate::{
    job::{new::ChildJob, Job, JobKind},
    ConductorError,
};

/// The error type handlers fail with. Anything goes: the engine records the
/// display message on the job document and classifies it as retryable.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// An executable job handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job, progress: &dyn ProgressSink)
        -> Result<Completion, HandlerError>;
}

/// Durable progress reporting for the currently executing handler.
///
/// Every report is persisted before the call returns (never fire-and-forget)
/// and refreshes the job's `updated_at`, which is also the liveness signal
/// keeping the stuck-job sweep away from healthy executions.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, percent: u8, message: &str) -> Result<(), ConductorError>;
}

/// A successful handler outcome: the result to record on the job, plus any
/// follow-on work to chain.
///
/// The engine creates the children durably before the parent is finalized.
#[derive(Debug, Default)]
pub struct Completion {
    pub(crate) result: serde_json::Value,
    pub(crate) children: Vec<ChildJob>,
}

impl Completion {
    /// A completion with no recorded result and no chained work.
    pub fn done() -> Self {
        Self::default()
    }

    /// Serializes `result` as the job's recorded output.
    pub fn of<T: Serialize>(result: &T) -> Result<Self, HandlerError> {
        Ok(Self {
            result: serde_json::to_value(result)?,
            children: Vec::new(),
        })
    }

    pub fn with_result(self, result: serde_json::Value) -> Self {
        Self { result, ..self }
    }

    /// Chains a follow-on job to be created before this job is finalized.
    pub fn chain(mut self, child: ChildJob) -> Self {
        self.children.push(child);
        self
    }
}

/// Maps each [`JobKind`] to its handler. Constructed once at startup and
/// passed into the worker by reference.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: JobKind, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }
}
