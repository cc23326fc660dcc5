//! The execution engine, invoked once per delivered task.
//!
//! Processing is a three-act sequence: claim the job transactionally (the
//! mutual-exclusion point under at-least-once delivery), dispatch to the
//! registered handler, and finalize the outcome. Every finalizing transition
//! re-checks the job's status, so a cancellation or a sweep reset that landed
//! mid-execution is never overwritten.
//!
//! Nothing is thrown across the queue-callback boundary: failures are
//! recorded on the job document and logged.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::instrument;

use crate::{
    backoff::{Strategy, DEFAULT_RETRY_SCHEDULE},
    dispatch::{Task, TaskDispatcher},
    handler::{Completion, HandlerRegistry, ProgressSink},
    job::{Job, JobFailure, JobId, JobStatus, Progress},
    service::JobService,
    store::{ClaimOutcome, FinalizeOutcome, JobStore},
    ConductorError,
};

/// What happened to a delivered task.
#[derive(Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    /// The handler succeeded and the job is `Succeeded`.
    Completed,
    /// The attempt failed; the job is re-queued for `run_after`.
    Retried { run_after: DateTime<Utc> },
    /// The final attempt failed; the job is `DeadLetter`.
    DeadLettered,
    /// The execution finished, but another transition had already moved the
    /// job out of `Running` (cancellation, or a sweep reset); its outcome
    /// was discarded.
    Superseded(JobStatus),
    /// The task was dropped without executing a handler.
    Skipped(SkipReason),
}

#[derive(Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// Duplicate or late delivery for a job that already finished.
    AlreadyFinished(JobStatus),
    /// Another worker holds the claim.
    AlreadyRunning,
    /// Every attempt was consumed without an outcome; the claim transaction
    /// dead-lettered the job.
    AttemptsExhausted,
    /// The task referenced a job that does not exist.
    UnknownJob,
    /// The store could not be reached; under claim contention this is
    /// indistinguishable from losing the race, so the worker stands down.
    StoreUnavailable,
}

/// The per-task execution engine.
pub struct WorkerCore<S, D> {
    service: JobService<S, D>,
    registry: Arc<HandlerRegistry>,
    backoff: Box<dyn Strategy + Send + Sync>,
}

impl<S, D> WorkerCore<S, D>
where
    S: JobStore,
    D: TaskDispatcher,
{
    pub fn new(service: JobService<S, D>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            service,
            registry,
            backoff: Box::new(DEFAULT_RETRY_SCHEDULE),
        }
    }

    pub fn with_backoff(mut self, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        self.backoff = Box::new(backoff);
        self
    }

    /// Processes one delivered task to a final [`ProcessOutcome`].
    #[instrument(skip(self, task), fields(job_id = %task.job_id))]
    pub async fn process(&self, task: Task) -> ProcessOutcome {
        let store = self.service.store();

        let job = match store.claim(task.job_id).await {
            Ok(ClaimOutcome::Claimed(job)) => job,
            Ok(ClaimOutcome::Exhausted) => {
                tracing::error!(
                    job_id = %task.job_id,
                    "Job {} had no attempts left and was dead-lettered at claim",
                    task.job_id
                );
                return ProcessOutcome::Skipped(SkipReason::AttemptsExhausted);
            }
            Ok(ClaimOutcome::NotRunnable(status)) if status.is_terminal() => {
                tracing::debug!(
                    job_id = %task.job_id,
                    %status,
                    "Dropping duplicate delivery for finished job {}",
                    task.job_id
                );
                return ProcessOutcome::Skipped(SkipReason::AlreadyFinished(status));
            }
            Ok(ClaimOutcome::NotRunnable(_)) => {
                tracing::debug!(
                    job_id = %task.job_id,
                    "Job {} is already being executed elsewhere",
                    task.job_id
                );
                return ProcessOutcome::Skipped(SkipReason::AlreadyRunning);
            }
            Ok(ClaimOutcome::NotFound) => {
                tracing::warn!(
                    job_id = %task.job_id,
                    "Delivered task references unknown job {}",
                    task.job_id
                );
                return ProcessOutcome::Skipped(SkipReason::UnknownJob);
            }
            Err(err) => {
                // Transaction failures at claim are not job failures:
                // another worker most likely committed first.
                tracing::debug!(
                    ?err,
                    job_id = %task.job_id,
                    "Claim transaction for {} failed; standing down",
                    task.job_id
                );
                return ProcessOutcome::Skipped(SkipReason::StoreUnavailable);
            }
        };

        // Post-claim re-read: proceed only on the state this worker put the
        // job into.
        let job = match store.fetch(job.id).await {
            Ok(Some(job)) if job.status == JobStatus::Running => job,
            Ok(Some(job)) => return ProcessOutcome::Superseded(job.status),
            Ok(None) => return ProcessOutcome::Skipped(SkipReason::UnknownJob),
            Err(err) => {
                tracing::error!(?err, job_id = %job.id, "Lost the store after claiming {}", job.id);
                return ProcessOutcome::Skipped(SkipReason::StoreUnavailable);
            }
        };

        tracing::debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempts, "Executing job {}", job.id);

        match self.execute(&job).await {
            Ok(completion) => self.succeed(&job, completion).await,
            Err(message) => self.fail(&job, message).await,
        }
    }

    /// Runs the registered handler, converting errors, panics, and a missing
    /// registration into a failure message.
    async fn execute(&self, job: &Job) -> Result<Completion, String> {
        let Some(handler) = self.registry.get(job.kind) else {
            return Err(format!("no handler registered for {}", job.kind));
        };
        let progress = StoreProgress {
            store: self.service.store(),
            job_id: job.id,
        };
        match AssertUnwindSafe(handler.run(job, &progress))
            .catch_unwind()
            .await
        {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(error)) => Err(error.to_string()),
            Err(panic) => Err(panic_message(panic)),
        }
    }

    /// Chain-then-finalize: the children are durably created before the
    /// parent is marked `Succeeded`, so a crash in between never loses them.
    async fn succeed(&self, job: &Job, completion: Completion) -> ProcessOutcome {
        for child in completion.children {
            match self.service.create_child(job, child).await {
                Ok(child_job) => {
                    tracing::debug!(
                        job_id = %job.id,
                        child_id = %child_job.id,
                        "Job {} chained follow-on job {}",
                        job.id,
                        child_job.id
                    );
                }
                Err(err) => {
                    tracing::error!(
                        ?err,
                        job_id = %job.id,
                        "Failed to create job chained from {}; failing the attempt",
                        job.id
                    );
                    return self
                        .fail(job, format!("failed to create chained job: {err}"))
                        .await;
                }
            }
        }

        match self.service.store().complete(job.id, completion.result).await {
            Ok(FinalizeOutcome::Applied) => {
                tracing::debug!(job_id = %job.id, "Job complete {}", job.id);
                ProcessOutcome::Completed
            }
            Ok(FinalizeOutcome::Superseded(status)) => {
                tracing::warn!(
                    job_id = %job.id,
                    %status,
                    "Job {} finished after moving to {status}; result discarded",
                    job.id
                );
                ProcessOutcome::Superseded(status)
            }
            Err(err) => {
                tracing::error!(?err, job_id = %job.id, "Failed to mark job {} as complete", job.id);
                ProcessOutcome::Skipped(SkipReason::StoreUnavailable)
            }
        }
    }

    async fn fail(&self, job: &Job, message: String) -> ProcessOutcome {
        if job.attempts_exhausted() {
            return self.dead_letter(job, message).await;
        }

        let delay = self.backoff.delay_for(job.attempts);
        let run_after = Utc::now() + delay;
        match self
            .service
            .store()
            .retry(job.id, run_after, JobFailure::retryable(message.clone()))
            .await
        {
            Ok(FinalizeOutcome::Applied) => {
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    "Job {} failed and will be retried in {delay}: {message}",
                    job.id
                );
                let _ = self
                    .service
                    .dispatcher()
                    .enqueue(task_for(job), Some(run_after))
                    .await
                    .inspect_err(|err| {
                        // The job stays Queued; the sweep converges on it.
                        tracing::error!(
                            ?err,
                            job_id = %job.id,
                            "Failed to dispatch retry task for job {}",
                            job.id
                        )
                    });
                ProcessOutcome::Retried { run_after }
            }
            Ok(FinalizeOutcome::Superseded(status)) => ProcessOutcome::Superseded(status),
            Err(err) => {
                tracing::error!(?err, job_id = %job.id, "Failed to mark job {} as retryable", job.id);
                ProcessOutcome::Skipped(SkipReason::StoreUnavailable)
            }
        }
    }

    async fn dead_letter(&self, job: &Job, message: String) -> ProcessOutcome {
        tracing::error!(
            job_id = %job.id,
            attempts = job.attempts,
            "Job {} failed its final attempt and will be dead-lettered: {message}",
            job.id
        );
        let failure = JobFailure::max_attempts_exceeded(
            message,
            Some(serde_json::json!({
                "attempts": job.attempts,
                "maxAttempts": job.max_attempts,
            })),
        );
        match self.service.store().dead_letter(job.id, failure).await {
            Ok(FinalizeOutcome::Applied) => ProcessOutcome::DeadLettered,
            Ok(FinalizeOutcome::Superseded(status)) => ProcessOutcome::Superseded(status),
            Err(err) => {
                tracing::error!(?err, job_id = %job.id, "Failed to dead-letter job {}", job.id);
                ProcessOutcome::Skipped(SkipReason::StoreUnavailable)
            }
        }
    }
}

/// Persists handler progress through the store; reports against a job that
/// is no longer running are ignored rather than failed.
struct StoreProgress<'a, S> {
    store: &'a S,
    job_id: JobId,
}

#[async_trait]
impl<'a, S> ProgressSink for StoreProgress<'a, S>
where
    S: JobStore,
{
    async fn report(&self, percent: u8, message: &str) -> Result<(), ConductorError> {
        let applied = self
            .store
            .record_progress(self.job_id, Progress::new(percent, message))
            .await?;
        if !applied {
            tracing::debug!(
                job_id = %self.job_id,
                "Ignoring progress for job {} which is no longer running",
                self.job_id
            );
        }
        Ok(())
    }
}

fn task_for(job: &Job) -> Task {
    Task {
        job_id: job.id,
        idempotency_key: job.idempotency_key,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_owned())
}
