//! The public job API: create, read, list, cancel, and the stuck-job sweep.
//!
//! The service owns the ordering guarantee at creation: a job is persisted
//! before its task is dispatched, so the queue never references a job that
//! does not exist. The reverse failure (persisted but not dispatched) is
//! surfaced to the caller and recovered by [`JobService::requeue_stuck`].

use chrono::Utc;
use futures::{stream::FuturesOrdered, StreamExt};

use crate::{
    dispatch::{Task, TaskDispatcher},
    job::{
        new::{ChildJob, NewJob},
        IdempotencyKey, Job, JobId, JobStatus, TenantId,
    },
    store::{CancelOutcome, JobFilter, JobStore},
    Config, ConductorError,
};

/// Upper bound on documents touched per sweep invocation; the sweep runs on
/// a periodic trigger, so a backlog larger than this drains across runs.
const SWEEP_BATCH_LIMIT: usize = 100;

/// Public API for creating and managing jobs.
#[derive(Clone)]
pub struct JobService<S, D> {
    store: S,
    dispatcher: D,
    config: Config,
}

impl<S, D> JobService<S, D>
where
    S: JobStore,
    D: TaskDispatcher,
{
    pub fn new(store: S, dispatcher: D, config: Config) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Persists a `Queued` job and dispatches its task.
    ///
    /// Persistence happens before dispatch. A dispatch failure is returned
    /// to the caller; the persisted job stays `Queued` until the sweep
    /// re-dispatches it.
    pub async fn create_job(&self, new_job: NewJob) -> Result<Job, ConductorError> {
        validate(&new_job)?;

        let now = Utc::now();
        let run_after = new_job.run_after.unwrap_or(now);
        let job = Job {
            id: JobId::generate(),
            tenant_id: new_job.tenant_id,
            inspection_id: new_job.inspection_id,
            kind: new_job.kind,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: new_job
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            run_after,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            input: new_job.input,
            progress: None,
            result: None,
            error: None,
            idempotency_key: IdempotencyKey::generate(),
            created_by: new_job.created_by,
        };

        self.store.insert(job.clone()).await?;
        self.dispatcher
            .enqueue(task_for(&job), (run_after > now).then_some(run_after))
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    job_id = %job.id,
                    "Persisted job {} but failed to dispatch its task",
                    job.id
                )
            })?;

        tracing::debug!(job_id = %job.id, kind = %job.kind, "Created job {}", job.id);
        Ok(job)
    }

    /// Creates follow-on work chained from `parent`, inheriting its tenant,
    /// inspection, and provenance.
    pub(crate) async fn create_child(
        &self,
        parent: &Job,
        child: ChildJob,
    ) -> Result<Job, ConductorError> {
        self.create_job(NewJob {
            tenant_id: parent.tenant_id.clone(),
            inspection_id: parent.inspection_id.clone(),
            kind: child.kind,
            input: child.input,
            max_attempts: child.max_attempts,
            created_by: parent.created_by.clone(),
            run_after: None,
        })
        .await
    }

    /// Returns the job, or `None` both when it does not exist and when it
    /// belongs to a different tenant.
    pub async fn get_job(
        &self,
        id: JobId,
        tenant_id: &TenantId,
    ) -> Result<Option<Job>, ConductorError> {
        Ok(self.store.fetch_for_tenant(id, tenant_id).await?)
    }

    /// Lists jobs for one inspection, newest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, ConductorError> {
        Ok(self.store.list(filter).await?)
    }

    /// Cancels a job that has not finished. Cancelling an already finished
    /// job is a silent no-op; the document is returned unchanged.
    pub async fn cancel_job(&self, id: JobId, tenant_id: &TenantId) -> Result<Job, ConductorError> {
        match self.store.fetch(id).await? {
            None => Err(ConductorError::NotFound(id)),
            Some(job) if &job.tenant_id != tenant_id => Err(ConductorError::Unauthorized(id)),
            Some(_) => match self.store.cancel(id).await? {
                CancelOutcome::Cancelled(job) => {
                    tracing::debug!(job_id = %id, "Cancelled job {id}");
                    Ok(job)
                }
                CancelOutcome::AlreadyFinished(job) => Ok(job),
                CancelOutcome::NotFound => Err(ConductorError::NotFound(id)),
            },
        }
    }

    /// Recovers work abandoned by crashed workers: every `Running` job whose
    /// `updated_at` is older than the configured [`Config::stuck_after`] is
    /// reset to `Queued` and its task re-dispatched. Returns how many jobs
    /// were reset.
    ///
    /// `Queued` jobs whose `run_after` passed more than the timeout ago are
    /// also re-dispatched (without a state change): their task was lost, or
    /// was never enqueued because dispatch failed at creation or retry.
    ///
    /// Intended to be invoked on a periodic external trigger. Safe to run
    /// concurrently with live workers; a job reset while still legitimately
    /// executing is a bounded, accepted risk, so the timeout should sit well
    /// above the slowest expected handler.
    pub async fn requeue_stuck(&self) -> Result<usize, ConductorError> {
        let cutoff = Utc::now() - self.config.stuck_after;

        let mut reset = Vec::new();
        for job in self
            .store
            .stale(JobStatus::Running, cutoff, SWEEP_BATCH_LIMIT)
            .await?
        {
            if self.store.requeue_stuck(job.id, cutoff).await? {
                tracing::warn!(
                    job_id = %job.id,
                    "Re-queued job {} abandoned by a crashed worker",
                    job.id
                );
                reset.push(job);
            }
        }

        let undelivered = self
            .store
            .stale(JobStatus::Queued, cutoff, SWEEP_BATCH_LIMIT)
            .await?;
        for job in &undelivered {
            tracing::warn!(
                job_id = %job.id,
                "Re-dispatching queued job {} with no delivered task",
                job.id
            );
        }

        let count = reset.len();
        reset
            .iter()
            .chain(undelivered.iter())
            .map(|job| self.dispatcher.enqueue(task_for(job), None))
            .collect::<FuturesOrdered<_>>()
            .filter_map(|res| async { res.err() })
            .for_each(|err| async move {
                tracing::error!(?err, "Failed to re-dispatch a task during the sweep")
            })
            .await;

        Ok(count)
    }
}

fn task_for(job: &Job) -> Task {
    Task {
        job_id: job.id,
        idempotency_key: job.idempotency_key,
    }
}

fn validate(new_job: &NewJob) -> Result<(), ConductorError> {
    if new_job.tenant_id.is_empty() {
        return Err(ConductorError::Validation(
            "tenantId must not be empty".to_owned(),
        ));
    }
    if new_job.inspection_id.is_empty() {
        return Err(ConductorError::Validation(
            "inspectionId must not be empty".to_owned(),
        ));
    }
    if new_job.max_attempts == Some(0) {
        return Err(ConductorError::Validation(
            "maxAttempts must be at least 1".to_owned(),
        ));
    }
    Ok(())
}
