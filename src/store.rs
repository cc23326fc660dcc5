//! Abstraction over the persisted job store.
//!
//! The store is the single source of truth and the sole synchronization
//! point of the engine: every state transition is a per-document
//! read-modify-write executed with isolation equivalent to a serializable
//! single-document transaction. The conditional methods re-read the current
//! status inside that transaction and report whether the transition applied,
//! so callers never overwrite a state they did not observe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Job, JobFailure, JobId, JobStatus, Progress, TenantId};

pub mod memory;

/// Result of attempting to claim a job for execution.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The claim transaction committed: the job is now `Running` with
    /// `attempts` incremented exactly once. The returned document is the
    /// post-claim state.
    Claimed(Job),
    /// Every configured attempt was already consumed without a recorded
    /// outcome (a crashed final attempt re-queued by the sweep); the job was
    /// dead-lettered inside the claim transaction instead of being claimed.
    Exhausted,
    /// The job is not in a claimable state: it is already running or has
    /// reached a terminal status. Duplicate and late deliveries end here.
    NotRunnable(JobStatus),
    /// No job with this id exists.
    NotFound,
}

/// Result of a conditional finalizing transition.
#[derive(Debug, Eq, PartialEq)]
pub enum FinalizeOutcome {
    /// The transition applied.
    Applied,
    /// Another transition won: the job was no longer `Running` (typically
    /// cancelled mid-execution, or reset by the stuck-job sweep).
    Superseded(JobStatus),
}

/// Result of a cancellation request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The job moved to `Cancelled`.
    Cancelled(Job),
    /// The job had already reached a terminal status; cancellation never
    /// resurrects a finished job. The document is returned unchanged.
    AlreadyFinished(Job),
    /// No job with this id exists.
    NotFound,
}

/// Tenant-scoped listing criteria.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub tenant_id: TenantId,
    pub inspection_id: crate::job::InspectionId,
    pub status: Option<JobStatus>,
    pub limit: usize,
}

impl JobFilter {
    pub const DEFAULT_LIMIT: usize = 20;

    pub fn for_inspection(
        tenant_id: impl Into<TenantId>,
        inspection_id: impl Into<crate::job::InspectionId>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            inspection_id: inspection_id.into(),
            status: None,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {0} already exists")]
    DuplicateJob(JobId),
    #[error("error encoding or decoding a job document")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("store in bad state")]
    BadState,
}

/// The persisted job store contract.
///
/// Implementations must execute every method as a single serializable
/// read-modify-write over the addressed document. Jobs are never physically
/// deleted through this interface; retention is an external concern.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a freshly created job. Fails if the id is already taken.
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    async fn fetch(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Fetches a job only if it belongs to `tenant_id`. Absence and tenant
    /// mismatch are indistinguishable to the caller.
    async fn fetch_for_tenant(
        &self,
        id: JobId,
        tenant_id: &TenantId,
    ) -> Result<Option<Job>, StoreError>;

    /// The mutual-exclusion point of the engine: atomically transitions
    /// `Queued → Running` with `attempts += 1`, or reports why it could not.
    async fn claim(&self, id: JobId) -> Result<ClaimOutcome, StoreError>;

    /// `Running → Succeeded` with the handler result recorded.
    async fn complete(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<FinalizeOutcome, StoreError>;

    /// `Running → Queued` with a new `run_after` and the failure recorded.
    async fn retry(
        &self,
        id: JobId,
        run_after: DateTime<Utc>,
        failure: JobFailure,
    ) -> Result<FinalizeOutcome, StoreError>;

    /// `Running → DeadLetter`, terminal.
    async fn dead_letter(
        &self,
        id: JobId,
        failure: JobFailure,
    ) -> Result<FinalizeOutcome, StoreError>;

    /// `Queued | Running → Cancelled`; a no-op for finished jobs.
    async fn cancel(&self, id: JobId) -> Result<CancelOutcome, StoreError>;

    /// Durably records execution progress and refreshes `updated_at` (the
    /// liveness signal observed by the stuck-job sweep). Applies only while
    /// the job is `Running`; returns whether it applied.
    async fn record_progress(&self, id: JobId, progress: Progress) -> Result<bool, StoreError>;

    /// `Running → Queued` reset for a job abandoned by a crashed worker,
    /// applied only if `updated_at` is still older than `stale_before`.
    /// Returns whether it applied.
    async fn requeue_stuck(
        &self,
        id: JobId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Tenant-scoped listing, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Jobs in `status` whose liveness timestamp is older than `older_than`,
    /// oldest first: `updated_at` for `Running` jobs, `run_after` for
    /// `Queued` jobs (due but untouched). Used by the stuck-job sweep.
    async fn stale(
        &self,
        status: JobStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;
}
