//! Provides an in memory implementation of [`JobStore`].
//!
//! Currently this is provided for testing purposes and not designed for use
//! in a production system.
//!
//! It is not optimized, instead it is designed to be a correct
//! implementation for use in a test setup: the document map's write lock
//! plays the role of the real store's per-document transaction, so every
//! conditional transition observes a consistent snapshot.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{Job, JobFailure, JobId, JobStatus, Progress, TenantId};

use super::{CancelOutcome, ClaimOutcome, FinalizeOutcome, JobFilter, JobStore, StoreError};

/// An in memory implementation of [`JobStore`].
///
/// **This is not designed for use in production systems.**
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl InMemoryJobStore {
    /// Creates a new instance of [`InMemoryJobStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The single-document transaction: holds the write lock across the
    /// read-modify-write.
    fn mutate<R>(
        &self,
        id: JobId,
        apply: impl FnOnce(&mut Job) -> R,
    ) -> Result<R, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.get_mut(&id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) => Ok(apply(job)),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_updated_at(&self, id: JobId, updated_at: DateTime<Utc>) {
        self.mutate(id, |job| job.updated_at = updated_at).unwrap();
    }

    #[cfg(test)]
    pub(crate) fn set_run_after(&self, id: JobId, run_after: DateTime<Utc>) {
        self.mutate(id, |job| job.run_after = run_after).unwrap();
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateJob(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(&id)
            .cloned())
    }

    async fn fetch_for_tenant(
        &self,
        id: JobId,
        tenant_id: &TenantId,
    ) -> Result<Option<Job>, StoreError> {
        Ok(self
            .fetch(id)
            .await?
            .filter(|job| &job.tenant_id == tenant_id))
    }

    async fn claim(&self, id: JobId) -> Result<ClaimOutcome, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };
        if job.status != JobStatus::Queued {
            return Ok(ClaimOutcome::NotRunnable(job.status));
        }
        let now = Utc::now();
        if job.attempts_exhausted() {
            // A crashed final attempt that the sweep re-queued: claiming it
            // would push attempts past max_attempts.
            job.mark_dead_letter(
                JobFailure::max_attempts_exceeded(
                    "all attempts were consumed without a recorded outcome",
                    None,
                ),
                now,
            );
            return Ok(ClaimOutcome::Exhausted);
        }
        job.mark_claimed(now);
        Ok(ClaimOutcome::Claimed(job.clone()))
    }

    async fn complete(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<FinalizeOutcome, StoreError> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Running {
                return FinalizeOutcome::Superseded(job.status);
            }
            job.mark_succeeded(result, Utc::now());
            FinalizeOutcome::Applied
        })
    }

    async fn retry(
        &self,
        id: JobId,
        run_after: DateTime<Utc>,
        failure: JobFailure,
    ) -> Result<FinalizeOutcome, StoreError> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Running {
                return FinalizeOutcome::Superseded(job.status);
            }
            job.mark_retryable(run_after, failure, Utc::now());
            FinalizeOutcome::Applied
        })
    }

    async fn dead_letter(
        &self,
        id: JobId,
        failure: JobFailure,
    ) -> Result<FinalizeOutcome, StoreError> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Running {
                return FinalizeOutcome::Superseded(job.status);
            }
            job.mark_dead_letter(failure, Utc::now());
            FinalizeOutcome::Applied
        })
    }

    async fn cancel(&self, id: JobId) -> Result<CancelOutcome, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(job.clone()));
        }
        job.mark_cancelled(Utc::now());
        Ok(CancelOutcome::Cancelled(job.clone()))
    }

    async fn record_progress(&self, id: JobId, progress: Progress) -> Result<bool, StoreError> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Running {
                return false;
            }
            job.record_progress(progress, Utc::now());
            true
        })
    }

    async fn requeue_stuck(
        &self,
        id: JobId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running || job.updated_at >= stale_before {
            return Ok(false);
        }
        let percent = job.progress.as_ref().map(|p| p.percent).unwrap_or(0);
        job.mark_requeued(
            Progress::new(percent, "Re-queued after worker timeout"),
            Utc::now(),
        );
        Ok(true)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| {
                job.tenant_id == filter.tenant_id
                    && job.inspection_id == filter.inspection_id
                    && filter.status.map_or(true, |status| job.status == status)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(filter.limit);
        Ok(matching)
    }

    async fn stale(
        &self,
        status: JobStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| job.status == status && liveness(job) < older_than)
            .cloned()
            .collect();
        matching.sort_by(|a, b| liveness(a).cmp(&liveness(b)));
        matching.truncate(limit);
        Ok(matching)
    }
}

fn liveness(job: &Job) -> DateTime<Utc> {
    match job.status {
        JobStatus::Queued => job.run_after,
        _ => job.updated_at,
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use crate::job::fixtures;
    use crate::job::JobKind;

    use super::*;

    async fn store_with(job: Job) -> InMemoryJobStore {
        let store = InMemoryJobStore::new();
        store.insert(job).await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_and_fetch() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;

        assert_eq!(store.fetch(job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;

        assert_matches!(
            store.insert(job).await,
            Err(StoreError::DuplicateJob(_))
        );
    }

    #[tokio::test]
    async fn fetch_for_tenant_hides_other_tenants() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;

        assert!(store
            .fetch_for_tenant(job.id, &job.tenant_id)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .fetch_for_tenant(job.id, &"another-tenant".into())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn claim_transitions_queued_to_running() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;

        let claimed = assert_matches!(
            store.claim(job.id).await.unwrap(),
            ClaimOutcome::Claimed(job) => job
        );
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn claim_skips_running_and_terminal_jobs() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;

        assert_matches!(store.claim(job.id).await.unwrap(), ClaimOutcome::Claimed(_));
        assert_matches!(
            store.claim(job.id).await.unwrap(),
            ClaimOutcome::NotRunnable(JobStatus::Running)
        );

        store
            .complete(job.id, serde_json::json!({}))
            .await
            .unwrap();
        assert_matches!(
            store.claim(job.id).await.unwrap(),
            ClaimOutcome::NotRunnable(JobStatus::Succeeded)
        );
    }

    #[tokio::test]
    async fn claim_of_unknown_job_reports_not_found() {
        let store = InMemoryJobStore::new();
        assert_matches!(
            store.claim(JobId::generate()).await.unwrap(),
            ClaimOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn claim_dead_letters_exhausted_jobs() {
        let job = fixtures::queued(JobKind::AnalyzeRoom).with_attempts(3);
        let store = store_with(job.clone()).await;

        assert_matches!(store.claim(job.id).await.unwrap(), ClaimOutcome::Exhausted);

        let job = store.fetch(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert_eq!(
            job.error.unwrap().code,
            crate::job::FailureCode::MaxAttemptsExceeded
        );
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_one_winner() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;

        let outcomes =
            futures::future::join_all((0..8).map(|_| {
                let store = store.clone();
                let id = job.id;
                tokio::spawn(async move { store.claim(id).await.unwrap() })
            }))
            .await;

        let wins = outcomes
            .into_iter()
            .map(Result::unwrap)
            .filter(|outcome| matches!(outcome, ClaimOutcome::Claimed(_)))
            .count();
        assert_eq!(wins, 1);

        let job = store.fetch(job.id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn complete_records_result_and_progress() {
        let job = fixtures::queued(JobKind::GenerateReport);
        let store = store_with(job.clone()).await;
        store.claim(job.id).await.unwrap();

        let outcome = store
            .complete(job.id, serde_json::json!({"reportUrl": "gs://reports/1"}))
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Applied);

        let job = store.fetch(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(
            job.result,
            Some(serde_json::json!({"reportUrl": "gs://reports/1"}))
        );
        assert_eq!(job.progress, Some(Progress::new(100, "Complete")));
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn finalize_is_superseded_by_cancellation() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;
        store.claim(job.id).await.unwrap();
        store.cancel(job.id).await.unwrap();

        assert_matches!(
            store.complete(job.id, serde_json::json!({})).await.unwrap(),
            FinalizeOutcome::Superseded(JobStatus::Cancelled)
        );
        assert_matches!(
            store
                .retry(job.id, Utc::now(), JobFailure::retryable("boom"))
                .await
                .unwrap(),
            FinalizeOutcome::Superseded(JobStatus::Cancelled)
        );
        assert_matches!(
            store
                .dead_letter(job.id, JobFailure::retryable("boom"))
                .await
                .unwrap(),
            FinalizeOutcome::Superseded(JobStatus::Cancelled)
        );

        let job = store.fetch(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn retry_requeues_with_failure_recorded() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;
        store.claim(job.id).await.unwrap();

        let run_after = Utc::now() + TimeDelta::seconds(10);
        let outcome = store
            .retry(job.id, run_after, JobFailure::retryable("model unavailable"))
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Applied);

        let job = store.fetch(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.run_after, run_after);
        assert_eq!(job.attempts, 1);
        assert_eq!(
            job.error.unwrap().code,
            crate::job::FailureCode::RetryableError
        );
    }

    #[tokio::test]
    async fn cancel_never_resurrects_finished_jobs() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;
        store.claim(job.id).await.unwrap();
        store.complete(job.id, serde_json::json!({})).await.unwrap();

        let unchanged = assert_matches!(
            store.cancel(job.id).await.unwrap(),
            CancelOutcome::AlreadyFinished(job) => job
        );
        assert_eq!(unchanged.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancel_queued_job() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;

        let cancelled = assert_matches!(
            store.cancel(job.id).await.unwrap(),
            CancelOutcome::Cancelled(job) => job
        );
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.finished_at.is_some());
    }

    #[tokio::test]
    async fn record_progress_only_while_running() {
        let job = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(job.clone()).await;

        assert!(!store
            .record_progress(job.id, Progress::new(10, "starting"))
            .await
            .unwrap());

        store.claim(job.id).await.unwrap();
        assert!(store
            .record_progress(job.id, Progress::new(40, "analysing walls"))
            .await
            .unwrap());

        let job = store.fetch(job.id).await.unwrap().unwrap();
        assert_eq!(job.progress, Some(Progress::new(40, "analysing walls")));
    }

    #[tokio::test]
    async fn requeue_stuck_resets_only_stale_running_jobs() {
        let stale = fixtures::queued(JobKind::AnalyzeRoom);
        let fresh = fixtures::queued(JobKind::AnalyzeRoom);
        let store = store_with(stale.clone()).await;
        store.insert(fresh.clone()).await.unwrap();
        store.claim(stale.id).await.unwrap();
        store.claim(fresh.id).await.unwrap();
        store.set_updated_at(stale.id, Utc::now() - TimeDelta::minutes(30));

        let cutoff = Utc::now() - TimeDelta::minutes(15);
        assert!(store.requeue_stuck(stale.id, cutoff).await.unwrap());
        assert!(!store.requeue_stuck(fresh.id, cutoff).await.unwrap());

        let stale = store.fetch(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, JobStatus::Queued);
        assert_eq!(
            stale.progress.unwrap().message,
            "Re-queued after worker timeout"
        );
        let fresh = store.fetch(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn list_is_tenant_scoped_and_newest_first() {
        let store = InMemoryJobStore::new();
        let old = fixtures::queued(JobKind::AnalyzeRoom)
            .with_created_at(Utc::now() - TimeDelta::minutes(10));
        let recent = fixtures::queued(JobKind::GenerateReport);
        let foreign = fixtures::queued(JobKind::AnalyzeRoom).with_tenant("another-tenant");
        store.insert(old.clone()).await.unwrap();
        store.insert(recent.clone()).await.unwrap();
        store.insert(foreign).await.unwrap();

        let listed = store
            .list(&JobFilter::for_inspection("tenant-1", "inspection-1"))
            .await
            .unwrap();

        assert_eq!(
            listed.iter().map(|job| job.id).collect::<Vec<_>>(),
            vec![recent.id, old.id]
        );
    }

    #[tokio::test]
    async fn list_filters_by_status_and_limits() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store
                .insert(fixtures::queued(JobKind::AnalyzeRoom))
                .await
                .unwrap();
        }
        let running = fixtures::queued(JobKind::AnalyzeRoom);
        store.insert(running.clone()).await.unwrap();
        store.claim(running.id).await.unwrap();

        let filter = JobFilter::for_inspection("tenant-1", "inspection-1")
            .with_status(JobStatus::Queued)
            .with_limit(2);
        let listed = store.list(&filter).await.unwrap();

        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|job| job.status == JobStatus::Queued));
    }

    #[tokio::test]
    async fn stale_scans_by_liveness_timestamp() {
        let store = InMemoryJobStore::new();
        let abandoned = fixtures::queued(JobKind::AnalyzeRoom);
        let healthy = fixtures::queued(JobKind::AnalyzeRoom);
        let undelivered = fixtures::queued(JobKind::GenerateReport);
        store.insert(abandoned.clone()).await.unwrap();
        store.insert(healthy.clone()).await.unwrap();
        store.insert(undelivered.clone()).await.unwrap();
        store.claim(abandoned.id).await.unwrap();
        store.claim(healthy.id).await.unwrap();
        store.set_updated_at(abandoned.id, Utc::now() - TimeDelta::hours(1));
        store.set_run_after(undelivered.id, Utc::now() - TimeDelta::hours(1));

        let cutoff = Utc::now() - TimeDelta::minutes(15);

        let running = store
            .stale(JobStatus::Running, cutoff, 100)
            .await
            .unwrap();
        assert_eq!(
            running.iter().map(|job| job.id).collect::<Vec<_>>(),
            vec![abandoned.id]
        );

        let queued = store.stale(JobStatus::Queued, cutoff, 100).await.unwrap();
        assert_eq!(
            queued.iter().map(|job| job.id).collect::<Vec<_>>(),
            vec![undelivered.id]
        );
    }
}
