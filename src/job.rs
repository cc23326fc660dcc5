//! The persisted job document and its state machine.
//!
//! A [`Job`] is the unit of asynchronous work: it carries an opaque input
//! payload, the attempt history, and a [`JobStatus`] that only ever moves
//! forward. All mutation happens through [`crate::store::JobStore`]
//! transactions; the transition helpers here are deliberately crate-private.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod new;

/// Unique identifier of a job, assigned by the service at creation.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Key generated once per job and carried on every dispatched task.
///
/// It distinguishes logical executions for observability purposes; duplicate
/// task deliveries are rejected by the status check in the claim transaction,
/// not by this key.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for IdempotencyKey {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tenant owning a job. Every read and list operation filters by it.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize)]
pub struct TenantId(String);

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The inspection a job belongs to; the list operation scopes by it.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize)]
pub struct InspectionId(String);

impl From<&str> for InspectionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for InspectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl InspectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for InspectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of job kinds this engine processes.
///
/// Each kind is served by exactly one registered
/// [`crate::handler::JobHandler`].
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    AnalyzeRoom,
    AnalyzeInspection,
    GenerateReport,
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AnalyzeRoom => "ANALYZE_ROOM",
            Self::AnalyzeInspection => "ANALYZE_INSPECTION",
            Self::GenerateReport => "GENERATE_REPORT",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle states of a job.
///
/// Transitions: `Queued → Running → {Succeeded | Queued (retry) |
/// DeadLetter}`, with `Queued | Running → Cancelled` triggered externally.
/// `Failed` is terminal and honoured everywhere (claim, cancel, finalize
/// guards) but is only ever written by collaborators outside this engine.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    DeadLetter,
}

impl JobStatus {
    /// Whether the status is final: no further transition may leave it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::DeadLetter
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::DeadLetter => "DEAD_LETTER",
        };
        write!(f, "{name}")
    }
}

/// Last reported execution progress, written durably by the running handler.
#[derive(Debug, Eq, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

impl Progress {
    /// Builds a progress report, clamping the percentage to `0..=100`.
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

/// Classification of a recorded job failure.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    /// The attempt failed but attempts remain; the job was re-queued.
    RetryableError,
    /// All attempts are exhausted; the job is dead-lettered.
    MaxAttemptsExceeded,
}

/// The failure recorded on a job document when an attempt does not succeed.
#[derive(Debug, Eq, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub code: FailureCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            code: FailureCode::RetryableError,
            message: message.into(),
            details: None,
        }
    }

    pub fn max_attempts_exceeded(
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            code: FailureCode::MaxAttemptsExceeded,
            message: message.into(),
            details,
        }
    }
}

/// A persisted unit of asynchronous work.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub inspection_id: InspectionId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub attempts: u16,
    pub max_attempts: u16,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub idempotency_key: IdempotencyKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Job {
    /// Whether every configured attempt has already been claimed.
    pub(crate) fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub(crate) fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_succeeded(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        self.result = Some(result);
        self.error = None;
        self.progress = Some(Progress::new(100, "Complete"));
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_retryable(
        &mut self,
        run_after: DateTime<Utc>,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) {
        self.status = JobStatus::Queued;
        self.run_after = run_after;
        self.error = Some(failure);
        self.updated_at = now;
    }

    pub(crate) fn mark_dead_letter(&mut self, failure: JobFailure, now: DateTime<Utc>) {
        self.status = JobStatus::DeadLetter;
        self.error = Some(failure);
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_requeued(&mut self, note: Progress, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.run_after = now;
        self.progress = Some(note);
        self.updated_at = now;
    }

    pub(crate) fn record_progress(&mut self, progress: Progress, now: DateTime<Utc>) {
        self.progress = Some(progress);
        self.updated_at = now;
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn queued(kind: JobKind) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::generate(),
            tenant_id: "tenant-1".into(),
            inspection_id: "inspection-1".into(),
            kind,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: 3,
            run_after: now,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            input: serde_json::json!({"roomId": "room-1"}),
            progress: None,
            result: None,
            error: None,
            idempotency_key: IdempotencyKey::generate(),
            created_by: None,
        }
    }

    impl Job {
        pub(crate) fn with_tenant(self, tenant_id: impl Into<TenantId>) -> Self {
            Self {
                tenant_id: tenant_id.into(),
                ..self
            }
        }

        pub(crate) fn with_attempts(self, attempts: u16) -> Self {
            Self { attempts, ..self }
        }

        pub(crate) fn with_created_at(self, created_at: DateTime<Utc>) -> Self {
            Self { created_at, ..self }
        }
    }
}
