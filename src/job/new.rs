//! Requests for creating jobs.
//!
//! [`NewJob`] is the input to [`crate::service::JobService::create_job`];
//! [`ChildJob`] is the trimmed-down variant a handler returns to chain
//! follow-on work, inheriting tenant, inspection, and provenance from its
//! parent.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::ConductorError;

use super::{InspectionId, JobKind, TenantId};

/// A request to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) tenant_id: TenantId,
    pub(crate) inspection_id: InspectionId,
    pub(crate) kind: JobKind,
    pub(crate) input: serde_json::Value,
    pub(crate) max_attempts: Option<u16>,
    pub(crate) created_by: Option<String>,
    pub(crate) run_after: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(
        kind: JobKind,
        tenant_id: impl Into<TenantId>,
        inspection_id: impl Into<InspectionId>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            inspection_id: inspection_id.into(),
            kind,
            input: serde_json::Value::Null,
            max_attempts: None,
            created_by: None,
            run_after: None,
        }
    }

    pub fn with_input(self, input: serde_json::Value) -> Self {
        Self { input, ..self }
    }

    /// Serializes `data` as the job input.
    pub fn with_data<T: Serialize>(self, data: &T) -> Result<Self, ConductorError> {
        Ok(Self {
            input: serde_json::to_value(data)?,
            ..self
        })
    }

    /// Overrides the configured default number of attempts.
    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub fn created_by(self, user_id: impl Into<String>) -> Self {
        Self {
            created_by: Some(user_id.into()),
            ..self
        }
    }

    pub fn schedule_at(self, run_after: DateTime<Utc>) -> Self {
        Self {
            run_after: Some(run_after),
            ..self
        }
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        Self {
            run_after: Some(Utc::now() + delay),
            ..self
        }
    }
}

/// Follow-on work returned by a handler.
///
/// The engine creates the child through the job service before finalizing the
/// parent, so a crash between handler return and parent finalize never loses
/// the chain.
#[derive(Debug, Clone)]
pub struct ChildJob {
    pub(crate) kind: JobKind,
    pub(crate) input: serde_json::Value,
    pub(crate) max_attempts: Option<u16>,
}

impl ChildJob {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            input: serde_json::Value::Null,
            max_attempts: None,
        }
    }

    pub fn with_input(self, input: serde_json::Value) -> Self {
        Self { input, ..self }
    }

    /// Serializes `data` as the child's input.
    pub fn with_data<T: Serialize>(self, data: &T) -> Result<Self, ConductorError> {
        Ok(Self {
            input: serde_json::to_value(data)?,
            ..self
        })
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }
}
