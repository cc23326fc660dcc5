//! The purpose of this module is to alleviate the need to import many of the
//! `conductor` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use conductor::prelude::*;
//! ```
pub use crate::backoff::Stepped;
pub use crate::backoff::Strategy;
pub use crate::backoff::DEFAULT_RETRY_SCHEDULE;
pub use crate::dispatch::{Task, TaskDispatcher};
pub use crate::handler::{Completion, HandlerRegistry, JobHandler, ProgressSink};
pub use crate::job::new::{ChildJob, NewJob};
pub use crate::job::{Job, JobId, JobKind, JobStatus, TenantId};
pub use crate::service::JobService;
pub use crate::store::{JobFilter, JobStore};
pub use crate::worker::{ProcessOutcome, WorkerCore};
pub use crate::{Conductor, Config, ConductorError};
