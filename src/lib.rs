//! A durable job orchestration engine.
//!
//! `conductor` creates persisted units of asynchronous work, dispatches them
//! to workers through a distributed task queue, and guarantees at most one
//! active execution per job despite the queue's at-least-once delivery.
//! Failed attempts are retried on a capped backoff schedule; permanently
//! failing jobs land in a dead-letter state; work abandoned by crashed
//! workers is recovered by a periodic sweep; handlers can chain follow-on
//! jobs that are durably created before their parent completes.
//!
//! The store ([`store::JobStore`]) is the single source of truth and the
//! sole synchronization point: every transition runs as a serializable
//! per-document transaction, and the `Queued → Running` claim is the
//! mutual-exclusion boundary. The queue ([`dispatch::TaskDispatcher`]) is
//! append-only and needs no coordination.
//!
//! # Example
//!
//! ```
//! use conductor::prelude::*;
//! use conductor::dispatch::memory::InMemoryDispatcher;
//! use conductor::store::memory::InMemoryJobStore;
//!
//! # struct AnalyzeRoomHandler;
//! # #[async_trait::async_trait]
//! # impl JobHandler for AnalyzeRoomHandler {
//! #     async fn run(
//! #         &self,
//! #         _job: &Job,
//! #         progress: &dyn ProgressSink,
//! #     ) -> Result<Completion, conductor::handler::HandlerError> {
//! #         progress.report(50, "analysing").await?;
//! #         Completion::of(&serde_json::json!({"walls": 4}))
//! #     }
//! # }
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let store = InMemoryJobStore::new();
//! let dispatcher = InMemoryDispatcher::new();
//! let registry = HandlerRegistry::new().register(JobKind::AnalyzeRoom, AnalyzeRoomHandler);
//!
//! let mut conductor = Conductor::new(store, dispatcher.clone(), registry, Config::default());
//! conductor.start_consumer(dispatcher.subscribe().await);
//!
//! let job = conductor
//!     .service()
//!     .create_job(
//!         NewJob::new(JobKind::AnalyzeRoom, "tenant-1", "inspection-1")
//!             .with_input(serde_json::json!({"roomId": "room-1"})),
//!     )
//!     .await
//!     .unwrap();
//! # let _ = job;
//! conductor.graceful_shutdown().await.unwrap();
//! # });
//! ```

use futures::{Stream, StreamExt};
use std::sync::Arc;
use thiserror::Error;

pub mod backoff;
pub mod dispatch;
pub mod handler;
pub mod job;
pub mod prelude;
pub mod service;
pub mod store;
pub mod testing;
pub mod worker;

use chrono::TimeDelta;
use dispatch::{DispatchError, Task, TaskDispatcher};
use handler::HandlerRegistry;
use job::JobId;
use service::JobService;
use store::{JobStore, StoreError};
use tokio::{sync::mpsc, task::JoinHandle};
use worker::WorkerCore;

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Attempts granted to a job when its creation request does not specify
    /// any.
    pub default_max_attempts: u16,
    /// How long a `Running` job may go without a liveness update before the
    /// sweep considers its worker dead. Must sit comfortably above the
    /// slowest expected handler.
    pub stuck_after: TimeDelta,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_max_attempts: 5,
            stuck_after: TimeDelta::minutes(15),
        }
    }
}

impl Config {
    pub fn with_default_max_attempts(mut self, max_attempts: u16) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_stuck_after(mut self, stuck_after: TimeDelta) -> Self {
        self.stuck_after = stuck_after;
        self
    }
}

/// Wires the engine together: the service, the worker, and optional
/// in-process task consumers.
///
/// Deployments where tasks arrive over an external callback construct the
/// [`JobService`] and [`WorkerCore`] through this type and never start a
/// consumer; in-process deployments feed a delivery stream (such as
/// [`dispatch::memory::InMemoryDispatcher::subscribe`]) to
/// [`Conductor::start_consumer`].
pub struct Conductor<S, D> {
    service: JobService<S, D>,
    worker: Arc<WorkerCore<S, D>>,
    consumers: Vec<ConsumerHandle>,
}

struct ConsumerHandle {
    sender: mpsc::UnboundedSender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    async fn graceful_shutdown(&mut self) -> Result<(), ConductorError> {
        self.sender
            .send(Message::Terminate)
            .map_err(|_| ConductorError::GracefulShutdownFailed)?;
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| ConductorError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

enum Message {
    Terminate,
}

impl<S, D> Conductor<S, D>
where
    S: JobStore + Clone + Send + Sync + 'static,
    D: TaskDispatcher + Clone + Send + Sync + 'static,
{
    pub fn new(store: S, dispatcher: D, registry: HandlerRegistry, config: Config) -> Self {
        let service = JobService::new(store, dispatcher, config);
        let worker = Arc::new(WorkerCore::new(service.clone(), Arc::new(registry)));
        Self {
            service,
            worker,
            consumers: Vec::new(),
        }
    }

    pub fn service(&self) -> &JobService<S, D> {
        &self.service
    }

    pub fn worker(&self) -> Arc<WorkerCore<S, D>> {
        self.worker.clone()
    }

    /// Spawns a consumer processing each task delivered on `deliveries`.
    pub fn start_consumer(
        &mut self,
        deliveries: impl Stream<Item = Result<Task, DispatchError>> + Send + 'static,
    ) {
        let (sender, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn({
            let worker = self.worker.clone();
            async move {
                tokio::pin!(deliveries);
                loop {
                    tokio::select! {
                        delivery = deliveries.next() => {
                            match delivery {
                                Some(Ok(task)) => {
                                    worker.process(task).await;
                                }
                                Some(Err(error)) => {
                                    tracing::error!(?error, "Failed to receive task: {error}")
                                }
                                None => break,
                            }
                        },
                        _ = rx.recv() => {
                            break;
                        }
                    }
                }
                tracing::debug!("Shutting down task consumer");
            }
        });

        self.consumers.push(ConsumerHandle {
            sender,
            handle: Some(handle),
        });
    }

    pub async fn graceful_shutdown(mut self) -> Result<Vec<()>, ConductorError> {
        tracing::debug!("Shutting down conductor consumers");
        futures::future::join_all(
            self.consumers
                .iter_mut()
                .map(ConsumerHandle::graceful_shutdown),
        )
        .await
        .into_iter()
        .collect()
    }
}

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("invalid job request: {0}")]
    Validation(String),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} does not belong to the requesting tenant")]
    Unauthorized(JobId),
    #[error("error communicating with the job store")]
    Store(#[from] StoreError),
    #[error("failed to dispatch a task")]
    Dispatch(#[from] DispatchError),
    #[error("error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("failed to gracefully shut down")]
    GracefulShutdownFailed,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        dispatch::memory::InMemoryDispatcher,
        handler::test::EchoHandler,
        job::{new::NewJob, JobKind, JobStatus},
        store::memory::InMemoryJobStore,
    };

    use super::*;

    #[tokio::test]
    async fn setup() {
        let conductor = Conductor::new(
            InMemoryJobStore::new(),
            InMemoryDispatcher::new(),
            HandlerRegistry::new().register(JobKind::AnalyzeRoom, EchoHandler),
            Config::default(),
        );
        conductor.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn consumer_processes_created_jobs_end_to_end() {
        let dispatcher = InMemoryDispatcher::new();
        let mut conductor = Conductor::new(
            InMemoryJobStore::new(),
            dispatcher.clone(),
            HandlerRegistry::new().register(JobKind::AnalyzeRoom, EchoHandler),
            Config::default(),
        );
        conductor.start_consumer(dispatcher.subscribe().await);

        let job = conductor
            .service()
            .create_job(
                NewJob::new(JobKind::AnalyzeRoom, "tenant-1", "inspection-1")
                    .with_input(serde_json::json!({"roomId": "room-1"})),
            )
            .await
            .unwrap();

        let succeeded = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let job = conductor
                    .service()
                    .get_job(job.id, &"tenant-1".into())
                    .await
                    .unwrap()
                    .unwrap();
                if job.status == JobStatus::Succeeded {
                    break job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job should complete");

        assert_eq!(succeeded.result, Some(serde_json::json!({"roomId": "room-1"})));

        conductor.graceful_shutdown().await.unwrap();
    }
}
