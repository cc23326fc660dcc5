//! Provides an in memory implementation of [`TaskDispatcher`].
//!
//! Currently this is provided for testing purposes and not designed for use
//! in a production system: the real queue is a managed service delivering
//! tasks over an HTTP callback. Delivery order, delayed delivery, and
//! wake-on-enqueue are modelled faithfully; durability is not.

use std::{
    ops::Sub,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use tokio::sync::mpsc;

use super::{DispatchError, DispatchHandle, Task, TaskDispatcher};

/// A task accepted by the in-memory queue, awaiting delivery.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub task: Task,
    pub not_before: DateTime<Utc>,
    pub handle: DispatchHandle,
}

type Subscriber = mpsc::UnboundedSender<DateTime<Utc>>;

/// An in memory implementation of [`TaskDispatcher`].
///
/// **This is not designed for use in production systems.**
#[derive(Clone, Default)]
pub struct InMemoryDispatcher {
    queue: Arc<RwLock<Vec<ScheduledTask>>>,
    handle_counter: Arc<AtomicU64>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    paused: Arc<AtomicBool>,
}

struct DeliveryStream {
    dispatcher: InMemoryDispatcher,
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl DeliveryStream {
    const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    async fn next(&mut self) -> Result<Task, DispatchError> {
        loop {
            let delay = match self.dispatcher.next_due()? {
                Some(not_before) => not_before
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::DEFAULT_DELAY),
                None => Self::DEFAULT_DELAY,
            };
            if delay <= Self::DELTA {
                if let Some(task) = self.dispatcher.pop_due()? {
                    return Ok(task);
                }
            }
            tokio::select! {
                _ = self.receiver.recv() => { },
                _ = tokio::time::sleep(delay) => { },
            }
        }
    }
}

impl InMemoryDispatcher {
    /// Creates a new instance of [`InMemoryDispatcher`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the dispatcher in paused mode where subscribers are not woken up
    /// when tasks are enqueued.
    ///
    /// If you would like delivery to continue later in the test you can call
    /// [`InMemoryDispatcher::notify_all`].
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake up all delivery subscribers.
    ///
    /// Particularly helpful when running the dispatcher in paused mode.
    pub fn notify_all(&self) -> Result<(), DispatchError> {
        let now = Utc::now();
        self.subscribers
            .read()
            .map_err(|_| DispatchError::Unavailable)?
            .iter()
            .for_each(|sender| {
                let _ = sender.send(now);
            });
        Ok(())
    }

    /// Subscribes to task deliveries: yields each queued task once its
    /// `not_before` time has passed, earliest first.
    pub async fn subscribe(&self) -> Pin<Box<dyn Stream<Item = Result<Task, DispatchError>> + Send>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .expect("subscriber registry poisoned")
            .push(sender);

        let mut stream = DeliveryStream {
            dispatcher: self.clone(),
            receiver,
        };
        Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        })
    }

    /// A snapshot of every task currently awaiting delivery.
    pub fn scheduled(&self) -> Vec<ScheduledTask> {
        self.queue.read().map(|queue| queue.clone()).unwrap_or_default()
    }

    /// Removes and returns all tasks due at `now`, earliest first. Useful
    /// for driving a worker deterministically in tests.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut queue = match self.queue.write() {
            Ok(queue) => queue,
            Err(_) => return Vec::new(),
        };
        queue.sort_by(|a, b| a.not_before.cmp(&b.not_before));
        let mut due = Vec::new();
        queue.retain(|scheduled| {
            if scheduled.not_before <= now {
                due.push(scheduled.task.clone());
                false
            } else {
                true
            }
        });
        due
    }

    fn next_due(&self) -> Result<Option<DateTime<Utc>>, DispatchError> {
        Ok(self
            .queue
            .read()
            .map_err(|_| DispatchError::Unavailable)?
            .iter()
            .map(|scheduled| scheduled.not_before)
            .min())
    }

    fn pop_due(&self) -> Result<Option<Task>, DispatchError> {
        let mut queue = self.queue.write().map_err(|_| DispatchError::Unavailable)?;
        let due = queue
            .iter()
            .enumerate()
            .filter(|(_, scheduled)| {
                scheduled.not_before - Utc::now() < TimeDelta::milliseconds(100)
            })
            .min_by_key(|(_, scheduled)| scheduled.not_before)
            .map(|(index, _)| index);
        Ok(due.map(|index| queue.remove(index).task))
    }

    fn notify_subscribers(&self, not_before: DateTime<Utc>) -> Result<(), DispatchError> {
        if !self.paused.load(Ordering::Relaxed) {
            self.subscribers
                .read()
                .map_err(|_| DispatchError::Unavailable)?
                .iter()
                .for_each(|sender| {
                    let _ = sender.send(not_before);
                });
        }
        Ok(())
    }
}

#[async_trait]
impl TaskDispatcher for InMemoryDispatcher {
    async fn enqueue(
        &self,
        task: Task,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<DispatchHandle, DispatchError> {
        let not_before = not_before.unwrap_or_else(Utc::now);
        let handle = DispatchHandle::new(format!(
            "task-{}",
            self.handle_counter.fetch_add(1, Ordering::SeqCst)
        ));
        self.queue
            .write()
            .map_err(|_| DispatchError::Unavailable)?
            .push(ScheduledTask {
                task,
                not_before,
                handle: handle.clone(),
            });
        self.notify_subscribers(not_before)?;
        Ok(handle)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use crate::job::{IdempotencyKey, JobId};

    use super::*;

    fn task() -> Task {
        Task {
            job_id: JobId::generate(),
            idempotency_key: IdempotencyKey::generate(),
        }
    }

    #[tokio::test]
    async fn enqueue_records_scheduled_tasks() {
        let dispatcher = InMemoryDispatcher::new();
        let first = dispatcher.enqueue(task(), None).await.unwrap();
        let second = dispatcher
            .enqueue(task(), Some(Utc::now() + TimeDelta::minutes(5)))
            .await
            .unwrap();

        let scheduled = dispatcher.scheduled();
        assert_eq!(scheduled.len(), 2);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn drain_due_skips_future_tasks() {
        let dispatcher = InMemoryDispatcher::new();
        let due = task();
        let delayed = task();
        dispatcher.enqueue(due.clone(), None).await.unwrap();
        dispatcher
            .enqueue(delayed, Some(Utc::now() + TimeDelta::minutes(5)))
            .await
            .unwrap();

        let drained = dispatcher.drain_due(Utc::now());
        assert_eq!(drained, vec![due]);
        assert_eq!(dispatcher.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn subscriber_receives_due_task() {
        let dispatcher = InMemoryDispatcher::new();
        let mut deliveries = dispatcher.subscribe().await;
        let expected = task();

        let handle = {
            let expected = expected.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(Duration::from_secs(1), deliveries.next()).await {
                    Ok(Some(Ok(delivered))) => assert_eq!(delivered, expected),
                    Err(_) => panic!("Didn't get woken by enqueue of new task"),
                    _ => panic!("Bad things happened"),
                }
            })
        };
        tokio::task::yield_now().await;
        dispatcher.enqueue(expected, None).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn delayed_task_is_not_delivered_early() {
        let dispatcher = InMemoryDispatcher::new();
        let mut deliveries = dispatcher.subscribe().await;
        dispatcher
            .enqueue(task(), Some(Utc::now() + TimeDelta::minutes(5)))
            .await
            .unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(200), deliveries.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn enqueuing_does_not_wake_subscriber_when_paused() {
        let dispatcher = InMemoryDispatcher::new().paused();
        let mut deliveries = dispatcher.subscribe().await;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(1), deliveries.next()).await {
                Ok(Some(Ok(_task))) => panic!("Should not get woken up"),
                Err(_) => {}
                _ => panic!("Bad things happened"),
            }
        });
        tokio::task::yield_now().await;
        dispatcher.enqueue(task(), None).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn calling_notify_all_continues_delivery() {
        let dispatcher = InMemoryDispatcher::new().paused();
        let mut deliveries = dispatcher.subscribe().await;
        let expected = task();
        let handle = {
            let expected = expected.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(Duration::from_secs(1), deliveries.next()).await {
                    Ok(Some(Ok(delivered))) => assert_eq!(delivered, expected),
                    Err(_) => panic!("Didn't get woken by notify_all"),
                    _ => panic!("Bad things happened"),
                }
            })
        };
        tokio::task::yield_now().await;
        dispatcher.enqueue(expected, None).await.unwrap();
        dispatcher.notify_all().unwrap();
        handle.await.unwrap();
    }
}
