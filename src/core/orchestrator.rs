//! Task orchestration: the handler behind the dispatch loop.
//!
//! Each delivery moves its task through STARTED, runs the executor under the
//! execution budget and then settles the task's fate:
//!
//! - success: SUCCESS with the output descriptor
//! - recoverable failure with retries left: back off `base * 2^R`, then
//!   republish the message with `retry = R`
//! - otherwise: FAILURE with the error text, original message to the
//!   dead-letter queue
//!
//! The delivery itself is always acknowledged once the orchestrator has
//! taken responsibility; retries travel as new publishes, never as
//! broker-level requeues.
//!
//! A delivery is stale when its task already finished, when a later retry
//! of it has been recorded (`retry < retry_count`), or when the same task
//! is still executing in this worker. Stale deliveries are acknowledged
//! without running anything.

use crate::config::{QueueKind, RetryPolicy, WorkerConfig};
use crate::core::consumer::{Disposition, MessageHandler};
use crate::core::publisher::{PublishOutcome, Publisher};
use crate::core::registry::{ExecutionOutcome, ExecutionRequest, Executor, run_with_budget};
use crate::error::{RelayError, RelayResult};
use crate::store::TaskStore;
use crate::task::{TaskId, TaskMessage};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Outcome counters of the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorCounts {
    /// Tasks that reached SUCCESS
    pub succeeded: u64,
    /// Retry republishes that were confirmed
    pub retries_scheduled: u64,
    /// Tasks finalised as FAILURE
    pub dead_lettered: u64,
    /// Stale deliveries that were acknowledged without running
    pub duplicates_skipped: u64,
}

#[derive(Debug, Default)]
struct OrchestratorStats {
    succeeded: AtomicU64,
    retries_scheduled: AtomicU64,
    dead_lettered: AtomicU64,
    duplicates_skipped: AtomicU64,
}

/// Drives one task delivery from receipt to a settled outcome.
pub struct TaskOrchestrator {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn Executor>,
    publisher: Arc<Publisher>,
    policy: RetryPolicy,
    task_timeout: Duration,
    budget: Duration,
    stats: OrchestratorStats,
    in_flight: Mutex<HashSet<TaskId>>,
}

/// Claim on a task executing in this worker, released on drop
struct InFlight<'a> {
    tasks: &'a Mutex<HashSet<TaskId>>,
    task_id: TaskId,
}

impl<'a> InFlight<'a> {
    fn claim(tasks: &'a Mutex<HashSet<TaskId>>, task_id: TaskId) -> Option<Self> {
        let inserted = tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id);
        inserted.then_some(Self { tasks, task_id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

impl TaskOrchestrator {
    /// Create an orchestrator using the retry policy and timeouts of `config`
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
        publisher: Arc<Publisher>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            publisher,
            policy: config.retry.clone(),
            task_timeout: config.task_timeout(),
            budget: config.execution_budget(),
            stats: OrchestratorStats::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Current counters
    pub fn stats(&self) -> OrchestratorCounts {
        OrchestratorCounts {
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            retries_scheduled: self.stats.retries_scheduled.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            duplicates_skipped: self.stats.duplicates_skipped.load(Ordering::Relaxed),
        }
    }

    /// Process one delivery of `message`.
    ///
    /// Errors are infrastructure or bookkeeping faults (missing task row,
    /// store failure); the dispatch loop rejects such deliveries to the
    /// dead-letter queue.
    pub async fn process(&self, message: TaskMessage) -> RelayResult<Disposition> {
        let task_id = message.id;

        let record = self
            .store
            .fetch(&task_id)
            .await?
            .ok_or(RelayError::TaskNotFound { task_id })?;

        if record.status.is_terminal() {
            return Ok(self.skip(&message, "task already finished"));
        }
        if message.retry < record.retry_count {
            return Ok(self.skip(&message, "superseded by a later retry"));
        }
        let Some(_claim) = InFlight::claim(&self.in_flight, task_id) else {
            return Ok(self.skip(&message, "task is already executing"));
        };

        self.store.mark_started(&task_id).await?;
        tracing::info!(
            task_id = %task_id,
            task_type = %message.task_type,
            retry = message.retry,
            "Task started"
        );

        let request = ExecutionRequest::from_message(&message, self.task_timeout);
        let outcome = run_with_budget(Arc::clone(&self.executor), request, self.budget).await;

        match outcome {
            ExecutionOutcome::Success(output) => {
                self.store.mark_success(&task_id, &output).await?;
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    task_id = %task_id,
                    output_type = %output.output_type,
                    location = %output.location,
                    "Task succeeded"
                );
                Ok(Disposition::Ack)
            }
            ExecutionOutcome::Recoverable(error) => self.handle_failure(&message, error, true).await,
            ExecutionOutcome::Fatal(error) => self.handle_failure(&message, error, false).await,
        }
    }

    fn skip(&self, message: &TaskMessage, reason: &str) -> Disposition {
        self.stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            task_id = %message.id,
            retry = message.retry,
            "Skipping stale delivery: {}",
            reason
        );
        Disposition::Ack
    }

    async fn handle_failure(
        &self,
        message: &TaskMessage,
        error: String,
        recoverable: bool,
    ) -> RelayResult<Disposition> {
        let task_id = message.id;
        let retry = self.store.increment_retry(&task_id).await?;

        if !recoverable || !self.policy.allows(retry) {
            return self.finalize(message, &error, retry).await;
        }

        let delay = self.policy.backoff(retry);
        tracing::warn!(
            task_id = %task_id,
            retry,
            "Task failed: {}. Retrying in {:?}",
            error,
            delay
        );
        tokio::time::sleep(delay).await;

        match self
            .publisher
            .publish(&message.with_retry(retry), QueueKind::Work)
            .await?
        {
            PublishOutcome::Confirmed => {
                self.stats.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                Ok(Disposition::Ack)
            }
            dropped => {
                let error = format!("{error} (retry publish was {})", dropped.as_str());
                self.finalize(message, &error, retry).await
            }
        }
    }

    async fn finalize(
        &self,
        message: &TaskMessage,
        error: &str,
        retry: u32,
    ) -> RelayResult<Disposition> {
        let task_id = message.id;
        self.store.mark_failure(&task_id, error).await?;
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            task_id = %task_id,
            retry,
            "Task failed permanently: {}",
            error
        );

        // A dropped dead-letter publish is logged by the publisher; the
        // failure is already recorded.
        self.publisher.publish(message, QueueKind::DeadLetter).await?;
        Ok(Disposition::Ack)
    }
}

#[async_trait]
impl MessageHandler for TaskOrchestrator {
    async fn handle(&self, message: TaskMessage) -> RelayResult<Disposition> {
        self.process(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::QueueConfig;
    use crate::core::connection::ConnectionManager;
    use crate::core::registry::ExecutionError;
    use crate::store::InMemoryTaskStore;
    use crate::task::{OutputDescriptor, TaskParams, TaskStatus};
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;
    use uuid::Uuid;

    /// Fails the first `failures` calls, then succeeds
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        error: ExecutionError,
    }

    impl Flaky {
        fn new(failures: u32, error: ExecutionError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                error,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Executor for Flaky {
        async fn execute(
            &self,
            request: &ExecutionRequest,
        ) -> Result<OutputDescriptor, ExecutionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(OutputDescriptor::new(
                    "json",
                    format!("/out/{}.json", request.task_id),
                ))
            }
        }
    }

    struct Fixture {
        broker: InMemoryBroker,
        store: InMemoryTaskStore,
        orchestrator: TaskOrchestrator,
    }

    async fn fixture(executor: Arc<dyn Executor>) -> Fixture {
        let broker = InMemoryBroker::new();
        let store = InMemoryTaskStore::new();
        let manager = Arc::new(ConnectionManager::new(Arc::new(broker.clone())));
        let publisher = Arc::new(Publisher::new(manager, QueueConfig::default(), true));
        publisher.ensure_queues().await.unwrap();

        let config = WorkerConfig::default()
            .with_task_timeout(10)
            .with_retry_policy(RetryPolicy::exponential(2));
        let orchestrator =
            TaskOrchestrator::new(Arc::new(store.clone()), executor, publisher, &config);

        Fixture {
            broker,
            store,
            orchestrator,
        }
    }

    async fn submitted(store: &InMemoryTaskStore) -> TaskMessage {
        let id = Uuid::new_v4();
        store
            .insert(id, "report", None, &TaskParams::new())
            .await
            .unwrap();
        TaskMessage::new(id, "report", None, TaskParams::new())
    }

    fn published(broker: &InMemoryBroker, queue: &str) -> Vec<TaskMessage> {
        broker
            .peek(queue)
            .iter()
            .map(|body| TaskMessage::decode(body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_success_marks_task_and_acks() {
        let executor = Flaky::new(0, ExecutionError::failed("unused"));
        let f = fixture(executor.clone()).await;
        let message = submitted(&f.store).await;

        let disposition = f.orchestrator.process(message.clone()).await.unwrap();
        assert_eq!(disposition, Disposition::Ack);

        let record = f.store.fetch(&message.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(record.retry_count, 0);
        assert_eq!(
            record.output.unwrap().location,
            format!("/out/{}.json", message.id)
        );
        assert!(record.started_at.is_some());
        assert_eq!(f.broker.ready_count("tasks"), 0);
        assert_eq!(f.orchestrator.stats().succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_failure_republishes_after_backoff() {
        let executor = Flaky::new(1, ExecutionError::failed("kernel died"));
        let f = fixture(executor).await;
        let message = submitted(&f.store).await;

        let started = Instant::now();
        let disposition = f.orchestrator.process(message.clone()).await.unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        let record = f.store.fetch(&message.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Started);
        assert_eq!(record.retry_count, 1);

        let retried = published(&f.broker, "tasks");
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].id, message.id);
        assert_eq!(retried[0].retry, 1);
        assert_eq!(f.broker.ready_count("tasks.dlq"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_dead_letter_original_message() {
        let executor = Flaky::new(u32::MAX, ExecutionError::failed("disk full"));
        let f = fixture(executor).await;
        let message = submitted(&f.store).await;
        f.store.increment_retry(&message.id).await.unwrap();
        f.store.increment_retry(&message.id).await.unwrap();
        let last_delivery = message.with_retry(2);

        let disposition = f.orchestrator.process(last_delivery.clone()).await.unwrap();
        assert_eq!(disposition, Disposition::Ack);

        let record = f.store.fetch(&message.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failure);
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.error.as_deref(), Some("disk full"));

        assert_eq!(published(&f.broker, "tasks.dlq"), vec![last_delivery]);
        assert_eq!(f.broker.ready_count("tasks"), 0);
        assert_eq!(f.orchestrator.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_retries() {
        let executor = Flaky::new(u32::MAX, ExecutionError::fatal("unknown notebook"));
        let f = fixture(executor.clone()).await;
        let message = submitted(&f.store).await;

        f.orchestrator.process(message.clone()).await.unwrap();

        let record = f.store.fetch(&message.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failure);
        assert_eq!(record.retry_count, 1);
        assert_eq!(executor.calls(), 1);
        assert_eq!(published(&f.broker, "tasks.dlq"), vec![message]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        struct Hanging;

        #[async_trait]
        impl Executor for Hanging {
            async fn execute(
                &self,
                _request: &ExecutionRequest,
            ) -> Result<OutputDescriptor, ExecutionError> {
                std::future::pending().await
            }
        }

        let f = fixture(Arc::new(Hanging)).await;
        let message = submitted(&f.store).await;

        let started = Instant::now();
        f.orchestrator.process(message.clone()).await.unwrap();

        // 10s timeout + 30s grace, then a 2s backoff
        assert_eq!(started.elapsed(), Duration::from_secs(42));
        let record = f.store.fetch(&message.id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(published(&f.broker, "tasks")[0].retry, 1);
    }

    #[tokio::test]
    async fn test_finished_task_is_not_run_again() {
        let executor = Flaky::new(0, ExecutionError::failed("unused"));
        let f = fixture(executor.clone()).await;
        let message = submitted(&f.store).await;

        f.orchestrator.process(message.clone()).await.unwrap();
        let disposition = f.orchestrator.process(message.clone()).await.unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(executor.calls(), 1);
        assert_eq!(f.orchestrator.stats().duplicates_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_delivery_is_not_run() {
        let executor = Flaky::new(u32::MAX, ExecutionError::failed("kernel died"));
        let f = fixture(executor.clone()).await;
        let message = submitted(&f.store).await;

        // First attempt failed and its retry was published, but the ack was lost.
        f.orchestrator.process(message.clone()).await.unwrap();
        assert_eq!(executor.calls(), 1);

        let disposition = f.orchestrator.process(message.clone()).await.unwrap();

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(executor.calls(), 1);
        assert_eq!(f.orchestrator.stats().duplicates_skipped, 1);
        let record = f.store.fetch(&message.id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(published(&f.broker, "tasks").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_delivery_of_running_task_is_skipped() {
        struct Slow(AtomicU32);

        #[async_trait]
        impl Executor for Slow {
            async fn execute(
                &self,
                request: &ExecutionRequest,
            ) -> Result<OutputDescriptor, ExecutionError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(OutputDescriptor::new("json", format!("/out/{}.json", request.task_id)))
            }
        }

        let executor = Arc::new(Slow(AtomicU32::new(0)));
        let f = fixture(executor.clone()).await;
        let message = submitted(&f.store).await;

        let (first, second) = tokio::join!(
            f.orchestrator.process(message.clone()),
            f.orchestrator.process(message.clone())
        );

        assert_eq!(first.unwrap(), Disposition::Ack);
        assert_eq!(second.unwrap(), Disposition::Ack);
        assert_eq!(executor.0.load(Ordering::SeqCst), 1);
        assert_eq!(f.orchestrator.stats().duplicates_skipped, 1);
        assert_eq!(f.orchestrator.stats().succeeded, 1);

        // The claim is released once the execution settles.
        let record = f.store.fetch(&message.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert!(f.orchestrator.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_is_an_error() {
        let executor = Flaky::new(0, ExecutionError::failed("unused"));
        let f = fixture(executor.clone()).await;
        let message = TaskMessage::new(Uuid::new_v4(), "report", None, TaskParams::new());

        let err = f.orchestrator.process(message).await.unwrap_err();

        assert!(matches!(err, RelayError::TaskNotFound { .. }));
        assert_eq!(executor.calls(), 0);
        assert!(f.store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_retry_publish_finalises_task() {
        let executor = Flaky::new(1, ExecutionError::failed("kernel died"));
        let f = fixture(executor).await;
        let message = submitted(&f.store).await;

        f.broker.nack_next_publishes(1);
        f.orchestrator.process(message.clone()).await.unwrap();

        let record = f.store.fetch(&message.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failure);
        assert!(record.error.unwrap().contains("negatively acknowledged"));
        assert_eq!(published(&f.broker, "tasks.dlq"), vec![message]);
    }
}
