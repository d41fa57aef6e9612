//! The relayq worker and its dispatch machinery.
//!
//! [`RelayWorker`] wires the connection manager, publisher, consumer and
//! orchestrator together for one worker process and owns their lifecycle.

use crate::broker::BrokerConnector;
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::store::TaskStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod client;
pub mod connection;
pub mod consumer;
pub mod orchestrator;
pub mod publisher;
pub mod registry;

pub use client::TaskClient;
pub use connection::{ConnectionManager, RECONNECT_DELAY_CAP};
pub use consumer::{Consumer, ConsumerCounts, Disposition, MessageHandler};
pub use orchestrator::{OrchestratorCounts, TaskOrchestrator};
pub use publisher::{PublishOutcome, Publisher};
pub use registry::{
    BlockingExecutor, ExecutionError, ExecutionOutcome, ExecutionRequest, Executor,
    ExecutorRegistry, FnExecutor, run_with_budget,
};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters of a running worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Dispatch loop counters
    pub dispatch: ConsumerCounts,
    /// Task outcome counters
    pub tasks: OrchestratorCounts,
}

/// A worker process: consumes the work queue and drives every delivery
/// through the orchestrator.
///
/// A worker runs once. After [`run`](Self::run) returns, its broker
/// connection is closed and clients obtained from it stop publishing.
///
/// # Examples
///
/// ```rust,no_run
/// use relayq::prelude::*;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> RelayResult<()> {
///     let executors = ExecutorRegistry::new().register(
///         "sales_report",
///         BlockingExecutor::new(|request: &ExecutionRequest| {
///             Ok(OutputDescriptor::new("json", format!("/reports/{}.json", request.task_id)))
///         }),
///     );
///
///     let worker = RelayWorker::new(
///         RelayConfig::default(),
///         Arc::new(InMemoryBroker::new()),
///         Arc::new(InMemoryTaskStore::new()),
///         Arc::new(executors),
///     );
///     worker.run_until_signal().await
/// }
/// ```
pub struct RelayWorker {
    config: RelayConfig,
    manager: Arc<ConnectionManager>,
    publisher: Arc<Publisher>,
    consumer: Consumer,
    orchestrator: Arc<TaskOrchestrator>,
    store: Arc<dyn TaskStore>,
    shutdown: CancellationToken,
    is_running: AtomicBool,
}

impl RelayWorker {
    /// Assemble a worker. Nothing touches the broker until [`run`](Self::run).
    pub fn new(
        config: RelayConfig,
        connector: Arc<dyn BrokerConnector>,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let manager = Arc::new(ConnectionManager::new(connector));
        let publisher = Arc::new(Publisher::new(
            Arc::clone(&manager),
            config.queues.clone(),
            config.broker.confirm_publishes,
        ));

        // In-flight deliveries always get their full budget, backoff included.
        let drain_timeout = config
            .worker
            .shutdown_timeout()
            .map(|limit| limit.max(config.worker.delivery_budget()));
        let consumer = Consumer::new(Arc::clone(&manager), config.worker.prefetch, drain_timeout);

        let orchestrator = Arc::new(TaskOrchestrator::new(
            Arc::clone(&store),
            executor,
            Arc::clone(&publisher),
            &config.worker,
        ));

        Self {
            config,
            manager,
            publisher,
            consumer,
            orchestrator,
            store,
            shutdown: CancellationToken::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Client sharing this worker's publisher and store
    pub fn client(&self) -> TaskClient {
        TaskClient::new(Arc::clone(&self.store), Arc::clone(&self.publisher))
    }

    /// Token that stops the worker when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask a running worker to stop accepting deliveries and drain
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Provision the queues and process deliveries until shut down.
    ///
    /// Returns `Ok` after a requested shutdown has drained, or the first
    /// non-transient error (authentication, queue mismatch).
    pub async fn run(&self) -> RelayResult<()> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RelayError::AlreadyRunning);
        }

        tracing::info!(
            "relayq worker starting on {} (dead-letter {}, prefetch {}, max retries {})",
            self.config.queues.work_queue,
            self.config.queues.dead_letter_queue,
            self.config.worker.prefetch,
            self.config.worker.retry.max_retries
        );

        let result = self.serve().await;

        self.publisher.close().await;
        if let Err(e) = self.manager.close().await {
            tracing::warn!("Error while closing broker connection: {}", e);
        }
        self.is_running.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => tracing::info!("relayq worker stopped"),
            Err(e) => tracing::error!("relayq worker failed: {}", e),
        }
        result
    }

    async fn serve(&self) -> RelayResult<()> {
        let provisioned = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(()),
            provisioned = self.publisher.ensure_queues() => provisioned,
        };
        match provisioned {
            Ok(()) => {}
            Err(RelayError::ShuttingDown) => return Ok(()),
            Err(e) => return Err(e),
        }

        let handler = Arc::clone(&self.orchestrator) as Arc<dyn MessageHandler>;
        self.consumer
            .consume(&self.config.queues.work_queue, handler, self.shutdown.clone())
            .await
    }

    /// [`run`](Self::run) until Ctrl-C or SIGTERM, then drain and return
    pub async fn run_until_signal(&self) -> RelayResult<()> {
        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            _ = shutdown_signal() => {
                tracing::info!("Shutdown signal received, draining in-flight tasks");
                self.shutdown();
            }
        }

        run.await
    }

    /// Whether [`run`](Self::run) is in progress
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Dispatch and outcome counters
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            dispatch: self.consumer.stats(),
            tasks: self.orchestrator.stats(),
        }
    }

    /// Check that the broker is reachable and the task store answers.
    pub async fn health_check(&self) -> RelayResult<()> {
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.manager.connection()).await {
            Ok(connection) => {
                connection?;
            }
            Err(_) => {
                return Err(RelayError::connection(format!(
                    "broker not reachable within {:?}",
                    HEALTH_CHECK_TIMEOUT
                )));
            }
        }
        self.store.health_check().await
    }

    /// Configuration this worker was built with
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::store::InMemoryTaskStore;
    use crate::task::{OutputDescriptor, TaskParams, TaskRequest, TaskStatus};

    fn worker(broker: &InMemoryBroker) -> Arc<RelayWorker> {
        let executors = ExecutorRegistry::new().register(
            "report",
            BlockingExecutor::new(|request: &ExecutionRequest| {
                Ok(OutputDescriptor::new("json", format!("/out/{}.json", request.task_id)))
            }),
        );
        Arc::new(RelayWorker::new(
            RelayConfig::testing(),
            Arc::new(broker.clone()),
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(executors),
        ))
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let broker = InMemoryBroker::new();
        let worker = worker(&broker);
        assert!(!worker.is_running());

        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };
        while !broker.queue_exists("test-tasks") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(worker.is_running());
        assert!(matches!(worker.run().await, Err(RelayError::AlreadyRunning)));
        worker.health_check().await.unwrap();

        worker.shutdown();
        running.await.unwrap().unwrap();
        assert!(!worker.is_running());
        assert!(broker.queue_exists("test-tasks.dlq"));
    }

    #[tokio::test]
    async fn test_worker_processes_submitted_task() {
        let broker = InMemoryBroker::new();
        let worker = worker(&broker);
        let client = worker.client();

        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };
        while !broker.queue_exists("test-tasks") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let task_id = client
            .submit(TaskRequest::new("report", TaskParams::new()))
            .await
            .unwrap();
        while worker.stats().dispatch.acked == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let record = client.status(&task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(worker.stats().tasks.succeeded, 1);

        worker.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_mismatch_stops_worker() {
        use crate::broker::{ChannelMode, QueueDeclare};

        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()));
        let channel = manager
            .acquire(ChannelMode::Publish { confirms: true })
            .await
            .unwrap();
        channel
            .declare_queue("test-tasks.dlq", QueueDeclare::durable().with_dead_letter("other"))
            .await
            .unwrap();
        let worker = worker(&broker);

        let err = worker.run().await.unwrap_err();

        assert!(matches!(err, RelayError::QueueMismatch { .. }));
        assert!(!worker.is_running());
        assert!(!broker.queue_exists("test-tasks"));
    }

    #[tokio::test]
    async fn test_authentication_failure_stops_worker() {
        let broker = InMemoryBroker::new();
        broker.refuse_authentication(true);
        let worker = worker(&broker);

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, RelayError::Authentication { .. }));
        assert!(!worker.is_running());
    }
}
