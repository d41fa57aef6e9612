//! Executor contract and execution budget for relayq.
//!
//! This module provides the seam between the dispatch core and the code that
//! actually performs a task's work.
//!
//! # Overview
//!
//! - [`Executor`] trait: turns a task's parameters into an output descriptor
//! - [`ExecutionError`]: recoverable (`Failed`) or fatal (`Fatal`) domain fault
//! - [`run_with_budget`]: runs an executor under a wall-clock watchdog and
//!   returns a typed [`ExecutionOutcome`]
//! - [`BlockingExecutor`]: adapts synchronous code through `spawn_blocking`
//! - [`ExecutorRegistry`]: dispatches by task type
//!
//! # Examples
//!
//! ```rust
//! use relayq::prelude::*;
//!
//! let registry = ExecutorRegistry::new()
//!     .register(
//!         "sales_report",
//!         BlockingExecutor::new(|request: &ExecutionRequest| {
//!             let year = request.params.get("year").ok_or_else(|| {
//!                 ExecutionError::fatal("missing parameter 'year'")
//!             })?;
//!             Ok(OutputDescriptor::new("json", format!("/reports/{year}.json")))
//!         }),
//!     );
//!
//! assert!(registry.is_registered("sales_report"));
//! ```

use crate::task::{OutputDescriptor, TaskId, TaskMessage, TaskParams};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Everything an executor needs to run one delivery of a task
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Task identity
    pub task_id: TaskId,
    /// Task type name
    pub task_type: String,
    /// Optional version selector
    pub version: Option<String>,
    /// Parameters as submitted
    pub params: TaskParams,
    /// Timeout the executor is expected to honour itself
    pub timeout: Duration,
}

impl ExecutionRequest {
    /// Build the request for a received message
    pub fn from_message(message: &TaskMessage, timeout: Duration) -> Self {
        Self {
            task_id: message.id,
            task_type: message.task_type.clone(),
            version: message.version.clone(),
            params: message.params.clone(),
            timeout,
        }
    }
}

/// Domain failure reported by an executor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Counts toward retries
    #[error("{0}")]
    Failed(String),

    /// Retrying cannot help (bad parameters, unknown task type)
    #[error("{0}")]
    Fatal(String),
}

impl ExecutionError {
    /// Create a recoverable failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Create a fatal failure
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Whether remaining retries should be skipped
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Performs the work of a task.
///
/// Implementations should honour [`ExecutionRequest::timeout`], but the
/// dispatch core does not rely on it: every call runs under
/// [`run_with_budget`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute one delivery of a task
    async fn execute(&self, request: &ExecutionRequest) -> Result<OutputDescriptor, ExecutionError>;
}

/// Result of one budgeted execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Executor returned an output descriptor
    Success(OutputDescriptor),
    /// Failure, timeout or panic; eligible for retry
    Recoverable(String),
    /// Failure that must not be retried
    Fatal(String),
}

impl ExecutionOutcome {
    /// Whether the execution succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Run `executor` on its own task and wait at most `budget`.
///
/// When the budget elapses the task is aborted and the attempt is reported
/// as recoverable, whether or not the executor ever returns. Panics are
/// recoverable too.
pub async fn run_with_budget(
    executor: Arc<dyn Executor>,
    request: ExecutionRequest,
    budget: Duration,
) -> ExecutionOutcome {
    let task_id = request.task_id;
    let mut handle = tokio::spawn(async move { executor.execute(&request).await });

    match timeout(budget, &mut handle).await {
        Ok(Ok(Ok(output))) => ExecutionOutcome::Success(output),
        Ok(Ok(Err(ExecutionError::Failed(message)))) => ExecutionOutcome::Recoverable(message),
        Ok(Ok(Err(ExecutionError::Fatal(message)))) => ExecutionOutcome::Fatal(message),
        Ok(Err(join_error)) => {
            let message = if join_error.is_panic() {
                format!("executor panicked: {}", panic_message(join_error.into_panic()))
            } else {
                "executor was cancelled".to_string()
            };
            tracing::error!(task_id = %task_id, "{}", message);
            ExecutionOutcome::Recoverable(message)
        }
        Err(_) => {
            handle.abort();
            tracing::warn!(task_id = %task_id, "Execution abandoned after {:?}", budget);
            ExecutionOutcome::Recoverable(format!(
                "execution timed out after {}s",
                budget.as_secs_f64()
            ))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Executor built from an async closure
pub struct FnExecutor<F> {
    run: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutputDescriptor, ExecutionError>> + Send + 'static,
{
    /// Wrap `run`; it receives an owned copy of each request
    pub fn new(run: F) -> Self {
        Self { run }
    }
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(ExecutionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutputDescriptor, ExecutionError>> + Send + 'static,
{
    async fn execute(&self, request: &ExecutionRequest) -> Result<OutputDescriptor, ExecutionError> {
        (self.run)(request.clone()).await
    }
}

/// Executor for synchronous, blocking work.
///
/// Each call runs on tokio's blocking pool. A call that outlives its budget
/// keeps its thread until it returns; its result is discarded.
pub struct BlockingExecutor<F> {
    run: Arc<F>,
}

impl<F> BlockingExecutor<F>
where
    F: Fn(&ExecutionRequest) -> Result<OutputDescriptor, ExecutionError> + Send + Sync + 'static,
{
    /// Wrap a blocking function
    pub fn new(run: F) -> Self {
        Self { run: Arc::new(run) }
    }
}

#[async_trait]
impl<F> Executor for BlockingExecutor<F>
where
    F: Fn(&ExecutionRequest) -> Result<OutputDescriptor, ExecutionError> + Send + Sync + 'static,
{
    async fn execute(&self, request: &ExecutionRequest) -> Result<OutputDescriptor, ExecutionError> {
        let run = Arc::clone(&self.run);
        let request = request.clone();

        tokio::task::spawn_blocking(move || run(&request))
            .await
            .map_err(|e| ExecutionError::failed(format!("blocking executor failed: {e}")))?
    }
}

/// Dispatches each request to the executor registered for its task type.
///
/// A request for an unregistered type fails fatally.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `task_type`, replacing any previous one
    pub fn register(self, task_type: impl Into<String>, executor: impl Executor + 'static) -> Self {
        self.register_shared(task_type, Arc::new(executor))
    }

    /// Register an already shared executor
    pub fn register_shared(
        mut self,
        task_type: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let task_type = task_type.into();
        tracing::debug!("Registering executor for task type {}", task_type);
        self.executors.insert(task_type, executor);
        self
    }

    /// Check if a task type is registered
    pub fn is_registered(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    /// All registered task types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl Executor for ExecutorRegistry {
    async fn execute(&self, request: &ExecutionRequest) -> Result<OutputDescriptor, ExecutionError> {
        match self.executors.get(&request.task_type) {
            Some(executor) => executor.execute(request).await,
            None => Err(ExecutionError::fatal(format!(
                "no executor registered for task type '{}'",
                request.task_type
            ))),
        }
    }
}
