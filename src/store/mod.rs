//! Task store backends for relayq.
//!
//! The task store is the persisted record of every task and the only source
//! of truth for status queries. Two backends are provided:
//! - **In-Memory**: process-local, for development and tests
//! - **PostgreSQL**: durable rows with atomic updates (requires `postgres-store`)
//!
//! # Examples
//!
//! ```rust,no_run
//! use relayq::prelude::*;
//! use std::sync::Arc;
//!
//! // In-memory store (default)
//! let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
//!
//! // PostgreSQL store (requires postgres-store feature)
//! # #[cfg(feature = "postgres-store")]
//! # async fn connect() -> RelayResult<()> {
//! let store = relayq::store::PostgresTaskStore::connect(&StoreConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::RelayResult;
use crate::task::{OutputDescriptor, TaskId, TaskParams, TaskRecord};
use async_trait::async_trait;

pub mod memory;
pub use memory::InMemoryTaskStore;

#[cfg(feature = "postgres-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
pub mod postgres;

#[cfg(feature = "postgres-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
pub use postgres::PostgresTaskStore;

/// Trait that all task store backends must implement.
///
/// Every mutating operation is atomic with respect to a single task row.
/// Operations on a missing row fail with
/// [`RelayError::TaskNotFound`](crate::error::RelayError::TaskNotFound).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a PENDING row.
    ///
    /// Fails with `DuplicateTask` if the id is already taken.
    async fn insert(
        &self,
        task_id: TaskId,
        task_type: &str,
        version: Option<&str>,
        params: &TaskParams,
    ) -> RelayResult<TaskRecord>;

    /// Move to STARTED and stamp `started_at`
    async fn mark_started(&self, task_id: &TaskId) -> RelayResult<()>;

    /// Move to SUCCESS with the output descriptor, clearing any error
    async fn mark_success(&self, task_id: &TaskId, output: &OutputDescriptor) -> RelayResult<()>;

    /// Move to FAILURE with the error text, clearing any output
    async fn mark_failure(&self, task_id: &TaskId, error: &str) -> RelayResult<()>;

    /// Atomically add one to the retry count and return the new value
    async fn increment_retry(&self, task_id: &TaskId) -> RelayResult<u32>;

    /// Current retry count
    async fn current_retry(&self, task_id: &TaskId) -> RelayResult<u32>;

    /// Fetch a row, `None` if it does not exist
    async fn fetch(&self, task_id: &TaskId) -> RelayResult<Option<TaskRecord>>;

    /// Most recently created rows, newest first
    async fn list_recent(&self, limit: usize) -> RelayResult<Vec<TaskRecord>>;

    /// Health check for the store backend
    async fn health_check(&self) -> RelayResult<()>;
}
