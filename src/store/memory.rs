//! In-memory task store.
//!
//! Rows live in a map behind an async-friendly lock; every operation takes
//! the write lock for its whole read-modify-write, which makes it atomic per
//! row. Nothing survives a restart.

use super::TaskStore;
use crate::error::{RelayError, RelayResult};
use crate::task::{OutputDescriptor, TaskId, TaskParams, TaskRecord, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory task store backend
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
}

impl InMemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether the store holds no rows
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    async fn update<T>(
        &self,
        task_id: &TaskId,
        apply: impl FnOnce(&mut TaskRecord) -> T + Send,
    ) -> RelayResult<T> {
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .get_mut(task_id)
            .ok_or(RelayError::TaskNotFound { task_id: *task_id })?;
        Ok(apply(record))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(
        &self,
        task_id: TaskId,
        task_type: &str,
        version: Option<&str>,
        params: &TaskParams,
    ) -> RelayResult<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task_id) {
            return Err(RelayError::DuplicateTask { task_id });
        }

        let record = TaskRecord::pending(
            task_id,
            task_type,
            version.map(str::to_string),
            params.clone(),
        );
        tasks.insert(task_id, record.clone());
        Ok(record)
    }

    async fn mark_started(&self, task_id: &TaskId) -> RelayResult<()> {
        self.update(task_id, |record| {
            record.status = TaskStatus::Started;
            record.started_at = Some(Utc::now());
        })
        .await
    }

    async fn mark_success(&self, task_id: &TaskId, output: &OutputDescriptor) -> RelayResult<()> {
        let output = output.clone();
        self.update(task_id, move |record| {
            let now = Utc::now();
            record.status = TaskStatus::Success;
            record.started_at.get_or_insert(now);
            record.finished_at = Some(now);
            record.output = Some(output);
            record.error = None;
        })
        .await
    }

    async fn mark_failure(&self, task_id: &TaskId, error: &str) -> RelayResult<()> {
        let error = error.to_string();
        self.update(task_id, move |record| {
            let now = Utc::now();
            record.status = TaskStatus::Failure;
            record.started_at.get_or_insert(now);
            record.finished_at = Some(now);
            record.output = None;
            record.error = Some(error);
        })
        .await
    }

    async fn increment_retry(&self, task_id: &TaskId) -> RelayResult<u32> {
        self.update(task_id, |record| {
            record.retry_count = record.retry_count.saturating_add(1);
            record.retry_count
        })
        .await
    }

    async fn current_retry(&self, task_id: &TaskId) -> RelayResult<u32> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|record| record.retry_count)
            .ok_or(RelayError::TaskNotFound { task_id: *task_id })
    }

    async fn fetch(&self, task_id: &TaskId) -> RelayResult<Option<TaskRecord>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> RelayResult<Vec<TaskRecord>> {
        let tasks = self.tasks.read().await;
        let mut records: Vec<TaskRecord> = tasks.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn health_check(&self) -> RelayResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn params() -> TaskParams {
        let mut params = TaskParams::new();
        params.insert("region".into(), json!("emea"));
        params
    }

    #[tokio::test]
    async fn test_insert_creates_pending_row() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();

        let record = store
            .insert(id, "sales_report", Some("2"), &params())
            .await
            .unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 0);

        let fetched = store.fetch(&id).await.unwrap().unwrap();
        assert_eq!(fetched.task_type, "sales_report");
        assert_eq!(fetched.version.as_deref(), Some("2"));
        assert_eq!(fetched.params, params());
        assert!(fetched.started_at.is_none());

        let err = store
            .insert(id, "sales_report", None, &params())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DuplicateTask { .. }));
    }

    #[tokio::test]
    async fn test_terminal_transitions_keep_output_and_error_exclusive() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();
        store.insert(id, "export", None, &params()).await.unwrap();

        store.mark_started(&id).await.unwrap();
        store.mark_failure(&id, "boom").await.unwrap();
        let failed = store.fetch(&id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failure);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.output.is_none());
        assert!(failed.started_at <= failed.finished_at);

        store.mark_started(&id).await.unwrap();
        store
            .mark_success(&id, &OutputDescriptor::new("json", "/out/x.json"))
            .await
            .unwrap();
        let done = store.fetch(&id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert!(done.error.is_none());
        assert_eq!(done.output.unwrap().location, "/out/x.json");
    }

    #[tokio::test]
    async fn test_missing_rows() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();

        assert!(store.fetch(&id).await.unwrap().is_none());
        assert!(matches!(
            store.mark_started(&id).await,
            Err(RelayError::TaskNotFound { .. })
        ));
        assert!(matches!(
            store.increment_retry(&id).await,
            Err(RelayError::TaskNotFound { .. })
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_atomic() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();
        store.insert(id, "export", None, &params()).await.unwrap();

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_retry(&id).await.unwrap() })
            })
            .collect();

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();

        assert_eq!(seen, (1..=64).collect::<Vec<u32>>());
        assert_eq!(store.current_retry(&id).await.unwrap(), 64);
    }

    #[tokio::test]
    async fn test_list_recent_is_newest_first() {
        let store = InMemoryTaskStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = Uuid::new_v4();
            store.insert(id, "export", None, &params()).await.unwrap();
            ids.push(id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let recent = store.list_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, ids[2]);
        assert_eq!(recent[1].id, ids[1]);
    }
}
