//! Submission and status lookup.

use crate::config::QueueKind;
use crate::core::publisher::Publisher;
use crate::error::{RelayError, RelayResult};
use crate::store::TaskStore;
use crate::task::{TaskId, TaskMessage, TaskRecord, TaskRequest};
use std::sync::Arc;
use uuid::Uuid;

/// Caller-facing handle for submitting tasks and reading their status.
///
/// Cheap to clone; clones share the publisher and the store.
#[derive(Clone)]
pub struct TaskClient {
    store: Arc<dyn TaskStore>,
    publisher: Arc<Publisher>,
}

impl TaskClient {
    /// Create a client over an existing publisher and store
    pub fn new(store: Arc<dyn TaskStore>, publisher: Arc<Publisher>) -> Self {
        Self { store, publisher }
    }

    /// Submit one task.
    ///
    /// The PENDING row is written before the message is published, so a
    /// worker never receives a task it cannot find. If the broker drops the
    /// publish the row is marked FAILURE and `PublishRejected` is returned.
    pub async fn submit(&self, request: TaskRequest) -> RelayResult<TaskId> {
        let task_id = Uuid::new_v4();
        let record = self
            .store
            .insert(
                task_id,
                &request.task_type,
                request.version.as_deref(),
                &request.params,
            )
            .await?;

        let message = TaskMessage::from(&record);
        let outcome = self.publisher.publish(&message, QueueKind::Work).await?;

        if !outcome.is_confirmed() {
            let reason = format!("submission was {}", outcome.as_str());
            self.store.mark_failure(&task_id, &reason).await?;
            return Err(RelayError::PublishRejected {
                queue: self.publisher.queues().work_queue.clone(),
                reason,
            });
        }

        tracing::info!(
            task_id = %task_id,
            task_type = %request.task_type,
            "Task submitted"
        );
        Ok(task_id)
    }

    /// Submit several tasks, stopping at the first failure.
    ///
    /// Tasks submitted before the failure stay submitted.
    pub async fn submit_batch(
        &self,
        requests: impl IntoIterator<Item = TaskRequest>,
    ) -> RelayResult<Vec<TaskId>> {
        let mut ids = Vec::new();
        for request in requests {
            ids.push(self.submit(request).await?);
        }
        Ok(ids)
    }

    /// Current record of a task, `None` if it was never submitted
    pub async fn status(&self, task_id: &TaskId) -> RelayResult<Option<TaskRecord>> {
        self.store.fetch(task_id).await
    }

    /// Most recently submitted tasks, newest first
    pub async fn recent(&self, limit: usize) -> RelayResult<Vec<TaskRecord>> {
        self.store.list_recent(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::QueueConfig;
    use crate::core::connection::ConnectionManager;
    use crate::store::InMemoryTaskStore;
    use crate::task::{TaskParams, TaskStatus};
    use serde_json::json;

    async fn client(broker: &InMemoryBroker, provision: bool) -> TaskClient {
        let manager = Arc::new(ConnectionManager::new(Arc::new(broker.clone())));
        let publisher = Arc::new(Publisher::new(manager, QueueConfig::default(), true));
        if provision {
            publisher.ensure_queues().await.unwrap();
        }
        TaskClient::new(Arc::new(InMemoryTaskStore::new()), publisher)
    }

    fn params(year: u32) -> TaskParams {
        let mut params = TaskParams::new();
        params.insert("year".to_string(), json!(year));
        params
    }

    #[tokio::test]
    async fn test_submit_persists_then_publishes() {
        let broker = InMemoryBroker::new();
        let client = client(&broker, true).await;

        let request = TaskRequest::new("sales_report", params(2024)).with_version("v2");
        let task_id = client.submit(request).await.unwrap();

        let record = client.status(&task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.version.as_deref(), Some("v2"));

        let queued = broker.peek("tasks");
        assert_eq!(queued.len(), 1);
        let message = TaskMessage::decode(&queued[0]).unwrap();
        assert_eq!(message.id, task_id);
        assert_eq!(message.task_type, "sales_report");
        assert_eq!(message.params["year"], json!(2024));
        assert_eq!(message.retry, 0);
    }

    #[tokio::test]
    async fn test_unroutable_submission_is_marked_failed() {
        let broker = InMemoryBroker::new();
        let client = client(&broker, false).await;

        let err = client
            .submit(TaskRequest::new("sales_report", params(2024)))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::PublishRejected { .. }));

        let recent = client.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, TaskStatus::Failure);
        assert!(recent[0].error.as_deref().unwrap().contains("unroutable"));
    }

    #[tokio::test]
    async fn test_submit_batch_and_unknown_status() {
        let broker = InMemoryBroker::new();
        let client = client(&broker, true).await;

        let ids = client
            .submit_batch((2022..2025).map(|year| TaskRequest::new("sales_report", params(year))))
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        assert_eq!(broker.ready_count("tasks"), 3);
        assert!(client.status(&Uuid::new_v4()).await.unwrap().is_none());
    }
}
