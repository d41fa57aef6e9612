//! Task records, the wire envelope and submission types.

use crate::error::{RelayError, RelayResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Ordered parameter mapping handed to the executor
pub type TaskParams = serde_json::Map<String, serde_json::Value>;

/// Status of a task in the task store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Submitted, waiting for a worker
    Pending,
    /// A delivery of the task is being executed
    Started,
    /// Finished with an output descriptor
    Success,
    /// Finished with an error, no further retries
    Failure,
}

impl TaskStatus {
    /// Whether no further transition will happen
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// Persisted representation
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "STARTED" => Ok(TaskStatus::Started),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILURE" => Ok(TaskStatus::Failure),
            other => Err(RelayError::config(format!("unknown task status '{other}'"))),
        }
    }
}

/// Where a successful execution left its output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    /// Type tag of the artifact (e.g. `json`, `excel`)
    pub output_type: String,
    /// Location of the artifact
    pub location: String,
}

impl OutputDescriptor {
    /// Create a new output descriptor
    pub fn new(output_type: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            output_type: output_type.into(),
            location: location.into(),
        }
    }
}

/// Persisted state of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task identifier
    pub id: TaskId,
    /// Task type name
    pub task_type: String,
    /// Optional version selector
    pub version: Option<String>,
    /// Parameters as submitted
    pub params: TaskParams,
    /// Current status
    pub status: TaskStatus,
    /// Number of failed delivery attempts so far
    pub retry_count: u32,
    /// When the task was submitted
    pub created_at: DateTime<Utc>,
    /// When the latest delivery started executing
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Set only on success
    pub output: Option<OutputDescriptor>,
    /// Set only on failure
    pub error: Option<String>,
}

impl TaskRecord {
    /// A fresh PENDING record
    pub fn pending(
        id: TaskId,
        task_type: impl Into<String>,
        version: Option<String>,
        params: TaskParams,
    ) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            version,
            params,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }
}

/// Wire envelope exchanged between publisher and consumer.
///
/// Encoded as JSON `{"id", "type", "version", "params", "retry"}`.
/// `id` and `type` are mandatory; the rest default when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task identity
    pub id: TaskId,
    /// Task type name
    #[serde(rename = "type")]
    pub task_type: String,
    /// Optional version selector
    #[serde(default)]
    pub version: Option<String>,
    /// Parameters for the executor
    #[serde(default)]
    pub params: TaskParams,
    /// Failed attempts preceding this delivery
    #[serde(default)]
    pub retry: u32,
}

impl TaskMessage {
    /// First delivery of a task
    pub fn new(
        id: TaskId,
        task_type: impl Into<String>,
        version: Option<String>,
        params: TaskParams,
    ) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            version,
            params,
            retry: 0,
        }
    }

    /// Same task, carrying a new retry counter
    pub fn with_retry(&self, retry: u32) -> Self {
        Self {
            retry,
            ..self.clone()
        }
    }

    /// Serialize for publishing
    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a received body; any failure is a structural fault.
    pub fn decode(body: &[u8]) -> RelayResult<Self> {
        let message: TaskMessage =
            serde_json::from_slice(body).map_err(|e| RelayError::MalformedMessage {
                reason: e.to_string(),
            })?;

        if message.task_type.trim().is_empty() {
            return Err(RelayError::MalformedMessage {
                reason: "empty task type".to_string(),
            });
        }

        Ok(message)
    }
}

impl From<&TaskRecord> for TaskMessage {
    fn from(record: &TaskRecord) -> Self {
        TaskMessage {
            id: record.id,
            task_type: record.task_type.clone(),
            version: record.version.clone(),
            params: record.params.clone(),
            retry: record.retry_count,
        }
    }
}

/// A task submission before an identity is assigned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task type name
    pub task_type: String,
    /// Optional version selector
    pub version: Option<String>,
    /// Parameters for the executor
    pub params: TaskParams,
}

impl TaskRequest {
    /// Create a request with no version selector
    pub fn new(task_type: impl Into<String>, params: TaskParams) -> Self {
        Self {
            task_type: task_type.into(),
            version: None,
            params,
        }
    }

    /// Pin a version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> TaskParams {
        let mut params = TaskParams::new();
        params.insert("year".into(), json!(2024));
        params.insert("branch".into(), json!("north"));
        params
    }

    #[test]
    fn test_envelope_field_names() {
        let id = Uuid::new_v4();
        let message = TaskMessage::new(id, "sales_report", Some("3".into()), params());
        let value: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();

        assert_eq!(value["id"], json!(id.to_string()));
        assert_eq!(value["type"], json!("sales_report"));
        assert_eq!(value["version"], json!("3"));
        assert_eq!(value["retry"], json!(0));
        assert_eq!(value["params"]["branch"], json!("north"));
    }

    #[test]
    fn test_params_keep_insertion_order() {
        let message = TaskMessage::new(Uuid::new_v4(), "t", None, params());
        let decoded = TaskMessage::decode(&message.encode().unwrap()).unwrap();
        let keys: Vec<_> = decoded.params.keys().cloned().collect();
        assert_eq!(keys, vec!["year", "branch"]);
    }

    #[test]
    fn test_decode_defaults_optional_fields() {
        let id = Uuid::new_v4();
        let body = format!(r#"{{"id":"{id}","type":"cleanup"}}"#);
        let message = TaskMessage::decode(body.as_bytes()).unwrap();

        assert_eq!(message.id, id);
        assert_eq!(message.version, None);
        assert!(message.params.is_empty());
        assert_eq!(message.retry, 0);
    }

    #[test]
    fn test_decode_rejects_malformed_envelopes() {
        let missing_type = format!(r#"{{"id":"{}"}}"#, Uuid::new_v4());
        let blank_type = format!(r#"{{"id":"{}","type":"  "}}"#, Uuid::new_v4());

        for body in [
            b"not json".to_vec(),
            br#"{"type":"cleanup"}"#.to_vec(),
            br#"{"id":"not-a-uuid","type":"cleanup"}"#.to_vec(),
            missing_type.into_bytes(),
            blank_type.into_bytes(),
        ] {
            let err = TaskMessage::decode(&body).unwrap_err();
            assert!(matches!(err, RelayError::MalformedMessage { .. }));
        }
    }

    #[test]
    fn test_with_retry_keeps_identity() {
        let message = TaskMessage::new(Uuid::new_v4(), "t", None, params());
        let retried = message.with_retry(2);
        assert_eq!(retried.id, message.id);
        assert_eq!(retried.params, message.params);
        assert_eq!(retried.retry, 2);
    }

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Started,
            TaskStatus::Success,
            TaskStatus::Failure,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Failure.is_terminal());
        assert!(!TaskStatus::Started.is_terminal());
    }
}
