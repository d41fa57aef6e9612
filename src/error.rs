//! Error types for relayq operations.

use thiserror::Error;

use crate::task::TaskId;

/// Result type used throughout relayq.
pub type RelayResult<T> = Result<T, RelayError>;

/// Main error type for relayq operations.
///
/// Variants fall into the fault classes the dispatch core distinguishes:
/// transient connectivity faults (retried with backoff by the connection
/// manager), structural faults (never retried) and task-store faults.
/// Use [`RelayError::is_transient`] rather than matching variants by hand.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Broker unreachable or connection dropped
    #[error("Broker connection error: {message}")]
    Connection {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Channel closed underneath an operation
    #[error("Broker channel closed: {message}")]
    ChannelClosed {
        /// Error message
        message: String,
    },

    /// Broker refused the credentials
    #[error("Broker authentication failed: {message}")]
    Authentication {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Settings could not be loaded from the environment
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Passive declaration found no such queue
    #[error("Queue '{queue}' does not exist")]
    QueueNotFound {
        /// Queue name
        queue: String,
    },

    /// Queue exists with arguments different from the requested ones
    #[error("Queue '{queue}' declared with incompatible arguments: {message}")]
    QueueMismatch {
        /// Queue name
        queue: String,
        /// Error message
        message: String,
    },

    /// Envelope could not be decoded
    #[error("Malformed message: {reason}")]
    MalformedMessage {
        /// Why decoding failed
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Broker dropped a publish (unroutable or negatively acknowledged)
    #[error("Publish to '{queue}' was not accepted: {reason}")]
    PublishRejected {
        /// Target queue
        queue: String,
        /// Outcome reported by the broker
        reason: String,
    },

    /// Task row does not exist
    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        /// The missing task
        task_id: TaskId,
    },

    /// Task row already exists
    #[error("Task '{task_id}' already exists")]
    DuplicateTask {
        /// The duplicated task
        task_id: TaskId,
    },

    /// Task store backend error
    #[error("Task store error: {message}")]
    StoreError {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Worker is already running
    #[error("Worker is already running")]
    AlreadyRunning,

    /// Worker is not running
    #[error("Worker is not running")]
    NotRunning,

    /// Operation abandoned because shutdown was requested
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// AMQP client error that could not be classified as a connectivity
    /// or queue fault
    #[cfg(feature = "amqp-broker")]
    #[cfg_attr(docsrs, doc(cfg(feature = "amqp-broker")))]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Database error
    #[cfg(feature = "postgres-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-store")))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RelayError {
    /// Create a new connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new connection error with its cause
    pub fn connection_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a channel-closed error
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a task store error
    pub fn store<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StoreError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the fault is a transient connectivity fault.
    ///
    /// Transient faults are retried (reconnect, reopen channel, resubscribe);
    /// everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ChannelClosed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RelayError::connection("refused").is_transient());
        assert!(RelayError::channel_closed("reset").is_transient());

        assert!(
            !RelayError::Authentication {
                message: "bad password".into()
            }
            .is_transient()
        );
        assert!(
            !RelayError::QueueMismatch {
                queue: "tasks".into(),
                message: "x-dead-letter-routing-key differs".into()
            }
            .is_transient()
        );
        assert!(!RelayError::config("empty queue name").is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = RelayError::QueueNotFound {
            queue: "tasks".into(),
        };
        assert_eq!(err.to_string(), "Queue 'tasks' does not exist");

        let err = RelayError::PublishRejected {
            queue: "tasks.dlq".into(),
            reason: "unroutable".into(),
        };
        assert!(err.to_string().contains("unroutable"));
    }
}
