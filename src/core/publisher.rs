//! Queue provisioning and confirmed publishing.

use crate::broker::{BrokerChannel, ChannelMode, Confirmation, PublishProperties, QueueDeclare};
use crate::config::{QueueConfig, QueueKind};
use crate::core::connection::{ConnectionManager, RECONNECT_DELAY_CAP, close_quietly};
use crate::error::{RelayError, RelayResult};
use crate::task::TaskMessage;
use crate::utils::reconnect_delay;
use std::sync::Arc;
use tokio::sync::Mutex;

/// How the broker disposed of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted (confirmed, or sent on a channel without confirms)
    Confirmed,
    /// Mandatory message had no queue to route to; dropped
    Unroutable,
    /// Broker refused the message; dropped
    Nacked,
}

impl PublishOutcome {
    /// Whether the message reached its queue
    pub fn is_confirmed(self) -> bool {
        matches!(self, PublishOutcome::Confirmed)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PublishOutcome::Confirmed => "confirmed",
            PublishOutcome::Unroutable => "unroutable",
            PublishOutcome::Nacked => "negatively acknowledged",
        }
    }
}

/// Publishes task messages to the work and dead-letter queues.
///
/// All publishes share one confirmed channel and go out one at a time.
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    queues: QueueConfig,
    confirms: bool,
    channel: Mutex<Option<Box<dyn BrokerChannel>>>,
}

impl Publisher {
    /// Create a publisher; `confirms` makes every publish wait for the
    /// broker's acknowledgement
    pub fn new(manager: Arc<ConnectionManager>, queues: QueueConfig, confirms: bool) -> Self {
        Self {
            manager,
            queues,
            confirms,
            channel: Mutex::new(None),
        }
    }

    /// Queue names this publisher targets
    pub fn queues(&self) -> &QueueConfig {
        &self.queues
    }

    fn mode(&self) -> ChannelMode {
        ChannelMode::Publish {
            confirms: self.confirms,
        }
    }

    /// Declare the dead-letter queue, then make sure the work queue exists,
    /// creating it with dead-letter routing if it does not.
    ///
    /// An existing work queue is left untouched. Safe to call repeatedly.
    /// Transient faults are retried; anything else propagates.
    pub async fn ensure_queues(&self) -> RelayResult<()> {
        let mut attempt = 0u32;

        loop {
            match self.declare_queues().await {
                Err(e) if e.is_transient() => {
                    let delay = reconnect_delay(attempt, RECONNECT_DELAY_CAP);
                    tracing::warn!("Queue provisioning interrupted: {}. Retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                result => return result,
            }
        }
    }

    async fn declare_queues(&self) -> RelayResult<()> {
        let work = &self.queues.work_queue;
        let dead_letter = &self.queues.dead_letter_queue;

        let channel = self.manager.acquire(self.mode()).await?;
        channel
            .declare_queue(dead_letter, QueueDeclare::durable())
            .await?;

        let checked = channel.declare_queue(work, QueueDeclare::passive()).await;
        close_quietly(channel.as_ref()).await;

        match checked {
            Ok(info) => {
                tracing::debug!(
                    "Work queue {} already exists ({} messages ready)",
                    work,
                    info.message_count
                );
                Ok(())
            }
            Err(RelayError::QueueNotFound { .. }) => {
                // The failed passive declaration closed the channel.
                let channel = self.manager.acquire(self.mode()).await?;
                let declared = channel
                    .declare_queue(
                        work,
                        QueueDeclare::durable().with_dead_letter(dead_letter.clone()),
                    )
                    .await;
                close_quietly(channel.as_ref()).await;
                declared?;

                tracing::info!(
                    "Declared work queue {} with dead-letter queue {}",
                    work,
                    dead_letter
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Publish `message` persistently and mandatorily to `queue`.
    ///
    /// Unroutable and negatively acknowledged publishes are logged and
    /// reported, never retried. A channel failure re-acquires the channel
    /// and sends the same message again, until it lands or fails for a
    /// non-transient reason.
    pub async fn publish(
        &self,
        message: &TaskMessage,
        queue: QueueKind,
    ) -> RelayResult<PublishOutcome> {
        let body = message.encode()?;
        let target = self.queues.name(queue);
        let mut failures = 0u32;

        let mut slot = self.channel.lock().await;
        loop {
            if !slot.as_ref().is_some_and(|channel| channel.is_open()) {
                *slot = Some(self.manager.acquire(self.mode()).await?);
            }
            let Some(channel) = slot.as_ref() else {
                continue;
            };

            let result = channel
                .publish(target, &body, PublishProperties::default())
                .await;

            let outcome = match result {
                Ok(Confirmation::Ack | Confirmation::NotRequested) => PublishOutcome::Confirmed,
                Ok(Confirmation::Returned) => PublishOutcome::Unroutable,
                Ok(Confirmation::Nack) => PublishOutcome::Nacked,
                Err(e) if e.is_transient() => {
                    *slot = None;
                    failures += 1;
                    tracing::warn!(
                        task_id = %message.id,
                        "Publish to {} failed: {}. Re-acquiring channel",
                        target,
                        e
                    );
                    if failures > 1 {
                        tokio::time::sleep(reconnect_delay(failures - 2, RECONNECT_DELAY_CAP))
                            .await;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if outcome.is_confirmed() {
                tracing::debug!(
                    task_id = %message.id,
                    retry = message.retry,
                    "Published to {}",
                    target
                );
            } else {
                tracing::error!(
                    task_id = %message.id,
                    "Publish to {} was {}; message dropped",
                    target,
                    outcome.as_str()
                );
            }
            return Ok(outcome);
        }
    }

    /// Close the shared publishing channel
    pub async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            close_quietly(channel.as_ref()).await;
        }
    }
}
