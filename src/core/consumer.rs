//! Consumer / dispatch loop.
//!
//! The [`Consumer`] pulls deliveries from a queue, decodes them and hands
//! each decoded [`TaskMessage`] to a [`MessageHandler`] on its own task. At
//! most `prefetch` handlers run at once. The handler's [`Disposition`]
//! becomes an ack or a reject-to-dead-letter; decode failures, handler
//! errors and handler panics are all rejected.

use crate::broker::{Acker, BrokerChannel, ChannelMode, Delivery, DeliveryStream};
use crate::core::connection::{ConnectionManager, close_quietly};
use crate::error::{RelayError, RelayResult};
use crate::task::TaskMessage;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What to do with a delivery once its handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message; its fate has been taken care of
    Ack,
    /// Send the message to the dead-letter queue
    Reject,
}

/// Callback invoked for every decoded message.
///
/// Returning `Err` (or panicking) is a programming fault: the delivery is
/// rejected to the dead-letter queue and the loop keeps running.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message
    async fn handle(&self, message: TaskMessage) -> RelayResult<Disposition>;
}

/// Counters kept by the dispatch loop
#[derive(Debug, Default)]
pub struct ConsumerStats {
    delivered: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    handler_faults: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerCounts {
    /// Deliveries received
    pub delivered: u64,
    /// Deliveries acknowledged
    pub acked: u64,
    /// Deliveries rejected to the dead-letter queue
    pub rejected: u64,
    /// Deliveries whose envelope could not be decoded
    pub malformed: u64,
    /// Handler errors and panics
    pub handler_faults: u64,
}

impl ConsumerStats {
    /// Current values
    pub fn snapshot(&self) -> ConsumerCounts {
        ConsumerCounts {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
        }
    }
}

/// Pulls deliveries and dispatches them to a handler.
pub struct Consumer {
    manager: Arc<ConnectionManager>,
    prefetch: u16,
    drain_timeout: Option<Duration>,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    /// Create a consumer holding at most `prefetch` unsettled deliveries.
    ///
    /// On cancellation in-flight handlers get `drain_timeout` to finish
    /// (`None` waits for them indefinitely); the rest are aborted and their
    /// deliveries left to the broker for redelivery.
    pub fn new(
        manager: Arc<ConnectionManager>,
        prefetch: u16,
        drain_timeout: Option<Duration>,
    ) -> Self {
        Self {
            manager,
            prefetch: prefetch.max(1),
            drain_timeout,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    /// Dispatch counters
    pub fn stats(&self) -> ConsumerCounts {
        self.stats.snapshot()
    }

    /// Consume `queue` until `cancel` fires or a non-transient error occurs.
    ///
    /// Transient stream failures resubscribe on a fresh channel. After the
    /// loop stops, in-flight handlers are drained before the channel is
    /// released.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> RelayResult<()> {
        tracing::info!("Consuming {} (prefetch {})", queue, self.prefetch);

        let limit = Arc::new(Semaphore::new(self.prefetch as usize));
        let mut in_flight = JoinSet::new();
        let mut channel = None;

        let result = self
            .dispatch_loop(queue, &handler, &cancel, &limit, &mut in_flight, &mut channel)
            .await;

        self.drain(&mut in_flight).await;
        if let Some(channel) = channel {
            close_quietly(channel.as_ref()).await;
        }

        match &result {
            Ok(()) => tracing::info!("Stopped consuming {}", queue),
            Err(e) => tracing::error!("Consumer for {} stopped: {}", queue, e),
        }
        result
    }

    async fn dispatch_loop(
        &self,
        queue: &str,
        handler: &Arc<dyn MessageHandler>,
        cancel: &CancellationToken,
        limit: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
        channel: &mut Option<Box<dyn BrokerChannel>>,
    ) -> RelayResult<()> {
        let mode = ChannelMode::Consume {
            prefetch: self.prefetch,
        };

        'subscribe: loop {
            if let Some(stale) = channel.take() {
                close_quietly(stale.as_ref()).await;
            }

            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                acquired = self.manager.acquire(mode) => acquired,
            };
            let mut deliveries: DeliveryStream = match acquired {
                Ok(fresh) => {
                    let subscribed = fresh.consume(queue).await;
                    *channel = Some(fresh);
                    match subscribed {
                        Ok(deliveries) => deliveries,
                        Err(e) if e.is_transient() => {
                            tracing::warn!("Subscribing to {} failed: {}. Retrying", queue, e);
                            continue 'subscribe;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(RelayError::ShuttingDown) => return Ok(()),
                Err(e) => return Err(e),
            };

            loop {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        log_join(joined);
                        continue;
                    }
                    permit = Arc::clone(limit).acquire_owned() => {
                        permit.map_err(|_| RelayError::ShuttingDown)?
                    }
                };

                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => self.dispatch(delivery, permit, handler, in_flight),
                    Some(Err(e)) if e.is_transient() => {
                        tracing::warn!("Delivery stream for {} interrupted: {}. Resubscribing", queue, e);
                        continue 'subscribe;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        tracing::warn!("Delivery stream for {} ended. Resubscribing", queue);
                        continue 'subscribe;
                    }
                }
            }
        }
    }

    fn dispatch(
        &self,
        delivery: Delivery,
        permit: OwnedSemaphorePermit,
        handler: &Arc<dyn MessageHandler>,
        in_flight: &mut JoinSet<()>,
    ) {
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::clone(&self.stats);
        let Delivery {
            delivery_tag,
            redelivered,
            body,
            acker,
        } = delivery;

        let message = match TaskMessage::decode(&body) {
            Ok(message) => message,
            Err(e) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    delivery_tag,
                    "Rejecting malformed message to the dead-letter queue: {}",
                    e
                );
                in_flight.spawn(async move {
                    let _permit = permit;
                    settle(acker, Disposition::Reject, &stats, delivery_tag).await;
                });
                return;
            }
        };

        if redelivered {
            tracing::debug!(task_id = %message.id, delivery_tag, "Redelivered message");
        }

        let handler = Arc::clone(handler);
        in_flight.spawn(async move {
            let _permit = permit;
            let task_id = message.id;

            let disposition = match AssertUnwindSafe(handler.handle(message))
                .catch_unwind()
                .await
            {
                Ok(Ok(disposition)) => disposition,
                Ok(Err(e)) => {
                    stats.handler_faults.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        task_id = %task_id,
                        "Handler failed: {}. Rejecting to the dead-letter queue",
                        e
                    );
                    Disposition::Reject
                }
                Err(_) => {
                    stats.handler_faults.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        task_id = %task_id,
                        "Handler panicked. Rejecting to the dead-letter queue"
                    );
                    Disposition::Reject
                }
            };

            settle(acker, disposition, &stats, delivery_tag).await;
        });
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        tracing::info!("Waiting for {} in-flight handlers", in_flight.len());

        let wait_all = async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        };

        match self.drain_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, wait_all).await.is_err() {
                    tracing::warn!(
                        "{} handlers still running after {:?}; aborting them",
                        in_flight.len(),
                        limit
                    );
                    in_flight.abort_all();
                    while in_flight.join_next().await.is_some() {}
                }
            }
            None => wait_all.await,
        }
    }
}

async fn settle(
    acker: Box<dyn Acker>,
    disposition: Disposition,
    stats: &ConsumerStats,
    delivery_tag: u64,
) {
    let result = match disposition {
        Disposition::Ack => acker.ack().await,
        Disposition::Reject => acker.reject(false).await,
    };

    match result {
        Ok(()) => {
            let counter = match disposition {
                Disposition::Ack => &stats.acked,
                Disposition::Reject => &stats.rejected,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => tracing::warn!(
            delivery_tag,
            "Failed to settle delivery: {}. The broker will redeliver it",
            e
        ),
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!("Dispatch task panicked: {}", e);
        }
    }
}
