//! Broker connection management.
//!
//! [`ConnectionManager`] owns the one logical connection a process keeps to
//! the broker. Publisher and consumer get their channels through it; a dead
//! connection is rebuilt on the next acquisition, retrying transient faults
//! with exponential backoff.

use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector, ChannelMode};
use crate::error::{RelayError, RelayResult};
use crate::utils::reconnect_delay;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Upper bound on the wait between reconnection attempts
pub const RECONNECT_DELAY_CAP: Duration = Duration::from_secs(30);

/// Owns the shared broker connection.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager; nothing is connected until the first acquisition
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            connection: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Return the cached connection if it is open, otherwise establish a
    /// new one.
    ///
    /// Concurrent callers share a single establishment. Transient failures
    /// are retried indefinitely, waiting `min(2^attempt, 30)` seconds between
    /// attempts; other failures propagate immediately. Fails with
    /// `ShuttingDown` once [`close`](Self::close) has been called.
    pub async fn connection(&self) -> RelayResult<Arc<dyn BrokerConnection>> {
        let mut slot = self.connection.lock().await;

        if let Some(connection) = slot.as_ref() {
            if connection.is_open() {
                return Ok(Arc::clone(connection));
            }
            tracing::warn!("Broker connection lost, reconnecting");
        }
        *slot = None;

        let connection = self.establish().await?;
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Open a channel for `mode` on a live connection.
    ///
    /// A transient failure to open the channel discards the connection and
    /// retries with the same backoff as establishment.
    pub async fn acquire(&self, mode: ChannelMode) -> RelayResult<Box<dyn BrokerChannel>> {
        let mut attempt = 0u32;

        loop {
            let connection = self.connection().await?;

            match connection.open_channel(mode).await {
                Ok(channel) => {
                    tracing::debug!("Opened broker channel ({:?})", mode);
                    return Ok(channel);
                }
                Err(e) if e.is_transient() => {
                    let delay = reconnect_delay(attempt, RECONNECT_DELAY_CAP);
                    tracing::warn!("Failed to open channel: {}. Retrying in {:?}", e, delay);
                    self.invalidate(&connection).await;
                    self.pause(delay).await?;
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether a connection is currently established and open
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|connection| connection.is_open())
    }

    /// Stop reconnecting and close the connection, if any.
    pub async fn close(&self) -> RelayResult<()> {
        self.shutdown.cancel();

        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await?;
            tracing::info!("Broker connection closed");
        }
        Ok(())
    }

    async fn establish(&self) -> RelayResult<Arc<dyn BrokerConnection>> {
        let mut attempt = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(RelayError::ShuttingDown),
                result = self.connector.connect() => result,
            };

            match result {
                Ok(connection) => {
                    if attempt > 0 {
                        tracing::info!("Reconnected to broker after {} failed attempts", attempt);
                    } else {
                        tracing::info!("Connected to broker");
                    }
                    return Ok(connection);
                }
                Err(e) if e.is_transient() => {
                    let delay = reconnect_delay(attempt, RECONNECT_DELAY_CAP);
                    tracing::warn!(
                        "Broker connection attempt {} failed: {}. Retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    self.pause(delay).await?;
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    tracing::error!("Broker connection failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Drop the cached connection if it is still `stale`
    async fn invalidate(&self, stale: &Arc<dyn BrokerConnection>) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *slot = None;
        }
    }

    async fn pause(&self, delay: Duration) -> RelayResult<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RelayError::ShuttingDown),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Close `channel` if it is still open, logging instead of failing
pub(crate) async fn close_quietly(channel: &dyn BrokerChannel) {
    if channel.is_open() {
        if let Err(e) = channel.close().await {
            tracing::debug!("Ignoring error while closing channel: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use tokio::time::Instant;

    fn manager(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(Arc::new(broker.clone())))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backs_off_exponentially() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(3);
        let manager = manager(&broker);

        let started = Instant::now();
        manager.connection().await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(1 + 2 + 4));
        assert_eq!(broker.connect_attempts(), 4);
        assert!(manager.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failure_is_not_retried() {
        let broker = InMemoryBroker::new();
        broker.refuse_authentication(true);
        let manager = manager(&broker);

        let started = Instant::now();
        let err = manager.connection().await.err().unwrap();

        assert!(matches!(err, RelayError::Authentication { .. }));
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_healthy_connection_is_reused_and_dead_one_replaced() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        manager.connection().await.unwrap();
        manager.acquire(ChannelMode::Consume { prefetch: 1 }).await.unwrap();
        manager.connection().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);

        broker.drop_connections();
        assert!(!manager.is_connected().await);

        let channel = manager
            .acquire(ChannelMode::Publish { confirms: true })
            .await
            .unwrap();
        assert!(channel.is_open());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_establishment() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        let manager = manager(&broker);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager
                        .acquire(ChannelMode::Publish { confirms: true })
                        .await
                        .map(|_| ())
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_reconnect_loop() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(u32::MAX);
        let manager = manager(&broker);

        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connection().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_secs(20)).await;
        manager.close().await.unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(RelayError::ShuttingDown)));
        assert!(matches!(
            manager.connection().await.map(|_| ()),
            Err(RelayError::ShuttingDown)
        ));
    }
}
