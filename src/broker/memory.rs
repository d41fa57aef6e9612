//! In-memory broker implementation for relayq.
//!
//! This backend keeps every queue inside the process using Rust's standard
//! collections. It honours the full broker contract (durable declarations,
//! passive checks, mandatory publishes, confirms, prefetch, dead-letter
//! routing on reject, redelivery of unsettled messages) so the dispatch core
//! behaves exactly as it does against a network broker.
//!
//! # Features
//!
//! - **Fast**: No serialization beyond the message body itself
//! - **Thread-safe**: State behind short, non-async critical sections
//! - **Fault injection**: Connection refusals, authentication failures,
//!   channel resets, negative confirms and connection drops for tests
//! - **Zero dependencies**: No external services required

use super::{
    Acker, BrokerChannel, BrokerConnection, BrokerConnector, ChannelMode, Confirmation, Delivery,
    DeliveryStream, PublishProperties, QueueDeclare, QueueInfo,
};
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// In-memory broker backend implementation
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// Declared queues by name
    queues: Mutex<HashMap<String, QueueState>>,
    /// Pending injected faults
    faults: Mutex<Faults>,
    /// Bumped by `drop_connections`; older connections are dead
    generation: AtomicU64,
    /// Last delivery tag handed out
    next_tag: AtomicU64,
    /// Number of `connect` calls, successful or not
    connect_attempts: AtomicU64,
    /// Woken on every publish, settle and close
    wake: Notify,
}

#[derive(Debug, Default)]
struct Faults {
    connect_failures: u32,
    refuse_authentication: bool,
    channel_failures: u32,
    nacks: u32,
}

#[derive(Debug)]
struct QueueState {
    declare: QueueDeclare,
    ready: VecDeque<StoredMessage>,
    unacked: usize,
    consumers: u32,
}

impl QueueState {
    fn new(declare: QueueDeclare) -> Self {
        Self {
            declare,
            ready: VecDeque::new(),
            unacked: 0,
            consumers: 0,
        }
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers,
        }
    }

    fn accepts(&self, declare: &QueueDeclare) -> bool {
        self.declare.durable == declare.durable
            && self.declare.dead_letter_queue == declare.dead_letter_queue
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBroker {
    /// Create a new, empty in-memory broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `queue` has been declared
    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.state.queues).contains_key(queue)
    }

    /// Names of all declared queues
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state.queues).keys().cloned().collect();
        names.sort();
        names
    }

    /// Arguments `queue` was declared with
    pub fn queue_declaration(&self, queue: &str) -> Option<QueueDeclare> {
        lock(&self.state.queues)
            .get(queue)
            .map(|q| q.declare.clone())
    }

    /// Messages ready for delivery on `queue`
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state.queues)
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet settled messages on `queue`
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state.queues)
            .get(queue)
            .map_or(0, |q| q.unacked)
    }

    /// Copies of the ready message bodies on `queue`, oldest first
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state.queues)
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove and return the ready message bodies on `queue`
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state.queues)
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }

    /// Enqueue a raw body, bypassing channels. Returns false if the queue
    /// does not exist.
    pub fn push_raw(&self, queue: &str, body: impl Into<Vec<u8>>) -> bool {
        let pushed = lock(&self.state.queues)
            .get_mut(queue)
            .map(|q| q.ready.push_back(StoredMessage::fresh(body.into())))
            .is_some();
        if pushed {
            self.state.wake.notify_waiters();
        }
        pushed
    }

    /// Number of connection attempts so far
    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Refuse the next `count` connection attempts as unreachable
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.state.faults).connect_failures = count;
    }

    /// Refuse every connection attempt as an authentication failure
    pub fn refuse_authentication(&self, refuse: bool) {
        lock(&self.state.faults).refuse_authentication = refuse;
    }

    /// Close the channel on the next `count` publishes before they land
    pub fn fail_next_publishes(&self, count: u32) {
        lock(&self.state.faults).channel_failures = count;
    }

    /// Negatively confirm the next `count` publishes
    pub fn nack_next_publishes(&self, count: u32) {
        lock(&self.state.faults).nacks = count;
    }

    /// Kill every open connection; unsettled deliveries become ready again
    /// once their handles are dropped
    pub fn drop_connections(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state.wake.notify_waiters();
        tracing::debug!("In-memory broker dropped all connections");
    }
}

impl StoredMessage {
    fn fresh(body: Vec<u8>) -> Self {
        Self {
            body,
            redelivered: false,
        }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> RelayResult<Arc<dyn BrokerConnection>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        {
            let mut faults = lock(&self.state.faults);
            if faults.refuse_authentication {
                return Err(RelayError::Authentication {
                    message: "ACCESS_REFUSED - login was refused".to_string(),
                });
            }
            if faults.connect_failures > 0 {
                faults.connect_failures -= 1;
                return Err(RelayError::connection("connection refused"));
            }
        }

        let link = Link {
            state: Arc::clone(&self.state),
            generation: self.state.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        };
        Ok(Arc::new(MemoryConnection {
            link: Arc::new(link),
        }))
    }
}

/// Shared by a connection and all of its channels
#[derive(Debug)]
struct Link {
    state: Arc<BrokerState>,
    generation: u64,
    closed: AtomicBool,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.generation == self.state.generation.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct MemoryConnection {
    link: Arc<Link>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    async fn open_channel(&self, mode: ChannelMode) -> RelayResult<Box<dyn BrokerChannel>> {
        if !self.link.is_open() {
            return Err(RelayError::connection("connection is closed"));
        }

        Ok(Box::new(MemoryChannel {
            link: Arc::clone(&self.link),
            mode,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn close(&self) -> RelayResult<()> {
        self.link.closed.store(true, Ordering::SeqCst);
        self.link.state.wake.notify_waiters();
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryChannel {
    link: Arc<Link>,
    mode: ChannelMode,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> RelayResult<()> {
        if channel_open(&self.link, &self.closed) {
            Ok(())
        } else {
            Err(RelayError::channel_closed("channel is closed"))
        }
    }

    /// Channel-level errors close the channel, like a broker would.
    fn fail(&self, error: RelayError) -> RelayError {
        self.closed.store(true, Ordering::SeqCst);
        self.link.state.wake.notify_waiters();
        error
    }
}

fn channel_open(link: &Link, closed: &AtomicBool) -> bool {
    !closed.load(Ordering::SeqCst) && link.is_open()
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        channel_open(&self.link, &self.closed)
    }

    async fn declare_queue(&self, queue: &str, declare: QueueDeclare) -> RelayResult<QueueInfo> {
        self.ensure_open()?;

        let mut queues = lock(&self.link.state.queues);
        let outcome = match queues.get(queue) {
            Some(existing) if declare.passive || existing.accepts(&declare) => Ok(existing.info()),
            Some(existing) => Err(RelayError::QueueMismatch {
                queue: queue.to_string(),
                message: format!(
                    "declared as {:?}, requested {:?}",
                    existing.declare, declare
                ),
            }),
            None if declare.passive => Err(RelayError::QueueNotFound {
                queue: queue.to_string(),
            }),
            None => {
                let state = QueueState::new(QueueDeclare {
                    passive: false,
                    ..declare
                });
                let info = state.info();
                queues.insert(queue.to_string(), state);
                Ok(info)
            }
        };
        drop(queues);

        outcome.map_err(|e| self.fail(e))
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> RelayResult<Confirmation> {
        self.ensure_open()?;

        let confirms = matches!(self.mode, ChannelMode::Publish { confirms: true });
        let nack = {
            let mut faults = lock(&self.link.state.faults);
            if faults.channel_failures > 0 {
                faults.channel_failures -= 1;
                drop(faults);
                return Err(self.fail(RelayError::channel_closed(
                    "connection reset during publish",
                )));
            }
            let nack = faults.nacks > 0;
            if nack {
                faults.nacks -= 1;
            }
            nack
        };

        if nack {
            return Ok(if confirms {
                Confirmation::Nack
            } else {
                Confirmation::NotRequested
            });
        }

        let routed = lock(&self.link.state.queues)
            .get_mut(queue)
            .map(|q| q.ready.push_back(StoredMessage::fresh(body.to_vec())))
            .is_some();

        if routed {
            self.link.state.wake.notify_waiters();
        }

        Ok(match (confirms, routed) {
            (false, _) => Confirmation::NotRequested,
            (true, false) if properties.mandatory => Confirmation::Returned,
            (true, _) => Confirmation::Ack,
        })
    }

    async fn consume(&self, queue: &str) -> RelayResult<DeliveryStream> {
        self.ensure_open()?;

        let prefetch = match self.mode {
            ChannelMode::Consume { prefetch } => prefetch,
            ChannelMode::Publish { .. } => 0,
        };

        let registered = lock(&self.link.state.queues)
            .get_mut(queue)
            .map(|state| state.consumers += 1)
            .is_some();
        if !registered {
            return Err(self.fail(RelayError::QueueNotFound {
                queue: queue.to_string(),
            }));
        }

        let subscription = Subscription {
            link: Arc::clone(&self.link),
            closed: Arc::clone(&self.closed),
            queue: queue.to_string(),
            limiter: (prefetch > 0).then(|| Arc::new(Semaphore::new(prefetch as usize))),
        };

        let stream = futures::stream::unfold(Some(subscription), |subscription| async move {
            let subscription = subscription?;
            let next = subscription.next_delivery().await;
            match next {
                Ok(delivery) => Some((Ok(delivery), Some(subscription))),
                Err(e) => Some((Err(e), None)),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> RelayResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.link.state.wake.notify_waiters();
        Ok(())
    }
}

/// One consumer registration on one queue
struct Subscription {
    link: Arc<Link>,
    closed: Arc<AtomicBool>,
    queue: String,
    limiter: Option<Arc<Semaphore>>,
}

impl Subscription {
    /// Wait for the next ready message. Cancel safe: the message is only
    /// taken off the queue in the same poll that returns it.
    async fn next_delivery(&self) -> RelayResult<Delivery> {
        let state = &self.link.state;
        let mut permit: Option<OwnedSemaphorePermit> = None;

        loop {
            let notified = state.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !channel_open(&self.link, &self.closed) {
                return Err(RelayError::channel_closed(format!(
                    "channel closed while consuming '{}'",
                    self.queue
                )));
            }

            let admitted = match &self.limiter {
                Some(limiter) => {
                    if permit.is_none() {
                        permit = Arc::clone(limiter).try_acquire_owned().ok();
                    }
                    permit.is_some()
                }
                None => true,
            };

            let popped = if admitted {
                let mut queues = lock(&state.queues);
                queues.get_mut(&self.queue).and_then(|q| {
                    let message = q.ready.pop_front()?;
                    q.unacked += 1;
                    Some(message)
                })
            } else {
                None
            };

            if let Some(message) = popped {
                return Ok(Delivery {
                    delivery_tag: state.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
                    redelivered: message.redelivered,
                    body: message.body.clone(),
                    acker: Box::new(MemoryAcker {
                        link: Arc::clone(&self.link),
                        closed: Arc::clone(&self.closed),
                        queue: self.queue.clone(),
                        message: Some(message),
                        permit: permit.take(),
                    }),
                });
            }

            notified.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(q) = lock(&self.link.state.queues).get_mut(&self.queue) {
            q.consumers = q.consumers.saturating_sub(1);
        }
    }
}

enum Settlement {
    Ack,
    Reject { requeue: bool },
}

struct MemoryAcker {
    link: Arc<Link>,
    closed: Arc<AtomicBool>,
    queue: String,
    message: Option<StoredMessage>,
    /// Prefetch slot, released before waking consumers
    permit: Option<OwnedSemaphorePermit>,
}

impl MemoryAcker {
    fn settle(&mut self, settlement: Settlement) -> RelayResult<()> {
        // A settle on a dead channel is lost; Drop puts the message back.
        if !channel_open(&self.link, &self.closed) {
            return Err(RelayError::channel_closed(
                "cannot settle a delivery on a closed channel",
            ));
        }

        let Some(message) = self.message.take() else {
            return Ok(());
        };

        let mut queues = lock(&self.link.state.queues);
        let dead_letter = match queues.get_mut(&self.queue) {
            Some(q) => {
                q.unacked = q.unacked.saturating_sub(1);
                match settlement {
                    Settlement::Ack => None,
                    Settlement::Reject { requeue: true } => {
                        q.ready.push_front(StoredMessage {
                            redelivered: true,
                            ..message
                        });
                        None
                    }
                    Settlement::Reject { requeue: false } => q
                        .declare
                        .dead_letter_queue
                        .clone()
                        .map(|target| (target, message)),
                }
            }
            None => None,
        };

        if let Some((target, message)) = dead_letter {
            match queues.get_mut(&target) {
                Some(dlq) => dlq.ready.push_back(StoredMessage::fresh(message.body)),
                None => tracing::warn!(
                    "Dead-letter target '{}' of '{}' does not exist, message discarded",
                    target,
                    self.queue
                ),
            }
        }
        drop(queues);

        self.permit.take();
        self.link.state.wake.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> RelayResult<()> {
        let mut acker = self;
        acker.settle(Settlement::Ack)
    }

    async fn reject(self: Box<Self>, requeue: bool) -> RelayResult<()> {
        let mut acker = self;
        acker.settle(Settlement::Reject { requeue })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        let Some(message) = self.message.take() else {
            return;
        };

        if let Some(q) = lock(&self.link.state.queues).get_mut(&self.queue) {
            q.unacked = q.unacked.saturating_sub(1);
            q.ready.push_front(StoredMessage {
                redelivered: true,
                ..message
            });
        }
        self.permit.take();
        self.link.state.wake.notify_waiters();
    }
}
