//! AMQP 0.9.1 broker backend built on `lapin`.
//!
//! Queues live on the default exchange with the queue name as routing key.
//! Dead-letter routing is configured through queue arguments
//! (`x-dead-letter-exchange = ""`, `x-dead-letter-routing-key = <queue>`),
//! so a reject without requeue lands in the dead-letter queue unchanged.

use super::{
    Acker, BrokerChannel, BrokerConnection, BrokerConnector, ChannelMode, Confirmation, Delivery,
    DeliveryStream, PublishProperties, QueueDeclare, QueueInfo,
};
use crate::config::BrokerConfig;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use uuid::Uuid;

/// Persistent delivery mode
const PERSISTENT: u8 = 2;
/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

/// Connects to an AMQP broker
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
    connection_name: String,
    heartbeat_secs: u16,
}

impl AmqpConnector {
    /// Create a connector for the broker described by `config`
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            url: config.url.clone(),
            connection_name: config.connection_name.clone(),
            heartbeat_secs: config.heartbeat_secs,
        }
    }

    fn uri(&self) -> RelayResult<AMQPUri> {
        let mut uri: AMQPUri = self
            .url
            .parse()
            .map_err(|e| RelayError::config(format!("invalid broker url: {e}")))?;
        if uri.query.heartbeat.is_none() {
            uri.query.heartbeat = Some(self.heartbeat_secs);
        }
        Ok(uri)
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> RelayResult<Arc<dyn BrokerConnection>> {
        let uri = self.uri()?;
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());

        let connection = Connection::connect_uri(uri, properties)
            .await
            .map_err(|e| classify(e, "connect"))?;

        tracing::debug!("AMQP connection {} established", self.connection_name);
        Ok(Arc::new(AmqpConnection {
            connection,
            name: self.connection_name.clone(),
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    name: String,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn open_channel(&self, mode: ChannelMode) -> RelayResult<Box<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| classify(e, "open channel"))?;

        match mode {
            ChannelMode::Publish { confirms: true } => channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| classify(e, "enable confirms"))?,
            ChannelMode::Publish { confirms: false } => {}
            ChannelMode::Consume { prefetch } => channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| classify(e, "set prefetch"))?,
        }

        Ok(Box::new(AmqpChannel {
            channel,
            consumer_prefix: self.name.clone(),
        }))
    }

    async fn close(&self) -> RelayResult<()> {
        if self.is_open() {
            self.connection
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|e| classify(e, "close connection"))?;
        }
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
    consumer_prefix: String,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_queue(&self, queue: &str, declare: QueueDeclare) -> RelayResult<QueueInfo> {
        let mut arguments = FieldTable::default();
        if let Some(dead_letter) = &declare.dead_letter_queue {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(String::new().into()),
            );
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(dead_letter.clone().into()),
            );
        }

        let options = QueueDeclareOptions {
            passive: declare.passive,
            durable: declare.durable,
            ..Default::default()
        };

        let declared = self
            .channel
            .queue_declare(queue, options, arguments)
            .await
            .map_err(|e| classify_queue_error(e, queue))?;

        Ok(QueueInfo {
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: PublishProperties,
    ) -> RelayResult<Confirmation> {
        let mut basic = BasicProperties::default().with_content_type("application/json".into());
        if properties.persistent {
            basic = basic.with_delivery_mode(PERSISTENT);
        }
        let options = BasicPublishOptions {
            mandatory: properties.mandatory,
            ..Default::default()
        };

        let confirm = self
            .channel
            .basic_publish("", queue, options, body, basic)
            .await
            .map_err(|e| classify(e, "publish"))?;

        let confirmation = confirm.await.map_err(|e| classify(e, "publish confirm"))?;
        Ok(match confirmation {
            LapinConfirmation::Ack(Some(_)) => Confirmation::Returned,
            LapinConfirmation::Ack(None) => Confirmation::Ack,
            LapinConfirmation::Nack(_) => Confirmation::Nack,
            LapinConfirmation::NotRequested => Confirmation::NotRequested,
        })
    }

    async fn consume(&self, queue: &str) -> RelayResult<DeliveryStream> {
        let tag = format!("{}-{}", self.consumer_prefix, Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_queue_error(e, queue))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    body: delivery.data,
                    acker: Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }),
                })
                .map_err(|e| classify(e, "consume"))
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> RelayResult<()> {
        if self.is_open() {
            self.channel
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|e| classify(e, "close channel"))?;
        }
        Ok(())
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(self: Box<Self>) -> RelayResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "ack"))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> RelayResult<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "reject"))
    }
}

/// Map a client error onto the relayq fault classes
fn classify(error: lapin::Error, operation: &str) -> RelayError {
    match &error {
        lapin::Error::IOError(_) | lapin::Error::MissingHeartbeatError => {
            RelayError::connection_with(format!("{operation} failed"), error)
        }
        lapin::Error::InvalidConnectionState(_) => {
            RelayError::connection_with(format!("{operation} on a closed connection"), error)
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
            RelayError::channel_closed(format!("{operation}: {error}"))
        }
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => RelayError::Authentication {
                message: amqp.get_message().as_str().to_string(),
            },
            AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED) => {
                RelayError::connection_with(format!("{operation}: connection forced"), error)
            }
            _ => RelayError::Amqp(error),
        },
        _ => RelayError::Amqp(error),
    }
}

fn classify_queue_error(error: lapin::Error, queue: &str) -> RelayError {
    if let lapin::Error::ProtocolError(amqp) = &error {
        match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                return RelayError::QueueNotFound {
                    queue: queue.to_string(),
                };
            }
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                return RelayError::QueueMismatch {
                    queue: queue.to_string(),
                    message: amqp.get_message().as_str().to_string(),
                };
            }
            _ => {}
        }
    }
    classify(error, "declare queue")
}
