//! AMQP broker (RabbitMQ) adapter built on `lapin`.
//!
//! Producer and consumer each own an independent connection and channel,
//! established lazily on first use. Publishing defaults to a confirm
//! channel: `send` completes only once the broker confirms the message,
//! which is the caller-visible form of transport backpressure on this
//! backend. Queues are asserted (declared-if-absent) at most once per
//! process per logical name; `queue.declare` is idempotent on the broker,
//! so concurrent first assertions are safe.

use crate::backend::QueueBackend;
use crate::config::{AckMode, AmqpConfig, BackendType, QueueOptions};
use crate::error::QueueError;
use crate::message::{
    decode_payload, encode_payload, DeliveredMessage, DeliveryHandle, Payload, QueueName,
};
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashSet;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const BACKEND: &str = "amqp";

/// One role's transport: the connection outlives its channel
struct Transport {
    _connection: Connection,
    channel: Channel,
}

/// AMQP queue backend
pub struct AmqpBackend {
    config: AmqpConfig,
    options: QueueOptions,
    producer: Mutex<Option<Transport>>,
    consumer: Mutex<Option<Transport>>,
    asserted: RwLock<HashSet<QueueName>>,
}

fn connect_err(err: lapin::Error) -> QueueError {
    QueueError::ConnectionFailed {
        message: format!("AMQP connect failed: {}", err),
    }
}

fn channel_err(err: lapin::Error) -> QueueError {
    // Channel-level protocol errors close the channel; treat them as
    // non-transient so a consumer loop ends instead of spinning.
    QueueError::permanent(BACKEND, format!("channel error: {}", err))
}

/// AMQP 404 (NOT_FOUND), raised by passive declares on absent queues
fn is_not_found(err: &lapin::Error) -> bool {
    matches!(err, lapin::Error::ProtocolError(e) if e.get_id() == 404)
}

impl AmqpBackend {
    pub fn new(config: AmqpConfig, options: QueueOptions) -> Result<Self, QueueError> {
        crate::config::validate_endpoint(&config.url, "amqp.url", &["amqp", "amqps"])?;
        Ok(Self {
            config,
            options,
            producer: Mutex::new(None),
            consumer: Mutex::new(None),
            asserted: RwLock::new(HashSet::new()),
        })
    }

    async fn open_transport(&self, confirm: bool, prefetch: bool) -> Result<Transport, QueueError> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(connect_err)?;
        connection.on_error(|err| {
            warn!(error = %err, "AMQP connection interrupted");
        });

        let channel = connection.create_channel().await.map_err(connect_err)?;
        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(connect_err)?;
        }
        if prefetch {
            if let Some(count) = self.config.prefetch {
                channel
                    .basic_qos(count, BasicQosOptions::default())
                    .await
                    .map_err(connect_err)?;
            }
        }
        Ok(Transport {
            _connection: connection,
            channel,
        })
    }

    /// Producer channel, connecting lazily on first use
    async fn producer_channel(&self) -> Result<Channel, QueueError> {
        let mut guard = self.producer.lock().await;
        if let Some(transport) = guard.as_ref() {
            return Ok(transport.channel.clone());
        }
        let transport = self
            .open_transport(self.config.producer_confirm, false)
            .await?;
        let channel = transport.channel.clone();
        *guard = Some(transport);
        Ok(channel)
    }

    /// Consumer channel, connecting lazily on first use
    async fn consumer_channel(&self) -> Result<Channel, QueueError> {
        let mut guard = self.consumer.lock().await;
        if let Some(transport) = guard.as_ref() {
            return Ok(transport.channel.clone());
        }
        let transport = self.open_transport(false, true).await?;
        let channel = transport.channel.clone();
        *guard = Some(transport);
        Ok(channel)
    }

    /// Drop the cached producer transport after a channel error so the
    /// next producer operation reconnects lazily.
    async fn fail_producer(&self, err: lapin::Error) -> QueueError {
        *self.producer.lock().await = None;
        channel_err(err)
    }

    /// Drop the cached consumer transport after a channel error so the
    /// next consumer operation reconnects lazily.
    async fn fail_consumer(&self, err: lapin::Error) -> QueueError {
        *self.consumer.lock().await = None;
        channel_err(err)
    }

    fn declare_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if let Some(ttl) = self.config.message_ttl {
            arguments.insert(
                ShortString::from("x-message-ttl"),
                AMQPValue::LongUInt(ttl),
            );
        }
        if let Some(expires) = self.config.queue_expires {
            arguments.insert(ShortString::from("x-expires"), AMQPValue::LongUInt(expires));
        }
        arguments
    }

    /// Assert the physical queue at most once per process per name.
    /// Declaring an existing queue is success on the broker, so the
    /// double-checked insert tolerates concurrent first assertions.
    /// Declare errors come back raw so the caller can retire its channel.
    async fn assert_queue(&self, channel: &Channel, queue: &QueueName) -> Result<(), lapin::Error> {
        if self.asserted.read().await.contains(queue) {
            return Ok(());
        }
        channel
            .queue_declare(
                queue.as_str(),
                QueueDeclareOptions {
                    durable: self.config.durable,
                    auto_delete: self.config.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                self.declare_arguments(),
            )
            .await?;
        self.asserted.write().await.insert(queue.clone());
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for AmqpBackend {
    async fn connect_producer(&self) -> Result<(), QueueError> {
        self.producer_channel().await.map(|_| ())
    }

    async fn send(&self, queue: &QueueName, payload: &Payload) -> Result<(), QueueError> {
        let channel = self.producer_channel().await?;
        if let Err(err) = self.assert_queue(&channel, queue).await {
            return Err(self.fail_producer(err).await);
        }

        let body = encode_payload(payload)?;
        let publish = channel
            .basic_publish(
                "",
                queue.as_str(),
                BasicPublishOptions::default(),
                body.as_bytes(),
                BasicProperties::default().with_delivery_mode(2), // persistent
            )
            .await;
        let confirm = match publish {
            Ok(confirm) => confirm,
            Err(err) => return Err(self.fail_producer(err).await),
        };

        if self.config.producer_confirm {
            // Broker confirm is this transport's backpressure signal:
            // send does not complete until the message is accepted.
            let confirmation = match confirm.await {
                Ok(confirmation) => confirmation,
                Err(err) => return Err(self.fail_producer(err).await),
            };
            if confirmation.is_nack() {
                return Err(QueueError::permanent(
                    BACKEND,
                    format!("broker nacked publish to '{}'", queue),
                ));
            }
        }
        Ok(())
    }

    async fn disconnect_producer(&self) -> Result<(), QueueError> {
        let mut guard = self.producer.lock().await;
        if let Some(transport) = guard.take() {
            if self.config.producer_confirm {
                transport
                    .channel
                    .wait_for_confirms()
                    .await
                    .map_err(channel_err)?;
            }
        }
        Ok(())
    }

    async fn connect_consumer(
        &self,
        _queue: Option<&QueueName>,
        _group: Option<&str>,
    ) -> Result<(), QueueError> {
        self.consumer_channel().await.map(|_| ())
    }

    async fn fetch(
        &self,
        queue: &QueueName,
        max: usize,
    ) -> Result<Vec<DeliveredMessage>, QueueError> {
        let channel = self.consumer_channel().await?;
        if let Err(err) = self.assert_queue(&channel, queue).await {
            return Err(self.fail_consumer(err).await);
        }

        let no_ack = self.options.ack_mode == AckMode::Auto;
        let mut delivered = Vec::new();
        for _ in 0..max {
            let message = match channel
                .basic_get(queue.as_str(), BasicGetOptions { no_ack })
                .await
            {
                Ok(message) => message,
                Err(err) => return Err(self.fail_consumer(err).await),
            };
            let Some(message) = message else { break };

            let handle = if no_ack {
                DeliveryHandle::None
            } else {
                DeliveryHandle::Amqp {
                    delivery_tag: message.delivery.delivery_tag,
                }
            };
            match decode_payload(&message.delivery.data) {
                Ok(payload) => delivered.push(DeliveredMessage::new(handle, payload)),
                Err(err) => {
                    // Left unacknowledged; redelivered per broker semantics
                    warn!(queue = %queue, error = %err, "skipping undecodable message");
                }
            }
        }

        if delivered.is_empty() {
            tokio::time::sleep(self.options.empty_poll_wait).await;
        }
        Ok(delivered)
    }

    async fn acknowledge(
        &self,
        queue: &QueueName,
        handle: &DeliveryHandle,
    ) -> Result<(), QueueError> {
        let delivery_tag = match handle {
            DeliveryHandle::None => return Ok(()),
            DeliveryHandle::Amqp { delivery_tag } => *delivery_tag,
            other => {
                return Err(QueueError::HandleNotFound {
                    receipt: format!("{:?}", other),
                })
            }
        };
        let channel = self.consumer_channel().await?;
        debug!(queue = %queue, delivery_tag, "acking delivery");
        match channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail_consumer(err).await),
        }
    }

    async fn length(&self, queue: &QueueName) -> Result<u64, QueueError> {
        let channel = self.consumer_channel().await?;
        // Passive declare reports the message count without mutating the
        // queue. An absent queue raises a 404 that closes the channel, so
        // the transport is retired either way and an absent queue counts
        // as empty.
        let declared = channel
            .queue_declare(
                queue.as_str(),
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        match declared {
            Ok(declared) => Ok(u64::from(declared.message_count())),
            Err(err) if is_not_found(&err) => {
                *self.consumer.lock().await = None;
                self.asserted.write().await.remove(queue);
                Ok(0)
            }
            Err(err) => Err(self.fail_consumer(err).await),
        }
    }

    async fn delete_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let channel = self.consumer_channel().await?;
        if let Err(err) = channel
            .queue_delete(queue.as_str(), QueueDeleteOptions::default())
            .await
        {
            return Err(self.fail_consumer(err).await);
        }
        self.asserted.write().await.remove(queue);
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Amqp
    }
}

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;
