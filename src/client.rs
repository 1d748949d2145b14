//! Client facade: one producer/consumer interface over the configured
//! backend, selected by a configuration-driven factory.

use crate::backend::QueueBackend;
use crate::backends::{AmqpBackend, KafkaBackend, MemoryBackend, RedisBackend, SqsBackend};
use crate::config::{BackendConfig, BackendType, QueueConfig, QueueOptions};
use crate::delivery::{DeliveryLoop, MessageHandler, run_delivery_loop};
use crate::error::QueueError;
use crate::message::{DeliveredMessage, DeliveryHandle, Payload, QueueName};
use std::str::FromStr;
use std::sync::Arc;

/// Entry point: owns the configured backend and hands out producer and
/// consumer facades that share it.
pub struct CloudQueue {
    backend: Arc<dyn QueueBackend>,
    options: QueueOptions,
}

impl CloudQueue {
    /// Build a queue client from configuration. The backend is chosen here,
    /// once, at startup; transports connect lazily on first use.
    pub fn from_config(config: QueueConfig) -> Result<Self, QueueError> {
        let options = config.options.clone();
        let backend: Arc<dyn QueueBackend> = match config.backend {
            BackendConfig::Amqp(c) => Arc::new(AmqpBackend::new(c, options.clone())?),
            BackendConfig::Redis(c) => Arc::new(RedisBackend::new(c, options.clone())?),
            BackendConfig::Kafka(c) => Arc::new(KafkaBackend::new(c, options.clone())?),
            BackendConfig::Sqs(c) => Arc::new(SqsBackend::new(c, options.clone())?),
            BackendConfig::Memory(c) => Arc::new(MemoryBackend::new(c, options.clone())),
        };
        Ok(Self { backend, options })
    }

    /// Wrap a caller-supplied backend implementation
    pub fn with_backend(backend: Arc<dyn QueueBackend>, options: QueueOptions) -> Self {
        Self { backend, options }
    }

    /// Producer facade sharing this client's backend
    pub fn producer(&self) -> Producer {
        Producer {
            backend: Arc::clone(&self.backend),
        }
    }

    /// Consumer facade sharing this client's backend
    pub fn consumer(&self) -> Consumer {
        Consumer {
            backend: Arc::clone(&self.backend),
            options: self.options.clone(),
        }
    }

    /// Which backend this client talks to
    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }
}

fn parse_queue(name: &str) -> Result<QueueName, QueueError> {
    QueueName::from_str(name).map_err(QueueError::Validation)
}

// ============================================================================
// Producer
// ============================================================================

/// Producer-side operations: connect, send, disconnect.
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn QueueBackend>,
}

impl Producer {
    /// Establish the producer transport
    pub async fn connect(&self) -> Result<(), QueueError> {
        self.backend.connect_producer().await
    }

    /// Send one message to a logical queue. Completes only once the message
    /// is handed to the transport, awaiting backpressure where the
    /// transport signals a full buffer.
    pub async fn send(&self, queue: &str, payload: &Payload) -> Result<(), QueueError> {
        let queue = parse_queue(queue)?;
        self.backend.send(&queue, payload).await
    }

    /// Flush outstanding work and tear the producer transport down
    pub async fn disconnect(&self) -> Result<(), QueueError> {
        self.backend.disconnect_producer().await
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Consumer-side operations: push subscriptions, pull batches,
/// acknowledgment, and queue management.
#[derive(Clone)]
pub struct Consumer {
    backend: Arc<dyn QueueBackend>,
    options: QueueOptions,
}

impl Consumer {
    /// Establish a bare consumer connection for pull use
    pub async fn connect(&self) -> Result<(), QueueError> {
        self.backend.connect_consumer(None, None).await
    }

    /// Subscribe a handler to a queue: spawns a dedicated delivery loop and
    /// returns its handle. The loop runs until an unrecoverable connection
    /// error, which [`DeliveryLoop::join`] reports.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<DeliveryLoop, QueueError> {
        self.subscribe_with_group(queue, None, handler).await
    }

    /// Subscribe with a consumer-group override (honored by backends with
    /// group semantics, ignored elsewhere)
    pub async fn subscribe_with_group(
        &self,
        queue: &str,
        group: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<DeliveryLoop, QueueError> {
        let queue = parse_queue(queue)?;
        self.backend.connect_consumer(Some(&queue), group).await?;
        Ok(DeliveryLoop::spawn(
            Arc::clone(&self.backend),
            queue,
            handler,
            self.options.clone(),
        ))
    }

    /// Drive a delivery loop inline: does not return while the subscription
    /// is active, matching push-model connect semantics. Returns the
    /// loop's terminal connection error.
    pub async fn run(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        let queue = parse_queue(queue)?;
        self.backend.connect_consumer(Some(&queue), None).await?;
        run_delivery_loop(
            Arc::clone(&self.backend),
            queue,
            handler,
            self.options.clone(),
        )
        .await
    }

    /// Pull a batch of at most `max` messages (the configured batch size
    /// when `None`). Empty means "nothing available now".
    pub async fn dequeue(
        &self,
        queue: &str,
        max: Option<usize>,
    ) -> Result<Vec<DeliveredMessage>, QueueError> {
        let queue = parse_queue(queue)?;
        let max = max.unwrap_or(self.options.max_messages).max(1);
        self.backend.fetch(&queue, max).await
    }

    /// Acknowledge one delivery attempt. A `None` handle (no-ack backend)
    /// is a no-op, so repeated removes are safe there.
    pub async fn remove(&self, queue: &str, handle: &DeliveryHandle) -> Result<(), QueueError> {
        let queue = parse_queue(queue)?;
        self.backend.acknowledge(&queue, handle).await
    }

    /// Approximate pending count; 0 where the backend cannot report one
    pub async fn length(&self, queue: &str) -> Result<u64, QueueError> {
        let queue = parse_queue(queue)?;
        match self.backend.length(&queue).await {
            Ok(count) => Ok(count),
            Err(err) if err.is_not_supported() => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Best-effort queue deletion; a no-op where the backend cannot delete
    pub async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        let queue = parse_queue(queue)?;
        match self.backend.delete_queue(&queue).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_supported() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
