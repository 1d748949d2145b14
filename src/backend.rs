//! The adapter contract every queue backend implements.

use crate::config::BackendType;
use crate::error::QueueError;
use crate::message::{DeliveredMessage, DeliveryHandle, Payload, QueueName};
use async_trait::async_trait;

/// Capability set shared by every backend implementation.
///
/// Producer and consumer transports are independent and lazily established:
/// `send` and `fetch` connect on first use when the caller skipped the
/// explicit connect. Optional operations default to a `NotSupported` result,
/// discriminable from a transient failure, so callers can branch on
/// capability absence.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Establish the producer-side transport. Fails with `ConnectionFailed`.
    async fn connect_producer(&self) -> Result<(), QueueError>;

    /// Send one message. Preserves the caller's issuance order for sends to
    /// the same queue from one task; may await transport backpressure
    /// before completing.
    async fn send(&self, queue: &QueueName, payload: &Payload) -> Result<(), QueueError>;

    /// Flush and tear down the producer-side transport. Default: no-op.
    async fn disconnect_producer(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Establish the consumer-side transport. A `queue` binds the
    /// connection to that subscription up front; backends with group
    /// semantics (Kafka) honor the `group` override for it, others ignore
    /// both. `None` establishes a bare connection for pull use.
    async fn connect_consumer(
        &self,
        queue: Option<&QueueName>,
        group: Option<&str>,
    ) -> Result<(), QueueError>;

    /// Fetch up to `max` messages in order. An empty batch means "nothing
    /// available now", not end-of-stream; the adapter bounds its own wait
    /// (`empty_poll_wait`) before reporting empty, so callers layer no
    /// extra backoff on top.
    async fn fetch(
        &self,
        queue: &QueueName,
        max: usize,
    ) -> Result<Vec<DeliveredMessage>, QueueError>;

    /// Acknowledge one delivery attempt. No-op for `DeliveryHandle::None`.
    async fn acknowledge(
        &self,
        queue: &QueueName,
        handle: &DeliveryHandle,
    ) -> Result<(), QueueError>;

    /// Approximate pending message count.
    async fn length(&self, queue: &QueueName) -> Result<u64, QueueError> {
        let _ = queue;
        Err(QueueError::NotSupported {
            operation: "length",
            backend: self.backend_name(),
        })
    }

    /// Best-effort queue deletion.
    async fn delete_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let _ = queue;
        Err(QueueError::NotSupported {
            operation: "delete_queue",
            backend: self.backend_name(),
        })
    }

    /// Which backend this is
    fn backend_type(&self) -> BackendType;

    /// Static name used in errors and logs
    fn backend_name(&self) -> &'static str {
        match self.backend_type() {
            BackendType::Amqp => "amqp",
            BackendType::Redis => "redis",
            BackendType::Kafka => "kafka",
            BackendType::Sqs => "sqs",
            BackendType::Memory => "memory",
        }
    }
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;
