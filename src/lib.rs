//! # Cloud Queue
//!
//! One programming interface for producing and consuming messages across
//! heterogeneous queuing backends: a partitioned-log broker (Kafka), an
//! AMQP broker (RabbitMQ), a key-value store used as a queue (Redis), an
//! AWS SQS cloud queue, and an in-memory backend for tests and development.
//!
//! This library provides:
//! - A backend-agnostic adapter contract with explicit `NotSupported`
//!   results for absent capabilities
//! - A push-model delivery loop with per-message failure isolation and
//!   at-least-once semantics
//! - Producer-side flow control that surfaces transport backpressure to
//!   `send` callers
//! - Pull-model batch consumption with explicit acknowledgment handles
//!
//! ## Module Organization
//!
//! - [`error`] - Error taxonomy for all queue operations
//! - [`message`] - Queue names, payload codec, and delivery handles
//! - [`config`] - Backend selection and per-backend options
//! - [`backend`] - The adapter contract
//! - [`client`] - The producer/consumer facade and factory
//! - [`delivery`] - The push-model delivery loop
//! - [`flow`] - Producer-side backpressure gate
//! - [`backends`] - Concrete backend adapters

// Module declarations
pub mod backend;
pub mod backends;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod flow;
pub mod message;

// Re-export commonly used types at crate root for convenience
pub use backend::QueueBackend;
pub use client::{CloudQueue, Consumer, Producer};
pub use config::{
    AckMode, AmqpConfig, BackendConfig, BackendType, FatalErrorPolicy, KafkaConfig, MemoryConfig,
    QueueConfig, QueueOptions, RedisConfig, SqsConfig,
};
pub use delivery::{DeliveryLoop, FnHandler, HandlerError, MessageHandler};
pub use error::{ConfigurationError, DecodeError, QueueError, ValidationError};
pub use flow::FlowGate;
pub use message::{DeliveredMessage, DeliveryHandle, Payload, QueueName};
