//! Backend adapter implementations.
//!
//! Each adapter implements [`crate::backend::QueueBackend`] atop its native
//! transport client, reconciling that backend's delivery semantics with the
//! shared contract.

pub mod amqp;
pub mod kafka;
pub mod memory;
pub mod redis;
pub mod sqs;

pub use amqp::AmqpBackend;
pub use kafka::KafkaBackend;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use sqs::SqsBackend;
