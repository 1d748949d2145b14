//! Redis list-as-queue adapter.
//!
//! A logical queue maps onto two key shapes: `queue_{name}` is a list of
//! pointer keys, and each pointer key `queue_{name}_{uuid}` holds one
//! encoded message body. Sending writes the body then pushes its pointer;
//! fetching pops pointers and resolves each to a body with a `GET` + `DEL`.
//! The pop removes the message from the queue, so delivery is
//! at-most-once here: there is no receipt and `acknowledge` is a no-op.
//!
//! An optional per-message expiry bounds how long unconsumed messages
//! (and the pointer list itself) survive.

use crate::backend::QueueBackend;
use crate::config::{BackendType, QueueOptions, RedisConfig};
use crate::error::QueueError;
use crate::message::{
    decode_payload, encode_payload, DeliveredMessage, DeliveryHandle, Payload, QueueName,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const BACKEND: &str = "redis";

/// Redis queue backend
pub struct RedisBackend {
    client: redis::Client,
    config: RedisConfig,
    options: QueueOptions,
    producer: Mutex<Option<ConnectionManager>>,
    consumer: Mutex<Option<ConnectionManager>>,
}

fn list_key(queue: &QueueName) -> String {
    format!("queue_{}", queue)
}

fn body_key(queue: &QueueName) -> String {
    format!("queue_{}_{}", queue, Uuid::new_v4())
}

fn redis_err(err: redis::RedisError) -> QueueError {
    // Connection drops and timeouts recover on retry; everything else
    // (bad commands, type mismatches) will not.
    if err.is_connection_dropped() || err.is_timeout() || err.is_connection_refusal() {
        QueueError::transient(BACKEND, err.to_string())
    } else {
        QueueError::permanent(BACKEND, err.to_string())
    }
}

impl RedisBackend {
    pub fn new(config: RedisConfig, options: QueueOptions) -> Result<Self, QueueError> {
        crate::config::validate_endpoint(&config.url, "redis.url", &["redis", "rediss"])?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|err| QueueError::ConnectionFailed {
                message: format!("invalid Redis URL: {}", err),
            })?;
        Ok(Self {
            client,
            config,
            options,
            producer: Mutex::new(None),
            consumer: Mutex::new(None),
        })
    }

    async fn connection(
        &self,
        slot: &Mutex<Option<ConnectionManager>>,
    ) -> Result<ConnectionManager, QueueError> {
        let mut guard = slot.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|err| QueueError::ConnectionFailed {
                message: format!("Redis connect failed: {}", err),
            })?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// Pop up to `max` pointer keys off the tail of the queue list
    async fn pop_pointers(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        max: usize,
    ) -> Result<Vec<String>, QueueError> {
        let mut pointers = Vec::new();
        for _ in 0..max {
            let popped: Option<String> = redis::cmd("RPOP")
                .arg(key)
                .query_async(conn)
                .await
                .map_err(redis_err)?;
            match popped {
                Some(pointer) => pointers.push(pointer),
                None => break,
            }
        }
        Ok(pointers)
    }

    async fn apply_expire(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
    ) -> Result<(), QueueError> {
        if let Some(seconds) = self.config.expire {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(seconds)
                .query_async::<_, ()>(conn)
                .await
                .map_err(redis_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn connect_producer(&self) -> Result<(), QueueError> {
        self.connection(&self.producer).await.map(|_| ())
    }

    async fn send(&self, queue: &QueueName, payload: &Payload) -> Result<(), QueueError> {
        let mut conn = self.connection(&self.producer).await?;
        let body = encode_payload(payload)?;
        let pointer = body_key(queue);
        let list = list_key(queue);

        // Body first, pointer second: a consumer never pops a pointer
        // whose body is not yet written.
        conn.set::<_, _, ()>(&pointer, body)
            .await
            .map_err(redis_err)?;
        self.apply_expire(&mut conn, &pointer).await?;
        conn.lpush::<_, _, ()>(&list, &pointer)
            .await
            .map_err(redis_err)?;
        self.apply_expire(&mut conn, &list).await?;
        debug!(queue = %queue, pointer = %pointer, "pushed message");
        Ok(())
    }

    async fn connect_consumer(
        &self,
        _queue: Option<&QueueName>,
        _group: Option<&str>,
    ) -> Result<(), QueueError> {
        self.connection(&self.consumer).await.map(|_| ())
    }

    async fn fetch(
        &self,
        queue: &QueueName,
        max: usize,
    ) -> Result<Vec<DeliveredMessage>, QueueError> {
        let mut conn = self.connection(&self.consumer).await?;
        let list = list_key(queue);
        let pointers = self.pop_pointers(&mut conn, &list, max).await?;

        if pointers.is_empty() {
            tokio::time::sleep(self.options.empty_poll_wait).await;
            return Ok(Vec::new());
        }

        let mut delivered = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            let body: Option<String> = conn.get(&pointer).await.map_err(redis_err)?;
            conn.del::<_, ()>(&pointer).await.map_err(redis_err)?;
            let Some(body) = body else {
                // Pointer outlived its body (expiry raced the fetch)
                warn!(queue = %queue, pointer = %pointer, "dangling queue pointer, body expired");
                continue;
            };
            match decode_payload(body.as_bytes()) {
                Ok(payload) => delivered.push(DeliveredMessage::new(DeliveryHandle::None, payload)),
                Err(err) => {
                    warn!(queue = %queue, pointer = %pointer, error = %err, "dropping undecodable message");
                }
            }
        }
        Ok(delivered)
    }

    async fn acknowledge(
        &self,
        _queue: &QueueName,
        handle: &DeliveryHandle,
    ) -> Result<(), QueueError> {
        // Removal happened at fetch time; any handle is already settled.
        match handle {
            DeliveryHandle::None => Ok(()),
            other => Err(QueueError::HandleNotFound {
                receipt: format!("{:?}", other),
            }),
        }
    }

    async fn length(&self, queue: &QueueName) -> Result<u64, QueueError> {
        let mut conn = self.connection(&self.consumer).await?;
        let len: u64 = conn.llen(list_key(queue)).await.map_err(redis_err)?;
        Ok(len)
    }

    async fn delete_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        // Drops the pointer list; orphaned bodies fall to their expiry,
        // or linger when none is configured.
        let mut conn = self.connection(&self.consumer).await?;
        conn.del::<_, ()>(list_key(queue)).await.map_err(redis_err)?;
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Redis
    }
}

#[cfg(test)]
#[path = "redis_tests.rs"]
mod tests;
