//! In-memory backend for tests and development.
//!
//! A fully functional implementation of the adapter contract that:
//! - Stores messages in their textual wire form, so consumption round-trips
//!   through the same codec as the real backends
//! - Hides fetched-but-unacknowledged messages for a visibility timeout,
//!   after which they become redeliverable
//! - Simulates a bounded transport buffer: with a capacity configured,
//!   `send` waits on the flow gate until a fetch drains the queue

use crate::backend::QueueBackend;
use crate::config::{AckMode, BackendType, MemoryConfig, QueueOptions};
use crate::error::QueueError;
use crate::flow::FlowGate;
use crate::message::{
    decode_payload, encode_payload, DeliveredMessage, DeliveryHandle, Payload, QueueName,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::warn;

/// Thread-safe storage for all queues
struct QueueStorage {
    queues: HashMap<QueueName, MemoryQueue>,
}

impl QueueStorage {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    /// Get or create a queue; creation is idempotent, so concurrent first
    /// assertions for the same name are safe.
    fn get_or_create(&mut self, queue: &QueueName) -> &mut MemoryQueue {
        self.queues
            .entry(queue.clone())
            .or_insert_with(MemoryQueue::new)
    }
}

/// State for a single queue
struct MemoryQueue {
    /// Messages ready for delivery, in send order
    ready: VecDeque<StoredMessage>,
    /// Fetched messages hidden until acknowledged or visibility expiry
    in_flight: HashMap<String, InFlightMessage>,
}

impl MemoryQueue {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    /// Return expired in-flight messages to the front of the ready queue
    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(inflight) = self.in_flight.remove(&receipt) {
                self.ready.push_front(inflight.message);
            }
        }
    }
}

/// A message stored in its textual wire form
#[derive(Clone)]
struct StoredMessage {
    body: String,
}

struct InFlightMessage {
    message: StoredMessage,
    visible_at: Instant,
}

/// In-memory queue backend
pub struct MemoryBackend {
    storage: Arc<RwLock<QueueStorage>>,
    gates: RwLock<HashMap<QueueName, Arc<FlowGate>>>,
    config: MemoryConfig,
    options: QueueOptions,
}

impl MemoryBackend {
    pub fn new(config: MemoryConfig, options: QueueOptions) -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::new())),
            gates: RwLock::new(HashMap::new()),
            config,
            options,
        }
    }

    /// The queue's flow gate; the capacity bound is per queue, so each
    /// queue gets its own gate and a drain on one never wakes senders
    /// blocked on another.
    pub fn flow_gate(&self, queue: &QueueName) -> Arc<FlowGate> {
        if let Some(gate) = self.gates.read().expect("gates poisoned").get(queue) {
            return Arc::clone(gate);
        }
        let mut gates = self.gates.write().expect("gates poisoned");
        Arc::clone(
            gates
                .entry(queue.clone())
                .or_insert_with(|| Arc::new(FlowGate::new())),
        )
    }

    /// Number of distinct queues that have been asserted
    pub fn queue_count(&self) -> usize {
        self.storage.read().expect("storage poisoned").queues.len()
    }

    /// Try to enqueue; reports false when the buffer is full
    fn try_push(&self, queue: &QueueName, body: &str) -> bool {
        let mut storage = self.storage.write().expect("storage poisoned");
        let q = storage.get_or_create(queue);
        if let Some(capacity) = self.config.capacity {
            if q.ready.len() >= capacity {
                return false;
            }
        }
        q.ready.push_back(StoredMessage {
            body: body.to_string(),
        });
        true
    }

    fn pop_batch(&self, queue: &QueueName, max: usize) -> Vec<StoredMessage> {
        let mut storage = self.storage.write().expect("storage poisoned");
        let q = storage.get_or_create(queue);
        q.reap_expired(Instant::now());
        let mut batch = Vec::new();
        while batch.len() < max {
            match q.ready.pop_front() {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        batch
    }

    fn park_in_flight(&self, queue: &QueueName, message: StoredMessage) -> String {
        let receipt = uuid::Uuid::new_v4().to_string();
        let visible_at = Instant::now() + self.config.visibility_timeout;
        let mut storage = self.storage.write().expect("storage poisoned");
        let q = storage.get_or_create(queue);
        q.in_flight.insert(
            receipt.clone(),
            InFlightMessage {
                message,
                visible_at,
            },
        );
        receipt
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn connect_producer(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn send(&self, queue: &QueueName, payload: &Payload) -> Result<(), QueueError> {
        let body = encode_payload(payload)?;
        let gate = self.flow_gate(queue);
        loop {
            if self.try_push(queue, &body) {
                return Ok(());
            }
            // Buffer full: surface transport push-back to the caller and
            // wait for the drain signal a fetch emits.
            gate.mark_full();
            if self.try_push(queue, &body) {
                // A fetch drained between the failed push and mark_full
                return Ok(());
            }
            gate.reserve().await;
        }
    }

    async fn connect_consumer(
        &self,
        _queue: Option<&QueueName>,
        _group: Option<&str>,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &QueueName,
        max: usize,
    ) -> Result<Vec<DeliveredMessage>, QueueError> {
        let batch = self.pop_batch(queue, max);
        if batch.is_empty() {
            // Bounded internal wait before reporting "nothing available now"
            tokio::time::sleep(self.options.empty_poll_wait).await;
            return Ok(Vec::new());
        }
        self.flow_gate(queue).mark_drained();

        let mut delivered = Vec::with_capacity(batch.len());
        for stored in batch {
            let payload = match decode_payload(stored.body.as_bytes()) {
                Ok(payload) => payload,
                Err(err) => {
                    // Isolated per message: the rest of the batch still flows
                    warn!(queue = %queue, error = %err, "dropping undecodable message");
                    continue;
                }
            };
            let handle = match self.options.ack_mode {
                AckMode::Auto => DeliveryHandle::None,
                AckMode::Explicit => DeliveryHandle::Memory {
                    receipt: self.park_in_flight(queue, stored),
                },
            };
            delivered.push(DeliveredMessage::new(handle, payload));
        }
        Ok(delivered)
    }

    async fn acknowledge(
        &self,
        queue: &QueueName,
        handle: &DeliveryHandle,
    ) -> Result<(), QueueError> {
        let receipt = match handle {
            DeliveryHandle::None => return Ok(()),
            DeliveryHandle::Memory { receipt } => receipt,
            other => {
                return Err(QueueError::HandleNotFound {
                    receipt: format!("{:?}", other),
                })
            }
        };
        let mut storage = self.storage.write().expect("storage poisoned");
        let q = storage.get_or_create(queue);
        match q.in_flight.remove(receipt) {
            Some(_) => Ok(()),
            None => Err(QueueError::HandleNotFound {
                receipt: receipt.clone(),
            }),
        }
    }

    async fn length(&self, queue: &QueueName) -> Result<u64, QueueError> {
        let storage = self.storage.read().expect("storage poisoned");
        Ok(storage
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u64)
            .unwrap_or(0))
    }

    async fn delete_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let mut storage = self.storage.write().expect("storage poisoned");
        storage.queues.remove(queue);
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
