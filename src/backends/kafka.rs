//! Kafka adapter built on `rdkafka`.
//!
//! Producing routes each message to an explicit partition chosen by a
//! consistent-hash ring keyed on a configurable payload field, so all
//! messages sharing a key value land on the same partition and stay
//! ordered relative to each other. The ring is built lazily from topic
//! metadata on the first send to a topic, and rebuilt every
//! `ring_refresh` sends when that knob is non-zero; zero keeps the first
//! ring for the life of the process.
//!
//! Consuming holds one `StreamConsumer` per subscribed topic, so
//! concurrent subscriptions never share a group membership or trigger
//! rebalances on each other's fetches. `fetch` drains whatever arrives
//! on its topic's consumer within the empty-poll window. Acknowledging
//! commits the offset after the delivered one.

use crate::backend::QueueBackend;
use crate::config::{AckMode, BackendType, KafkaConfig, QueueOptions};
use crate::error::QueueError;
use crate::message::{
    decode_payload, encode_payload, DeliveredMessage, DeliveryHandle, Payload, QueueName,
};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const BACKEND: &str = "kafka";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const RING_POINTS_PER_PARTITION: usize = 40;

// ================================================================
// Consistent-hash ring over partition ids
// ================================================================

/// Maps key strings onto partition ids; stable under repeated lookups
/// and under partition growth (only keys near new points move).
pub(crate) struct HashRing {
    points: Vec<(u64, i32)>,
}

fn ring_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

impl HashRing {
    pub(crate) fn new(partitions: &[i32]) -> Self {
        let mut points = Vec::with_capacity(partitions.len() * RING_POINTS_PER_PARTITION);
        for &partition in partitions {
            for replica in 0..RING_POINTS_PER_PARTITION {
                points.push((ring_hash(&format!("{}-{}", partition, replica)), partition));
            }
        }
        points.sort_unstable();
        Self { points }
    }

    /// First ring point at or after the key's hash, wrapping past the top
    pub(crate) fn partition_for(&self, key: &str) -> Option<i32> {
        if self.points.is_empty() {
            return None;
        }
        let hash = ring_hash(key);
        let index = match self.points.binary_search_by(|(point, _)| point.cmp(&hash)) {
            Ok(index) => index,
            Err(index) => index,
        };
        let (_, partition) = self.points[index % self.points.len()];
        Some(partition)
    }

    pub(crate) fn len(&self) -> usize {
        self.points.len()
    }
}

/// Per-topic ring plus the send count that drives refresh
struct RingState {
    ring: HashRing,
    sends: usize,
}

struct ProducerState {
    producer: FutureProducer,
    rings: HashMap<String, RingState>,
}

/// One topic's dedicated consumer and the group it joined under
struct TopicConsumer {
    consumer: Arc<StreamConsumer>,
    group: String,
}

/// Kafka queue backend
pub struct KafkaBackend {
    config: KafkaConfig,
    options: QueueOptions,
    producer: Mutex<Option<ProducerState>>,
    consumers: Mutex<HashMap<String, TopicConsumer>>,
}

fn kafka_err(err: KafkaError) -> QueueError {
    let transient = matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotCoordinator
        )
    );
    QueueError::Backend {
        backend: BACKEND,
        message: err.to_string(),
        transient,
    }
}

impl KafkaBackend {
    pub fn new(config: KafkaConfig, options: QueueOptions) -> Result<Self, QueueError> {
        if config.brokers.trim().is_empty() {
            return Err(crate::error::ConfigurationError::Missing {
                key: "kafka.brokers".to_string(),
            }
            .into());
        }
        Ok(Self {
            config,
            options,
            producer: Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
        })
    }

    fn base_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.brokers)
            .set("client.id", &self.config.client_id);
        client_config
    }

    fn build_ring(producer: &FutureProducer, topic: &str) -> Result<HashRing, QueueError> {
        let metadata = producer
            .client()
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)
            .map_err(kafka_err)?;
        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().iter().map(|p| p.id()).collect())
            .unwrap_or_default();
        if partitions.is_empty() {
            return Err(QueueError::transient(
                BACKEND,
                format!("no partitions visible for topic '{}'", topic),
            ));
        }
        debug!(topic, partitions = partitions.len(), "built partition ring");
        Ok(HashRing::new(&partitions))
    }

    /// The payload field that drives partition routing; absent or
    /// non-string values hash the whole encoded body instead.
    fn routing_key(&self, payload: &Payload, body: &str) -> String {
        match payload.get(&self.config.key_field).and_then(|v| v.as_str()) {
            Some(key) => key.to_string(),
            None => body.to_string(),
        }
    }

    fn build_consumer(&self, group: &str) -> Result<StreamConsumer, QueueError> {
        let auto_commit = self.options.ack_mode == AckMode::Auto;
        self.base_client_config()
            .set("group.id", group)
            .set("enable.auto.commit", if auto_commit { "true" } else { "false" })
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(kafka_err)
    }

    /// The topic's dedicated consumer, created and subscribed on first use.
    /// A topic joins exactly one group for the life of the process;
    /// requesting a different group for an already-subscribed topic is an
    /// error rather than a silent rebind.
    async fn topic_consumer(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<Arc<StreamConsumer>, QueueError> {
        let mut guard = self.consumers.lock().await;
        if let Some(existing) = guard.get(topic) {
            if let Some(requested) = group {
                if existing.group != requested {
                    return Err(QueueError::permanent(
                        BACKEND,
                        format!(
                            "topic '{}' is already consumed under group '{}'",
                            topic, existing.group
                        ),
                    ));
                }
            }
            return Ok(Arc::clone(&existing.consumer));
        }

        let group = group.unwrap_or(self.config.group_id.as_str()).to_string();
        let consumer = self.build_consumer(&group)?;
        consumer.subscribe(&[topic]).map_err(kafka_err)?;
        debug!(topic, group = %group, "subscribed topic consumer");
        let consumer = Arc::new(consumer);
        guard.insert(
            topic.to_string(),
            TopicConsumer {
                consumer: Arc::clone(&consumer),
                group,
            },
        );
        Ok(consumer)
    }
}

#[async_trait]
impl QueueBackend for KafkaBackend {
    async fn connect_producer(&self) -> Result<(), QueueError> {
        let mut guard = self.producer.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let producer: FutureProducer = self
            .base_client_config()
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(kafka_err)?;
        *guard = Some(ProducerState {
            producer,
            rings: HashMap::new(),
        });
        Ok(())
    }

    async fn send(&self, queue: &QueueName, payload: &Payload) -> Result<(), QueueError> {
        self.connect_producer().await?;
        let body = encode_payload(payload)?;
        let key = self.routing_key(payload, &body);
        let topic = queue.as_str();

        let mut guard = self.producer.lock().await;
        let state = match guard.as_mut() {
            Some(state) => state,
            None => {
                return Err(QueueError::ConnectionFailed {
                    message: "producer not connected".to_string(),
                })
            }
        };

        let refresh = self.config.ring_refresh;
        let needs_rebuild = match state.rings.get(topic) {
            None => true,
            Some(ring_state) => refresh > 0 && ring_state.sends >= refresh,
        };
        if needs_rebuild {
            let ring = Self::build_ring(&state.producer, topic)?;
            state.rings.insert(topic.to_string(), RingState { ring, sends: 0 });
        }
        let ring_state = match state.rings.get_mut(topic) {
            Some(ring_state) => ring_state,
            None => {
                return Err(QueueError::transient(
                    BACKEND,
                    format!("partition ring missing for topic '{}'", topic),
                ))
            }
        };
        ring_state.sends += 1;
        let partition = match ring_state.ring.partition_for(&key) {
            Some(partition) => partition,
            None => {
                return Err(QueueError::transient(
                    BACKEND,
                    format!("empty partition ring for topic '{}'", topic),
                ))
            }
        };

        let record: FutureRecord<'_, String, String> = FutureRecord::to(topic)
            .key(&key)
            .payload(&body)
            .partition(partition);
        state
            .producer
            .send(record, Duration::from_secs(0))
            .await
            .map_err(|(err, _)| kafka_err(err))?;
        debug!(topic, partition, "produced message");
        Ok(())
    }

    async fn disconnect_producer(&self) -> Result<(), QueueError> {
        let mut guard = self.producer.lock().await;
        if let Some(state) = guard.take() {
            state
                .producer
                .flush(METADATA_TIMEOUT)
                .map_err(kafka_err)?;
        }
        Ok(())
    }

    async fn connect_consumer(
        &self,
        queue: Option<&QueueName>,
        group: Option<&str>,
    ) -> Result<(), QueueError> {
        match queue {
            Some(queue) => self.topic_consumer(queue.as_str(), group).await.map(|_| ()),
            // Nothing to pre-build for a bare connection: consumers are
            // created per topic on first fetch.
            None => Ok(()),
        }
    }

    async fn fetch(
        &self,
        queue: &QueueName,
        max: usize,
    ) -> Result<Vec<DeliveredMessage>, QueueError> {
        let consumer = self.topic_consumer(queue.as_str(), None).await?;

        // Collect until the batch is full or the poll window closes.
        let deadline = Instant::now() + self.options.empty_poll_wait;
        let mut delivered = Vec::new();
        while delivered.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let message = match tokio::time::timeout(remaining, consumer.recv()).await {
                Ok(Ok(message)) => message,
                Ok(Err(err)) => return Err(kafka_err(err)),
                Err(_) => break, // window closed
            };

            let handle = if self.options.ack_mode == AckMode::Auto {
                DeliveryHandle::None
            } else {
                DeliveryHandle::Kafka {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                }
            };
            let raw = message.payload().unwrap_or_default();
            match decode_payload(raw) {
                Ok(payload) => delivered.push(DeliveredMessage::new(handle, payload)),
                Err(err) => {
                    warn!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        error = %err,
                        "skipping undecodable message"
                    );
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
        let (topic, partition, offset) = match handle {
            DeliveryHandle::None => return Ok(()),
            DeliveryHandle::Kafka {
                topic,
                partition,
                offset,
            } => (topic.as_str(), *partition, *offset),
            other => {
                return Err(QueueError::HandleNotFound {
                    receipt: format!("{:?}", other),
                })
            }
        };

        let consumer = {
            let guard = self.consumers.lock().await;
            match guard.get(topic) {
                Some(tc) => Arc::clone(&tc.consumer),
                None => {
                    return Err(QueueError::ConnectionFailed {
                        message: format!("no consumer subscribed to topic '{}'", topic),
                    })
                }
            }
        };

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(kafka_err)?;
        consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(kafka_err)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Kafka
    }
}

#[cfg(test)]
#[path = "kafka_tests.rs"]
mod tests;
