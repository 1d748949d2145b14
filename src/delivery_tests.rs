//! Tests for the push-model delivery loop.

use super::*;
use crate::config::BackendType;
use crate::message::{DeliveredMessage, DeliveryHandle};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

/// What the scripted backend does on each consecutive fetch. The script
/// always ends with a fatal error so loops terminate deterministically.
enum FetchStep {
    Batch(Vec<DeliveredMessage>),
    Transient,
    Fatal,
}

/// Backend that replays a fetch script and records acknowledgments.
struct ScriptedBackend {
    script: Mutex<VecDeque<FetchStep>>,
    acknowledged: Mutex<Vec<DeliveryHandle>>,
    ack_fails: bool,
}

impl ScriptedBackend {
    fn new(script: Vec<FetchStep>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            acknowledged: Mutex::new(Vec::new()),
            ack_fails: false,
        }
    }

    fn with_failing_acks(mut self) -> Self {
        self.ack_fails = true;
        self
    }

    fn acknowledged(&self) -> Vec<DeliveryHandle> {
        self.acknowledged.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueBackend for ScriptedBackend {
    async fn connect_producer(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn send(&self, _queue: &QueueName, _payload: &Payload) -> Result<(), QueueError> {
        Ok(())
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
        _queue: &QueueName,
        _max: usize,
    ) -> Result<Vec<DeliveredMessage>, QueueError> {
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(FetchStep::Batch(batch)) => Ok(batch),
            Some(FetchStep::Transient) => Err(QueueError::transient("memory", "blip")),
            Some(FetchStep::Fatal) | None => Err(QueueError::ConnectionFailed {
                message: "scripted end".to_string(),
            }),
        }
    }

    async fn acknowledge(
        &self,
        _queue: &QueueName,
        handle: &DeliveryHandle,
    ) -> Result<(), QueueError> {
        if self.ack_fails {
            return Err(QueueError::transient("memory", "ack lost"));
        }
        self.acknowledged.lock().unwrap().push(handle.clone());
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}

/// Handler that records every payload and fails on `{"fail": true}`.
struct RecordingHandler {
    seen: Mutex<Vec<Payload>>,
}

impl RecordingHandler {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<Payload> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, payload: Payload) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(payload.clone());
        if payload.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err("scripted handler failure".into());
        }
        Ok(())
    }
}

fn message(id: &str, fail: bool) -> DeliveredMessage {
    DeliveredMessage::new(
        DeliveryHandle::Memory {
            receipt: id.to_string(),
        },
        json!({ "id": id, "fail": fail }),
    )
}

fn queue() -> QueueName {
    QueueName::new("orders".to_string()).unwrap()
}

fn fast_options() -> QueueOptions {
    QueueOptions::new().with_empty_poll_wait(Duration::from_millis(5))
}

// ============================================================================
// Dispatch and Acknowledgment Tests
// ============================================================================

mod dispatch {
    use super::*;

    /// Verify successful messages are acknowledged after the handler runs.
    #[tokio::test]
    async fn test_successful_messages_acknowledged() {
        let backend = Arc::new(ScriptedBackend::new(vec![FetchStep::Batch(vec![
            message("a", false),
            message("b", false),
        ])]));
        let handler = Arc::new(RecordingHandler::new());

        let result = run_delivery_loop(
            Arc::clone(&backend) as Arc<dyn QueueBackend>,
            queue(),
            Arc::clone(&handler) as Arc<dyn MessageHandler>,
            fast_options(),
        )
        .await;

        assert!(result.is_err()); // scripted end
        assert_eq!(handler.seen().len(), 2);
        assert_eq!(backend.acknowledged().len(), 2);
    }

    /// Verify a handler failure skips that message's acknowledgment but
    /// never blocks or drops the rest of the batch.
    #[tokio::test]
    async fn test_handler_failure_isolated() {
        let backend = Arc::new(ScriptedBackend::new(vec![FetchStep::Batch(vec![
            message("a", true),
            message("b", false),
            message("c", false),
        ])]));
        let handler = Arc::new(RecordingHandler::new());

        let _ = run_delivery_loop(
            Arc::clone(&backend) as Arc<dyn QueueBackend>,
            queue(),
            Arc::clone(&handler) as Arc<dyn MessageHandler>,
            fast_options(),
        )
        .await;

        // All three dispatched, in order
        let seen: Vec<_> = handler
            .seen()
            .iter()
            .map(|p| p["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(seen, vec!["a", "b", "c"]);

        // Only the survivors acknowledged
        let acked = backend.acknowledged();
        assert_eq!(acked.len(), 2);
        assert!(!acked.contains(&DeliveryHandle::Memory {
            receipt: "a".to_string()
        }));
    }

    /// Verify an acknowledge failure is absorbed and the loop continues.
    #[tokio::test]
    async fn test_ack_failure_continues() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![
                FetchStep::Batch(vec![message("a", false)]),
                FetchStep::Batch(vec![message("b", false)]),
            ])
            .with_failing_acks(),
        );
        let handler = Arc::new(RecordingHandler::new());

        let _ = run_delivery_loop(
            Arc::clone(&backend) as Arc<dyn QueueBackend>,
            queue(),
            Arc::clone(&handler) as Arc<dyn MessageHandler>,
            fast_options(),
        )
        .await;

        // Both batches still flowed despite every ack failing
        assert_eq!(handler.seen().len(), 2);
    }
}

// ============================================================================
// Error Handling Tests
// ============================================================================

mod error_handling {
    use super::*;

    /// Verify transient fetch errors are absorbed as "nothing available".
    #[tokio::test]
    async fn test_transient_fetch_absorbed() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            FetchStep::Transient,
            FetchStep::Batch(vec![message("a", false)]),
        ]));
        let handler = Arc::new(RecordingHandler::new());

        let _ = run_delivery_loop(
            Arc::clone(&backend) as Arc<dyn QueueBackend>,
            queue(),
            Arc::clone(&handler) as Arc<dyn MessageHandler>,
            fast_options(),
        )
        .await;

        // The batch after the blip still made it through
        assert_eq!(handler.seen().len(), 1);
    }

    /// Verify a connection error ends the loop and is returned.
    #[tokio::test]
    async fn test_fatal_error_ends_loop() {
        let backend = Arc::new(ScriptedBackend::new(vec![FetchStep::Fatal]));
        let handler = Arc::new(RecordingHandler::new());

        let result = run_delivery_loop(
            backend as Arc<dyn QueueBackend>,
            queue(),
            handler as Arc<dyn MessageHandler>,
            fast_options(),
        )
        .await;

        assert!(matches!(
            result,
            Err(QueueError::ConnectionFailed { .. })
        ));
    }
}

// ============================================================================
// Spawned Loop Tests
// ============================================================================

mod spawned_loops {
    use super::*;

    /// Verify a spawned loop reports its terminal error through join.
    #[tokio::test]
    async fn test_join_reports_terminal_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![FetchStep::Batch(vec![message(
            "a", false,
        )])]));
        let handler = Arc::new(RecordingHandler::new());

        let delivery = DeliveryLoop::spawn(
            backend as Arc<dyn QueueBackend>,
            queue(),
            handler as Arc<dyn MessageHandler>,
            fast_options(),
        );

        let result = delivery.join().await;
        assert!(result.is_err());
    }

    /// Verify an aborted loop joins cleanly instead of surfacing a panic.
    #[tokio::test]
    async fn test_abort_joins_cleanly() {
        // Endless transient script keeps the loop alive until aborted
        let backend = Arc::new(ScriptedBackend::new(
            std::iter::repeat_with(|| FetchStep::Transient).take(10_000).collect(),
        ));
        let handler = Arc::new(RecordingHandler::new());

        let delivery = DeliveryLoop::spawn(
            backend as Arc<dyn QueueBackend>,
            queue(),
            handler as Arc<dyn MessageHandler>,
            fast_options(),
        );
        delivery.abort();
        assert!(delivery.join().await.is_ok());
    }
}

// ============================================================================
// Handler Adapter Tests
// ============================================================================

mod handler_adapter {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Verify an async closure works as a handler through FnHandler.
    #[tokio::test]
    async fn test_fn_handler_adapter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        let handler = FnHandler(move |_payload: Payload| {
            let calls = Arc::clone(&calls_in_handler);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        handler.handle(json!({"k": 1})).await.unwrap();
        handler.handle(json!({"k": 2})).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
