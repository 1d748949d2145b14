//! Push-model delivery loop.
//!
//! One loop per subscription drives fetch -> dispatch -> acknowledge,
//! forever. Handler invocations within a loop are strictly sequential; a
//! failure for one message never blocks or drops later messages. The loop
//! ends only on an unrecoverable connection error, reported through the
//! loop's result rather than by terminating the host process (process exit
//! on fatal errors is an explicit, opt-in policy).

use crate::backend::QueueBackend;
use crate::config::{FatalErrorPolicy, QueueOptions};
use crate::error::QueueError;
use crate::message::{Payload, QueueName};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Error type handlers may fail with
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Caller-supplied message processor invoked by the delivery loop.
///
/// There is no enforced handler timeout: a stalled handler stalls its loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Payload) -> Result<(), HandlerError>;
}

/// Adapter for using an async closure as a [`MessageHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, payload: Payload) -> Result<(), HandlerError> {
        (self.0)(payload).await
    }
}

/// Drive push-model consumption until the connection dies.
///
/// 1. Fetch a batch; the adapter already bounded its internal wait, so an
///    empty batch loops immediately with no extra backoff.
/// 2. Dispatch each message to the handler strictly sequentially. On
///    success, acknowledge; an acknowledge failure is logged and the loop
///    continues (the message may be redelivered per backend visibility
///    semantics). On handler failure, log, skip the acknowledge, continue.
/// 3. Transient fetch errors are absorbed as "nothing available now".
/// 4. A non-transient error ends the loop and is returned (or, under
///    `FatalErrorPolicy::ExitProcess`, exits the process).
pub async fn run_delivery_loop(
    backend: Arc<dyn QueueBackend>,
    queue: QueueName,
    handler: Arc<dyn MessageHandler>,
    options: QueueOptions,
) -> Result<(), QueueError> {
    loop {
        let batch = match backend.fetch(&queue, options.max_messages).await {
            Ok(batch) => batch,
            Err(err) if err.is_transient() => {
                // Absorbed as "no messages now". The adapter did not get to
                // apply its empty-batch wait, so bound the retry here.
                debug!(queue = %queue, error = %err, "transient fetch error absorbed");
                tokio::time::sleep(options.empty_poll_wait).await;
                continue;
            }
            Err(err) => {
                error!(queue = %queue, error = %err, "delivery loop ended by connection error");
                if options.fatal_error_policy == FatalErrorPolicy::ExitProcess {
                    std::process::exit(1);
                }
                return Err(err);
            }
        };

        for message in batch {
            match handler.handle(message.payload).await {
                Ok(()) => {
                    if let Err(err) = backend.acknowledge(&queue, &message.handle).await {
                        warn!(
                            queue = %queue,
                            error = %err,
                            "acknowledge failed; message may be redelivered"
                        );
                    }
                }
                Err(err) => {
                    error!(queue = %queue, error = %err, "message handler failed");
                }
            }
        }
    }
}

/// Handle to a spawned delivery loop.
///
/// The loop reports its terminal error through [`DeliveryLoop::join`];
/// there is no mid-loop cancellation primitive beyond [`DeliveryLoop::abort`]
/// tearing the task down.
pub struct DeliveryLoop {
    task: JoinHandle<Result<(), QueueError>>,
}

impl DeliveryLoop {
    /// Spawn a delivery loop as a dedicated task
    pub fn spawn(
        backend: Arc<dyn QueueBackend>,
        queue: QueueName,
        handler: Arc<dyn MessageHandler>,
        options: QueueOptions,
    ) -> Self {
        let task = tokio::spawn(run_delivery_loop(backend, queue, handler, options));
        Self { task }
    }

    /// Tear the loop down without waiting for a connection error
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Whether the loop has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end and return its terminal result. An aborted
    /// loop yields `Ok(())`.
    pub async fn join(self) -> Result<(), QueueError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(QueueError::ConnectionFailed {
                message: format!("delivery loop task failed: {}", err),
            }),
        }
    }
}

#[cfg(test)]
#[path = "delivery_tests.rs"]
mod tests;
