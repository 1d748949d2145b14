//! Producer-side flow control.
//!
//! Converts a transport-level "buffer full" signal into caller-visible
//! backpressure: `reserve` completes immediately while the transport has
//! capacity, and once the transport reports full, senders queue up and are
//! resumed in FIFO order relative to when each began waiting.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// FIFO wait-for-drain gate shared between a producer and its transport.
#[derive(Debug, Default)]
pub struct FlowGate {
    state: Mutex<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    full: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl FlowGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the transport has capacity. Returns immediately unless a
    /// `mark_full` has been observed without a matching `mark_drained`.
    pub async fn reserve(&self) {
        let rx = {
            let mut state = self.state.lock().expect("flow gate poisoned");
            if !state.full {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        debug!("backpressure starts, waiting for drain");
        // A dropped sender means the gate itself went away; treat as drained.
        let _ = rx.await;
        debug!("backpressure resolved");
    }

    /// Record that the transport buffer is full; subsequent `reserve` calls
    /// wait for the next drain.
    pub fn mark_full(&self) {
        let mut state = self.state.lock().expect("flow gate poisoned");
        state.full = true;
    }

    /// Record a drain signal: clears the full flag and resumes every waiter
    /// in the order it began waiting.
    pub fn mark_drained(&self) {
        let waiters = {
            let mut state = self.state.lock().expect("flow gate poisoned");
            state.full = false;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Whether senders would currently wait
    pub fn is_full(&self) -> bool {
        self.state.lock().expect("flow gate poisoned").full
    }
}

#[cfg(test)]
#[path = "flow_tests.rs"]
mod tests;
