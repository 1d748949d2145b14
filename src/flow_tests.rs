//! Tests for producer-side flow control.

use super::*;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Gate State Tests
// ============================================================================

mod gate_state {
    use super::*;

    /// Verify a fresh gate lets senders through immediately.
    #[tokio::test]
    async fn test_reserve_passes_when_not_full() {
        let gate = FlowGate::new();
        assert!(!gate.is_full());
        gate.reserve().await; // must not hang
    }

    /// Verify mark_full flips the observable state and mark_drained clears it.
    #[test]
    fn test_full_flag_transitions() {
        let gate = FlowGate::new();
        gate.mark_full();
        assert!(gate.is_full());
        gate.mark_drained();
        assert!(!gate.is_full());
    }

    /// Verify a drain with no waiters is harmless.
    #[test]
    fn test_drain_without_waiters() {
        let gate = FlowGate::new();
        gate.mark_drained();
        assert!(!gate.is_full());
    }
}

// ============================================================================
// Waiter Resume Tests
// ============================================================================

mod waiter_resume {
    use super::*;

    /// Verify a waiting sender resumes on the next drain signal.
    #[tokio::test]
    async fn test_waiter_resumes_on_drain() {
        let gate = Arc::new(FlowGate::new());
        gate.mark_full();

        let waiter_gate = Arc::clone(&gate);
        let waiter = tokio::spawn(async move {
            waiter_gate.reserve().await;
        });

        // Let the waiter park before draining
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.mark_drained();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resume after drain")
            .unwrap();
    }

    /// Verify waiters resume in the order they began waiting.
    #[tokio::test]
    async fn test_fifo_resume_order() {
        let gate = Arc::new(FlowGate::new());
        gate.mark_full();

        let (log_tx, mut log_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut waiters = Vec::new();
        for id in 0..3 {
            let gate = Arc::clone(&gate);
            let log = log_tx.clone();
            waiters.push(tokio::spawn(async move {
                gate.reserve().await;
                let _ = log.send(id);
            }));
            // Deterministic arrival order
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        gate.mark_drained();
        for waiter in waiters {
            waiter.await.unwrap();
        }

        let mut order = Vec::new();
        while let Ok(id) = log_rx.try_recv() {
            order.push(id);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    /// Verify a reserve after the drain does not wait again.
    #[tokio::test]
    async fn test_reserve_after_drain_is_immediate() {
        let gate = FlowGate::new();
        gate.mark_full();
        gate.mark_drained();
        tokio::time::timeout(Duration::from_millis(100), gate.reserve())
            .await
            .expect("reserve should complete immediately after drain");
    }
}
