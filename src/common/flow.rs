//! Per-flow context
//!
//! A [`FlowContext`] is a plain value carrying a unique flow id, a
//! structured logging span, and a view of the owning inbound's shutdown
//! signal. It is passed explicitly to handlers; there is no ambient
//! context.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::Span;

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Sending half of a shutdown signal, held by the owning component
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Create a signal pair
    #[must_use]
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownSignal { rx })
    }

    /// Fire the signal. Idempotent; observers wake at most once.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether the signal has fired
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// A fresh observer of this signal
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observing half of a shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether the signal has fired
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Sender dropped counts as shutdown
                return;
            }
        }
    }
}

/// Context attached to a single flow
#[derive(Debug, Clone)]
pub struct FlowContext {
    /// Unique id, stamped on every log line of this flow
    pub flow_id: u64,
    /// Structured logging span for the flow
    pub span: Span,
    shutdown: ShutdownSignal,
}

impl FlowContext {
    /// Derive a flow context from an inbound's root shutdown signal,
    /// assigning a new unique flow id
    #[must_use]
    pub fn new(tag: &str, shutdown: ShutdownSignal) -> Self {
        let flow_id = NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("flow", flow = flow_id, tag = tag);
        Self {
            flow_id,
            span,
            shutdown,
        }
    }

    /// Whether the owning inbound has been told to stop
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Wait for cancellation. Handlers may race this against their own
    /// I/O for per-flow timeouts.
    pub async fn cancelled(&self) {
        let mut signal = self.shutdown.clone();
        signal.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_ids_are_unique() {
        let (handle, signal) = ShutdownHandle::new();
        let a = FlowContext::new("in", signal.clone());
        let b = FlowContext::new("in", signal);
        assert_ne!(a.flow_id, b.flow_id);
        drop(handle);
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let (handle, signal) = ShutdownHandle::new();
        let ctx = FlowContext::new("in", signal);
        assert!(!ctx.is_cancelled());

        handle.shutdown();
        assert!(ctx.is_cancelled());
        // Must not hang
        ctx.cancelled().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_shutdown() {
        let (handle, signal) = ShutdownHandle::new();
        let ctx = FlowContext::new("in", signal);
        drop(handle);
        ctx.cancelled().await;
    }
}
