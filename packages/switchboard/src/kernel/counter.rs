//! Non-negative counter with an await-zero primitive.
//!
//! This is the drain building block shared by the scheduler (live tasks),
//! the gate (outstanding tokens), and the correlator (pending requests).

use tokio::sync::watch;

/// A shared, non-negative counter.
///
/// `decrement` saturates at zero. `await_zero` resolves as soon as the
/// counter reaches zero, including when it is already zero at call time.
#[derive(Debug, Clone)]
pub struct Counter {
    value: watch::Sender<u64>,
}

impl Counter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self {
            value: watch::channel(0).0,
        }
    }

    /// Add `k` to the counter.
    pub fn increment(&self, k: u64) {
        if k == 0 {
            return;
        }
        self.value.send_modify(|n| *n += k);
    }

    /// Subtract `k` from the counter, saturating at zero.
    pub fn decrement(&self, k: u64) {
        if k == 0 {
            return;
        }
        self.value.send_modify(|n| *n = n.saturating_sub(k));
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        *self.value.borrow()
    }

    /// Resolve once the counter reaches zero.
    ///
    /// A waiter registered while the counter is positive completes no later
    /// than the first moment the counter hits zero afterward.
    pub async fn await_zero(&self) {
        let mut rx = self.value.subscribe();
        // The sender lives in `self`, so `wait_for` cannot fail here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}
