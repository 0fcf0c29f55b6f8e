//! Pairs outbound requests with inbound responses by id.
//!
//! Each outstanding request holds a one-shot resolver and an optional
//! timeout task. Timeouts are the primary reclamation path: a response
//! arriving after its timer fired finds no entry and is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::kernel::{AbortReason, Counter};

use super::frame::{format_request, ErrorObject};

/// Failure of an outbound request.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The peer answered with an error object.
    #[error("{0}")]
    Rpc(ErrorObject),
    /// No response arrived before the per-request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The correlator (or the caller's scheduler) was aborted.
    #[error("request aborted: {0}")]
    Aborted(AbortReason),
    /// The frame never reached the peer.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The correlator went away while waiting.
    #[error("correlator dropped")]
    Dropped,
}

struct Entry {
    tx: oneshot::Sender<Result<Value, RequestError>>,
    timer: Option<JoinHandle<()>>,
}

struct CorrelatorState {
    next_id: i64,
    entries: HashMap<String, Entry>,
}

struct CorrelatorInner {
    state: Mutex<CorrelatorState>,
    pending: Counter,
}

/// The response side of [`Correlator::create_request`].
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Value, RequestError>>,
}

impl PendingResponse {
    /// Wait for the matching response, timeout, or abort.
    pub async fn wait(self) -> Result<Value, RequestError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Dropped),
        }
    }
}

/// Outstanding-request table with a wrapping id allocator. Cheap to clone.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                state: Mutex::new(CorrelatorState {
                    next_id: 0,
                    entries: HashMap::new(),
                }),
                pending: Counter::new(),
            }),
        }
    }

    /// Allocate an id, register a pending entry, and build the wire frame.
    ///
    /// `timeout` of `None` waits forever. Ids are a monotonic signed
    /// integer wrapping at the bounds, serialized as a decimal string;
    /// uniqueness holds while outstanding requests stay far below the id
    /// space.
    pub fn create_request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> (Value, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.inner.state.lock().expect("correlator lock poisoned");
            state.next_id = state.next_id.wrapping_add(1);
            let id = state.next_id.to_string();
            state
                .entries
                .insert(id.clone(), Entry { tx, timer: None });
            id
        };
        self.inner.pending.increment(1);

        if let Some(duration) = timeout {
            let timer = spawn_timeout(Arc::downgrade(&self.inner), id.clone(), duration);
            let mut state = self.inner.state.lock().expect("correlator lock poisoned");
            match state.entries.get_mut(&id) {
                Some(entry) => entry.timer = Some(timer),
                // The response raced the arming; the timer has nothing to do.
                None => timer.abort(),
            }
        }

        (format_request(&id, method, params), PendingResponse { rx })
    }

    /// Resolve the entry matching `id`. Returns whether one matched.
    pub fn deliver_response(&self, id: &str, result: Result<Value, ErrorObject>) -> bool {
        let entry = {
            let mut state = self.inner.state.lock().expect("correlator lock poisoned");
            state.entries.remove(id)
        };
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                self.inner.pending.decrement(1);
                let _ = entry.tx.send(result.map_err(RequestError::Rpc));
                true
            }
            None => false,
        }
    }

    /// Reject every pending entry with `reason` and clear the table.
    pub fn abort_all(&self, reason: AbortReason) {
        let entries: Vec<Entry> = {
            let mut state = self.inner.state.lock().expect("correlator lock poisoned");
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            self.inner.pending.decrement(1);
            let _ = entry.tx.send(Err(RequestError::Aborted(reason.clone())));
        }
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> u64 {
        self.inner.pending.value()
    }

    /// Resolve once no requests remain outstanding.
    pub async fn await_drain(&self) {
        self.inner.pending.await_zero().await;
    }

    #[cfg(test)]
    fn set_next_id(&self, id: i64) {
        self.inner
            .state
            .lock()
            .expect("correlator lock poisoned")
            .next_id = id;
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_timeout(
    inner: Weak<CorrelatorInner>,
    id: String,
    duration: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let entry = {
            let mut state = inner.state.lock().expect("correlator lock poisoned");
            state.entries.remove(&id)
        };
        if let Some(entry) = entry {
            inner.pending.decrement(1);
            let _ = entry.tx.send(Err(RequestError::Timeout(duration)));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn response_resolves_pending_request() {
        let correlator = Correlator::new();
        let (frame, pending) = correlator.create_request("echo", json!("wuhu"), None);
        let id = frame["id"].as_str().unwrap().to_string();
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.deliver_response(&id, Ok(json!("wuhu"))));
        assert_eq!(pending.wait().await.unwrap(), json!("wuhu"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_rejects() {
        let correlator = Correlator::new();
        let (frame, pending) = correlator.create_request("echo", json!(1), None);
        let id = frame["id"].as_str().unwrap().to_string();

        correlator.deliver_response(&id, Err(ErrorObject::new(-32603, "invalid params")));
        match pending.wait().await {
            Err(RequestError::Rpc(error)) => {
                assert_eq!(error.code, -32603);
                assert_eq!(error.message, "invalid params");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_rejects_and_removes_entry() {
        let correlator = Correlator::new();
        let (frame, pending) =
            correlator.create_request("slow", json!(null), Some(Duration::from_millis(20)));
        let id = frame["id"].as_str().unwrap().to_string();

        match pending.wait().await {
            Err(RequestError::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(correlator.pending_count(), 0);
        // Late response finds no entry and is dropped.
        assert!(!correlator.deliver_response(&id, Ok(json!("late"))));
    }

    #[tokio::test]
    async fn no_timeout_waits_indefinitely() {
        let correlator = Correlator::new();
        let (_frame, pending) = correlator.create_request("slow", json!(null), None);
        let result = tokio::time::timeout(Duration::from_millis(50), pending.wait()).await;
        assert!(result.is_err(), "request without timeout must stay pending");
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn abort_all_rejects_every_entry() {
        let correlator = Correlator::new();
        let (_f1, p1) = correlator.create_request("a", json!(null), None);
        let (_f2, p2) = correlator.create_request("b", json!(null), Some(Duration::from_secs(30)));
        assert_eq!(correlator.pending_count(), 2);

        correlator.abort_all(AbortReason::new("shutdown"));
        assert_eq!(correlator.pending_count(), 0);

        for pending in [p1, p2] {
            match pending.wait().await {
                Err(RequestError::Aborted(reason)) => assert_eq!(reason.as_str(), "shutdown"),
                other => panic!("expected abort, got {other:?}"),
            }
        }
        tokio::time::timeout(Duration::from_secs(1), correlator.await_drain())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ids_are_monotonic_decimal_strings() {
        let correlator = Correlator::new();
        let (f1, _p1) = correlator.create_request("a", json!(null), None);
        let (f2, _p2) = correlator.create_request("b", json!(null), None);
        assert_eq!(f1["id"], json!("1"));
        assert_eq!(f2["id"], json!("2"));
    }

    #[tokio::test]
    async fn id_allocation_wraps_at_bounds() {
        let correlator = Correlator::new();
        correlator.set_next_id(i64::MAX - 1);
        let (f1, _p1) = correlator.create_request("a", json!(null), None);
        let (f2, _p2) = correlator.create_request("b", json!(null), None);
        assert_eq!(f1["id"], json!(i64::MAX.to_string()));
        assert_eq!(f2["id"], json!(i64::MIN.to_string()));
        assert_ne!(f1["id"], f2["id"]);
    }
}
