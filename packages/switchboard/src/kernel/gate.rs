//! Bounded concurrency gate.
//!
//! A fixed pool of tokens caps the number of concurrent executions; a
//! bounded FIFO queue absorbs a limited burst of extra acquirers. Beyond
//! that, `acquire` fails synchronously so callers can shed load
//! deterministically instead of queueing without bound.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::oneshot;

use super::counter::Counter;

/// Gate acquisition failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// No idle token and the wait queue is full.
    #[error("gate saturated: wait queue is full")]
    Saturated,
    /// A queued acquire was canceled before a token arrived.
    #[error("queued acquire canceled: {reason}")]
    Canceled { reason: String },
    /// The gate went away while waiting.
    #[error("gate closed")]
    Closed,
}

/// Token lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// In the gate's idle pool.
    Idle,
    /// Acquired but not currently driving work.
    Stopped,
    /// Driving work.
    Working,
}

/// A concurrency token. Obtained from [`Gate::acquire`], returned with
/// [`Gate::release`].
#[derive(Debug)]
pub struct Token {
    slot: usize,
    status: TokenStatus,
}

impl Token {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn status(&self) -> TokenStatus {
        self.status
    }

    /// Mark the token as driving work. Panics unless the token is Stopped;
    /// using an Idle or already Working token is a programming error.
    pub fn start_work(&mut self) {
        assert_eq!(
            self.status,
            TokenStatus::Stopped,
            "token must be stopped before starting work"
        );
        self.status = TokenStatus::Working;
    }

    /// Mark the work as finished. Panics unless the token is Working.
    pub fn finish_work(&mut self) {
        assert_eq!(
            self.status,
            TokenStatus::Working,
            "token must be working to finish work"
        );
        self.status = TokenStatus::Stopped;
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Token, GateError>>,
}

struct GateState {
    idle: Vec<Token>,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

struct GateInner {
    max_tokens: usize,
    max_queued: usize,
    state: Mutex<GateState>,
    /// Tokens currently outside the idle pool.
    outstanding: Counter,
}

/// The result of a successful [`Gate::acquire`].
pub enum Acquired {
    /// A token was idle; no queueing happened.
    Ready(Token),
    /// The acquire was queued; await [`QueuedToken::wait`].
    Queued(QueuedToken),
}

/// A queued acquire. Dropping it silently leaves the queue.
pub struct QueuedToken {
    rx: oneshot::Receiver<Result<Token, GateError>>,
    handle: QueueHandle,
}

impl QueuedToken {
    /// The handle used to cancel this queued acquire.
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Wait for a token to be handed over, or for cancellation.
    pub async fn wait(mut self) -> Result<Token, GateError> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(GateError::Closed),
        }
    }
}

impl Drop for QueuedToken {
    fn drop(&mut self) {
        if let Some(gate) = self.handle.gate.upgrade() {
            let mut state = gate.state.lock().expect("gate lock poisoned");
            state.queue.retain(|waiter| waiter.id != self.handle.id);
        }
    }
}

/// Identifies a queued acquire for cancellation.
#[derive(Clone)]
pub struct QueueHandle {
    id: u64,
    gate: std::sync::Weak<GateInner>,
}

/// Fixed-size token pool with a bounded FIFO wait queue. Cheap to clone.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    pub fn new(max_tokens: usize, max_queued: usize) -> Self {
        assert!(max_tokens > 0, "gate needs at least one token");
        let idle = (0..max_tokens)
            .map(|slot| Token {
                slot,
                status: TokenStatus::Idle,
            })
            .collect();
        Self {
            inner: Arc::new(GateInner {
                max_tokens,
                max_queued,
                state: Mutex::new(GateState {
                    idle,
                    queue: VecDeque::new(),
                    next_waiter_id: 0,
                }),
                outstanding: Counter::new(),
            }),
        }
    }

    /// Take a token.
    ///
    /// Resolves synchronously from the idle pool when possible, queues when
    /// the queue has room, and fails with [`GateError::Saturated`] otherwise.
    pub fn acquire(&self) -> Result<Acquired, GateError> {
        let mut state = self.inner.state.lock().expect("gate lock poisoned");
        if let Some(mut token) = state.idle.pop() {
            token.status = TokenStatus::Stopped;
            self.inner.outstanding.increment(1);
            return Ok(Acquired::Ready(token));
        }
        if state.queue.len() >= self.inner.max_queued {
            return Err(GateError::Saturated);
        }
        let (tx, rx) = oneshot::channel();
        let id = state.next_waiter_id;
        state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
        state.queue.push_back(Waiter { id, tx });
        Ok(Acquired::Queued(QueuedToken {
            rx,
            handle: QueueHandle {
                id,
                gate: Arc::downgrade(&self.inner),
            },
        }))
    }

    /// Take a token, waiting in the queue when necessary.
    pub async fn acquire_token(&self) -> Result<Token, GateError> {
        match self.acquire()? {
            Acquired::Ready(token) => Ok(token),
            Acquired::Queued(queued) => queued.wait().await,
        }
    }

    /// Return a token.
    ///
    /// When the queue is non-empty the token goes straight to the head
    /// waiter and never touches the idle pool.
    pub fn release(&self, mut token: Token) {
        assert_ne!(
            token.status,
            TokenStatus::Working,
            "finish work before releasing a token"
        );
        token.status = TokenStatus::Stopped;
        let mut state = self.inner.state.lock().expect("gate lock poisoned");
        loop {
            match state.queue.pop_front() {
                Some(waiter) => match waiter.tx.send(Ok(token)) {
                    // Handed over; the token stays outstanding.
                    Ok(()) => return,
                    // The waiter gave up; reclaim the token and try the next.
                    Err(Ok(reclaimed)) => token = reclaimed,
                    Err(Err(_)) => unreachable!("release only sends Ok"),
                },
                None => {
                    token.status = TokenStatus::Idle;
                    state.idle.push(token);
                    self.inner.outstanding.decrement(1);
                    return;
                }
            }
        }
    }

    /// Remove a queued acquire and reject its future with `reason`.
    ///
    /// Returns false when the request already resolved or was removed, in
    /// which case this is a no-op.
    pub fn cancel(&self, handle: &QueueHandle, reason: Option<&str>) -> bool {
        let waiter = {
            let mut state = self.inner.state.lock().expect("gate lock poisoned");
            match state.queue.iter().position(|waiter| waiter.id == handle.id) {
                Some(pos) => state.queue.remove(pos),
                None => None,
            }
        };
        match waiter {
            Some(waiter) => {
                let reason = reason.unwrap_or("canceled").to_string();
                let _ = waiter.tx.send(Err(GateError::Canceled { reason }));
                true
            }
            None => false,
        }
    }

    /// Remaining queue capacity.
    pub fn available(&self) -> usize {
        let state = self.inner.state.lock().expect("gate lock poisoned");
        self.inner.max_queued - state.queue.len()
    }

    /// Number of queued acquires.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().expect("gate lock poisoned").queue.len()
    }

    /// Tokens currently outside the idle pool.
    pub fn parallels(&self) -> u64 {
        self.inner.outstanding.value()
    }

    /// Tokens currently idle.
    pub fn idle_tokens(&self) -> usize {
        self.inner.state.lock().expect("gate lock poisoned").idle.len()
    }

    pub fn max_tokens(&self) -> usize {
        self.inner.max_tokens
    }

    pub fn max_queued(&self) -> usize {
        self.inner.max_queued
    }

    /// Resolve once every token has been released back to idle.
    pub async fn wait_drain(&self) {
        self.inner.outstanding.await_zero().await;
    }
}
