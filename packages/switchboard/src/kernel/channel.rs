//! Single-consumer FIFO with an optional drop-oldest capacity.
//!
//! Producers `push` from any task; one consumer at a time awaits `next`.
//! Aborting the channel makes `push` a no-op and fails any pending or
//! future `next` with [`ChannelAborted`] until the channel is `reset`.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;

/// Error returned by [`Channel::next`] when the channel has been aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel aborted")]
pub struct ChannelAborted;

/// Callback invoked with values evicted by the capacity bound.
pub type DropFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// An ordered queue of `T` with single-consumer semantics.
pub struct Channel<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    max: Option<usize>,
    on_drop: Option<DropFn<T>>,
}

struct State<T> {
    queue: VecDeque<T>,
    aborted: bool,
}

impl<T> Channel<T> {
    /// Create an unbounded channel.
    pub fn new() -> Self {
        Self::bounded(None, None)
    }

    /// Create a channel that keeps at most `max` queued values, evicting the
    /// oldest on overflow. Evicted values are handed to `on_drop` if set.
    pub fn bounded(max: Option<usize>, on_drop: Option<DropFn<T>>) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                aborted: false,
            }),
            notify: Notify::new(),
            max,
            on_drop,
        }
    }

    /// Enqueue a value. Returns whether the value was accepted.
    ///
    /// An aborted channel drops the value immediately and returns `false`.
    /// Overflowing the capacity still accepts the new value; the oldest
    /// queued value is evicted instead.
    pub fn push(&self, value: T) -> bool {
        let evicted = {
            let mut state = self.state.lock().expect("channel lock poisoned");
            if state.aborted {
                return false;
            }
            state.queue.push_back(value);
            match self.max {
                Some(max) if state.queue.len() > max => state.queue.pop_front(),
                _ => None,
            }
        };
        if let (Some(old), Some(on_drop)) = (evicted, self.on_drop.as_ref()) {
            on_drop(old);
        }
        self.notify.notify_one();
        true
    }

    /// Take the oldest value, waiting while the channel is empty.
    pub async fn next(&self) -> Result<T, ChannelAborted> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().expect("channel lock poisoned");
                if let Some(value) = state.queue.pop_front() {
                    return Ok(value);
                }
                if state.aborted {
                    return Err(ChannelAborted);
                }
            }
            notified.await;
        }
    }

    /// Remove a specific value if it is still queued.
    pub fn cancel(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let mut state = self.state.lock().expect("channel lock poisoned");
        if let Some(pos) = state.queue.iter().position(|queued| queued == value) {
            state.queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Abort the channel: `push` starts dropping, `next` starts failing.
    pub fn abort(&self) {
        self.state.lock().expect("channel lock poisoned").aborted = true;
        self.notify.notify_waiters();
    }

    /// Re-arm an aborted channel.
    pub fn reset(&self) {
        self.state.lock().expect("channel lock poisoned").aborted = false;
    }

    /// Drop all queued values.
    pub fn clear(&self) {
        self.state
            .lock()
            .expect("channel lock poisoned")
            .queue
            .clear();
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.state.lock().expect("channel lock poisoned").queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the channel is currently aborted.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().expect("channel lock poisoned").aborted
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}
