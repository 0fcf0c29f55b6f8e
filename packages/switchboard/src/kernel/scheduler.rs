//! Abort-propagating scheduler tree.
//!
//! A [`Scheduler`] is a node in a forest. Aborting a node records a reason,
//! wakes every in-flight race wait in its subtree, and leaves descendants
//! observing `is_aborted()` through ancestor read-through. Nodes can be
//! detached from the broadcast (`destroy`) and reattached (`recover`),
//! which is how a reconnecting peer resumes a previously dead subtree.
//!
//! Tasks run under a node via [`Scheduler::execute`] and cooperate with
//! cancellation through three primitives:
//! - [`Scheduler::race`] completes when the inner future resolves or the
//!   subtree aborts, whichever happens first.
//! - [`Scheduler::run`] awaits the inner future and observes an abort at
//!   the checkpoint that follows.
//! - [`Scheduler::checkpoint`] is an explicit abort check between long
//!   synchronous stretches.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::Notify;

use super::counter::Counter;

/// The reason attached to a scheduler abort.
///
/// A reason is mandatory and non-empty; there is no absent sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReason(Arc<str>);

impl AbortReason {
    /// Create a reason. Panics on an empty string, which would be
    /// indistinguishable from "no reason" downstream.
    pub fn new(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        assert!(!reason.is_empty(), "abort reason must not be empty");
        Self(reason.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AbortReason {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

impl From<String> for AbortReason {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}

/// Error produced when a suspension point observes an abort.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("aborted: {0}")]
pub struct Aborted(pub AbortReason);

impl Aborted {
    pub fn reason(&self) -> &AbortReason {
        &self.0
    }
}

/// Error returned by [`Scheduler::execute`].
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task observed a scheduler abort and unwound.
    #[error("aborted: {0}")]
    Aborted(AbortReason),
    /// The task failed on its own.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    /// The abort reason, when this is an abort.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            TaskError::Aborted(reason) => Some(reason),
            TaskError::Failed(_) => None,
        }
    }
}

struct Node {
    parent: Option<Weak<Node>>,
    state: Mutex<NodeState>,
    /// Wakes the race waits registered on this node.
    abort_notify: Notify,
    /// Live tasks in this subtree; ancestors are incremented transitively.
    running: Counter,
}

struct NodeState {
    reason: Option<AbortReason>,
    destroyed: bool,
    children: Vec<Weak<Node>>,
}

impl Node {
    /// Wake race waits on this node and fan out to attached children.
    fn signal_abort(&self) {
        self.abort_notify.notify_waiters();
        let children: Vec<Arc<Node>> = {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            state.children.retain(|child| child.strong_count() > 0);
            state.children.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            let attached = !child.state.lock().expect("scheduler lock poisoned").destroyed;
            if attached {
                child.signal_abort();
            }
        }
    }
}

/// A node in the abort-propagating scheduler forest. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    node: Arc<Node>,
}

impl Scheduler {
    /// Create a root node.
    pub fn new() -> Self {
        Self {
            node: Arc::new(Node {
                parent: None,
                state: Mutex::new(NodeState {
                    reason: None,
                    destroyed: false,
                    children: Vec::new(),
                }),
                abort_notify: Notify::new(),
                running: Counter::new(),
            }),
        }
    }

    /// Create a child subscribed to this node's abort broadcast.
    pub fn child(&self) -> Scheduler {
        let node = Arc::new(Node {
            parent: Some(Arc::downgrade(&self.node)),
            state: Mutex::new(NodeState {
                reason: None,
                destroyed: false,
                children: Vec::new(),
            }),
            abort_notify: Notify::new(),
            running: Counter::new(),
        });
        let mut state = self.node.state.lock().expect("scheduler lock poisoned");
        state.children.retain(|child| child.strong_count() > 0);
        state.children.push(Arc::downgrade(&node));
        Scheduler { node }
    }

    /// Whether two handles point at the same node.
    pub fn same_node(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    // =========================================================================
    // Abort state
    // =========================================================================

    /// Record `reason` on this node and synchronously wake every race wait
    /// in the attached subtree before returning.
    pub fn abort(&self, reason: impl Into<AbortReason>) {
        let reason = reason.into();
        self.node
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .reason = Some(reason);
        self.node.signal_abort();
    }

    /// Clear the local reason. Ancestor reasons still apply, so
    /// `is_aborted()` may remain true.
    pub fn resume(&self) {
        self.node
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .reason = None;
    }

    /// The effective reason: the local one, or the nearest ancestor's.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        let mut node = self.node.clone();
        loop {
            if let Some(reason) = node
                .state
                .lock()
                .expect("scheduler lock poisoned")
                .reason
                .clone()
            {
                return Some(reason);
            }
            match node.parent.as_ref().and_then(Weak::upgrade) {
                Some(parent) => node = parent,
                None => return None,
            }
        }
    }

    /// The reason set on this node itself, ignoring ancestors.
    pub fn local_reason(&self) -> Option<AbortReason> {
        self.node
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .reason
            .clone()
    }

    /// True when this node or any ancestor carries a reason.
    pub fn is_aborted(&self) -> bool {
        self.abort_reason().is_some()
    }

    // =========================================================================
    // Attachment
    // =========================================================================

    /// Detach from the parent's abort broadcast. Idempotent. Reason
    /// read-through is unaffected; only the race-wait wakeups stop.
    pub fn destroy(&self) {
        self.node
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .destroyed = true;
    }

    /// Reattach to the parent's abort broadcast. Idempotent.
    pub fn recover(&self) {
        self.node
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .destroyed = false;
    }

    /// Whether this node is currently detached.
    pub fn is_destroyed(&self) -> bool {
        self.node
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .destroyed
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Run a task under this node.
    ///
    /// The live-task counter on this node and every ancestor is held for
    /// the duration. An [`Aborted`] bubbling out of the task surfaces as
    /// [`TaskError::Aborted`]; any other failure as [`TaskError::Failed`].
    /// Destroyed nodes refuse to start new tasks.
    pub async fn execute<F, T>(&self, task: F) -> Result<T, TaskError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        if self.is_destroyed() {
            return Err(TaskError::Failed(anyhow::anyhow!(
                "cannot start a task on a destroyed scheduler node"
            )));
        }
        let _guard = RunningGuard::enter(&self.node);
        match task.await {
            Ok(value) => Ok(value),
            Err(error) => match error.downcast::<Aborted>() {
                Ok(aborted) => Err(TaskError::Aborted(aborted.0)),
                Err(error) => Err(TaskError::Failed(error)),
            },
        }
    }

    /// Resolve once this node's live-task counter reaches zero.
    pub async fn wait_drain(&self) {
        self.node.running.await_zero().await;
    }

    /// Live tasks currently accounted to this node's subtree.
    pub fn tasks(&self) -> u64 {
        self.node.running.value()
    }

    // =========================================================================
    // Suspension points
    // =========================================================================

    /// Fail fast if the subtree is aborted.
    pub fn checkpoint(&self) -> Result<(), Aborted> {
        match self.abort_reason() {
            Some(reason) => Err(Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Await `fut`, then observe any abort at the trailing checkpoint.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Aborted> {
        let output = fut.await;
        self.checkpoint()?;
        Ok(output)
    }

    /// Await `fut` or the subtree abort, whichever happens first.
    ///
    /// On abort the inner future is abandoned while still pending; callers
    /// holding a resource inside it (a timer, a connection) clean it up on
    /// their unwind path.
    pub async fn race<F: Future>(&self, fut: F) -> Result<F::Output, Aborted> {
        let notified = self.node.abort_notify.notified();
        tokio::pin!(notified);
        // Register before checking so an abort between the check and the
        // select cannot be missed.
        notified.as_mut().enable();
        if let Some(reason) = self.abort_reason() {
            return Err(Aborted(reason));
        }
        tokio::select! {
            biased;
            _ = &mut notified => {
                let reason = self
                    .abort_reason()
                    .unwrap_or_else(|| AbortReason::new("aborted"));
                Err(Aborted(reason))
            }
            output = fut => Ok(output),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("aborted", &self.is_aborted())
            .field("destroyed", &self.is_destroyed())
            .field("tasks", &self.tasks())
            .finish()
    }
}

/// Holds the live-task counter on a node and all its ancestors.
struct RunningGuard {
    counters: Vec<Counter>,
}

impl RunningGuard {
    fn enter(node: &Arc<Node>) -> Self {
        let mut counters = Vec::new();
        let mut current = node.clone();
        loop {
            counters.push(current.running.clone());
            match current.parent.as_ref().and_then(Weak::upgrade) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        for counter in &counters {
            counter.increment(1);
        }
        Self { counters }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        for counter in &self.counters {
            counter.decrement(1);
        }
    }
}
