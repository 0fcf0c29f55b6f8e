//! Method registry: maps method names to boxed async handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::kernel::Scheduler;

/// What a handler produced.
pub enum Outcome {
    /// Nothing to send back.
    None,
    /// A plain result value, replied to id-bearing requests.
    Value(Value),
    /// Respond out-of-band as a notification; the id gets no reply.
    Notify { method: String, params: Value },
    /// HTTP envelope: status and headers applied by the HTTP adapter,
    /// `result` serialized as the JSON-RPC result.
    Http {
        status: u16,
        headers: Vec<(String, String)>,
        result: Value,
    },
}

impl Outcome {
    pub fn value(value: impl Into<Value>) -> Self {
        Outcome::Value(value.into())
    }

    pub fn notify(method: impl Into<String>, params: impl Into<Value>) -> Self {
        Outcome::Notify {
            method: method.into(),
            params: params.into(),
        }
    }
}

/// Context handed to every handler invocation.
#[derive(Clone)]
pub struct HandlerContext {
    /// The fresh child scheduler this invocation runs under.
    pub scheduler: Scheduler,
    /// The sending peer's identity; `None` on the HTTP transport.
    pub sender: Option<String>,
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Outcome>>;
pub type HandlerFn = Arc<dyn Fn(Value, HandlerContext) -> HandlerFuture + Send + Sync>;

/// A registered handler with optional overrides.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: HandlerFn,
    /// Run under this scheduler instead of the transport's.
    pub parent: Option<Scheduler>,
    /// Override the transport's default gating policy.
    pub limited: Option<bool>,
}

impl HandlerEntry {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |params, context| Box::pin(handler(params, context))),
            parent: None,
            limited: None,
        }
    }

    pub fn with_parent(mut self, parent: Scheduler) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn limited(mut self, limited: bool) -> Self {
        self.limited = Some(limited);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("method {0:?} is already registered")]
    Duplicate(String),
}

/// Method name to handler mapping. Registration happens at startup; the
/// table is effectively immutable at steady state.
#[derive(Default)]
pub struct Registry {
    handlers: RwLock<HashMap<String, HandlerEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bare handler function under `method`.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
    {
        self.register_entry(method, HandlerEntry::new(handler))
    }

    /// Register a handler entry with overrides.
    pub fn register_entry(
        &self,
        method: impl Into<String>,
        entry: HandlerEntry,
    ) -> Result<(), RegistryError> {
        let method = method.into();
        let mut handlers = self.handlers.write().expect("registry lock poisoned");
        if handlers.contains_key(&method) {
            return Err(RegistryError::Duplicate(method));
        }
        handlers.insert(method, entry);
        Ok(())
    }

    /// Remove a registration. Returns false when the method was not present.
    pub fn unregister(&self, method: &str) -> bool {
        self.handlers
            .write()
            .expect("registry lock poisoned")
            .remove(method)
            .is_some()
    }

    pub fn get(&self, method: &str) -> Option<HandlerEntry> {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .get(method)
            .cloned()
    }

    pub fn is_registered(&self, method: &str) -> bool {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .contains_key(method)
    }

    pub fn methods(&self) -> Vec<String> {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
