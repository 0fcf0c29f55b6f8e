//! Server-to-server messaging over a shared broadcast bus.
//!
//! Every node registers a name and sees every envelope on the bus,
//! discarding those addressed to neither `"all"` nor itself. Requests ride
//! the same correlator as the other transports; responses come back
//! addressed to the requester's name.
//!
//! The bus primitive itself is the [`ClusterBus`] seam with two
//! implementations: [`NatsBus`] for production and [`MemoryBus`] for
//! in-process wiring and tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::kernel::{AbortReason, Scheduler};
use crate::rpc::{
    dispatch, format_notify, parse_value, Correlator, DispatchTarget, Registry, ReplySink,
    RequestError,
};

/// The reserved broadcast address.
pub const BROADCAST: &str = "all";

/// One message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub from: String,
    pub to: String,
    pub payload: Value,
}

/// Inbound side of a bus subscription.
pub struct BusSubscription {
    rx: mpsc::Receiver<BusEnvelope>,
}

impl BusSubscription {
    pub fn new(rx: mpsc::Receiver<BusEnvelope>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<BusEnvelope> {
        self.rx.recv().await
    }
}

/// The cluster transport seam: deliver an envelope to every node.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    async fn publish(&self, envelope: BusEnvelope) -> anyhow::Result<()>;

    async fn subscribe(&self) -> anyhow::Result<BusSubscription>;
}

// =============================================================================
// In-process bus
// =============================================================================

/// Broadcast-channel bus for tests and single-process clusters.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<BusEnvelope>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(256).0,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterBus for MemoryBus {
    async fn publish(&self, envelope: BusEnvelope) -> anyhow::Result<()> {
        // No subscribers is fine; the envelope just evaporates.
        let _ = self.tx.send(envelope);
        Ok(())
    }

    async fn subscribe(&self) -> anyhow::Result<BusSubscription> {
        let mut source = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus subscriber lagged, envelopes dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(BusSubscription::new(rx))
    }
}

// =============================================================================
// NATS bus
// =============================================================================

/// Cluster bus over a single NATS subject.
pub struct NatsBus {
    client: async_nats::Client,
    subject: String,
}

impl NatsBus {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }

    /// Connect to a NATS server and bind the bus subject.
    pub async fn connect(url: &str, subject: impl Into<String>) -> anyhow::Result<Self> {
        let client = async_nats::connect(url).await?;
        Ok(Self::new(client, subject))
    }
}

#[async_trait]
impl ClusterBus for NatsBus {
    async fn publish(&self, envelope: BusEnvelope) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&envelope)?;
        self.client
            .publish(self.subject.clone(), bytes::Bytes::from(payload))
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> anyhow::Result<BusSubscription> {
        let mut subscriber = self.client.subscribe(self.subject.clone()).await?;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                match serde_json::from_slice::<BusEnvelope>(&message.payload) {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(error = %error, "dropping malformed bus envelope");
                    }
                }
            }
        });
        Ok(BusSubscription::new(rx))
    }
}

// =============================================================================
// Node
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("node name must not be empty")]
    EmptyName,
    #[error("node name {0:?} is reserved")]
    ReservedName(String),
}

struct BusNodeInner {
    name: String,
    bus: Arc<dyn ClusterBus>,
    registry: Arc<Registry>,
    correlator: Correlator,
    scheduler: Scheduler,
    default_timeout: Option<Duration>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// A named participant on the bus. Cheap to clone.
#[derive(Clone)]
pub struct BusNode {
    inner: Arc<BusNodeInner>,
}

impl BusNode {
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn ClusterBus>,
        registry: Arc<Registry>,
        default_timeout: Option<Duration>,
    ) -> Result<Self, BusError> {
        let name = name.into();
        if name.is_empty() {
            return Err(BusError::EmptyName);
        }
        if name == BROADCAST {
            return Err(BusError::ReservedName(name));
        }
        Ok(Self {
            inner: Arc::new(BusNodeInner {
                name,
                bus,
                registry,
                correlator: Correlator::new(),
                scheduler: Scheduler::new(),
                default_timeout,
                pump: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Subscribe and start delivering inbound envelopes.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut subscription = self.inner.bus.subscribe().await?;
        let node = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                node.deliver(envelope);
            }
            debug!(node = %node.inner.name, "bus subscription ended");
        });
        let mut slot = self.inner.pump.lock().expect("bus node lock poisoned");
        if let Some(previous) = slot.replace(pump) {
            previous.abort();
        }
        Ok(())
    }

    /// Route one inbound envelope. Anything addressed to neither `"all"`
    /// nor this node is ignored.
    fn deliver(&self, envelope: BusEnvelope) {
        if envelope.to != BROADCAST && envelope.to != self.inner.name {
            return;
        }
        let frame = match parse_value(envelope.payload) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(node = %self.inner.name, error = %error, "dropping malformed frame");
                return;
            }
        };
        let target = DispatchTarget {
            registry: self.inner.registry.clone(),
            scheduler: self.inner.scheduler.clone(),
            gate: None,
            correlator: Some(self.inner.correlator.clone()),
            sender: Some(envelope.from.clone()),
            default_limited: false,
        };
        let sink = Arc::new(BusReplySink {
            bus: self.inner.bus.clone(),
            from: self.inner.name.clone(),
            to: envelope.from,
        });
        tokio::spawn(dispatch(frame, target, sink));
    }

    /// Notify every node on the bus.
    pub async fn broadcast(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.publish(BROADCAST, format_notify(method, params)).await
    }

    /// Notify one node by name.
    pub async fn notify(&self, to: &str, method: &str, params: Value) -> anyhow::Result<()> {
        self.publish(to, format_notify(method, params)).await
    }

    /// Request from one node by name, with the node's default timeout.
    pub async fn request(
        &self,
        to: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RequestError> {
        self.request_with_timeout(to, method, params, self.inner.default_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        to: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RequestError> {
        let (frame, pending) = self.inner.correlator.create_request(method, params, timeout);
        let publish = self.publish(to, frame);
        let outcome = self
            .inner
            .scheduler
            .race(async move {
                if let Err(error) = publish.await {
                    return Err(RequestError::Transport(error.to_string()));
                }
                pending.wait().await
            })
            .await;
        match outcome {
            Ok(result) => result,
            Err(aborted) => Err(RequestError::Aborted(aborted.0)),
        }
    }

    async fn publish(&self, to: &str, payload: Value) -> anyhow::Result<()> {
        self.inner
            .bus
            .publish(BusEnvelope {
                from: self.inner.name.clone(),
                to: to.to_string(),
                payload,
            })
            .await
    }

    /// Stop delivering inbound envelopes.
    pub fn stop(&self) {
        if let Some(pump) = self
            .inner
            .pump
            .lock()
            .expect("bus node lock poisoned")
            .take()
        {
            pump.abort();
        }
    }

    /// Abort in-flight handlers and outstanding requests.
    pub fn abort(&self, reason: impl Into<AbortReason>) {
        let reason = reason.into();
        self.inner.scheduler.abort(reason.clone());
        self.inner.correlator.abort_all(reason);
    }

    pub async fn wait_drain(&self) {
        self.inner.scheduler.wait_drain().await;
        self.inner.correlator.await_drain().await;
    }
}

struct BusReplySink {
    bus: Arc<dyn ClusterBus>,
    from: String,
    to: String,
}

#[async_trait]
impl ReplySink for BusReplySink {
    async fn send(&self, frame: Value) -> anyhow::Result<()> {
        self.bus
            .publish(BusEnvelope {
                from: self.from.clone(),
                to: self.to.clone(),
                payload: frame,
            })
            .await
    }
}
