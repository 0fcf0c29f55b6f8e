//! Bidirectional JSON-RPC over a message-oriented socket.
//!
//! Client and server share one [`Peer`] state machine: a socket behind the
//! [`FrameSocket`] seam, a scheduler rooted at the transport, an optional
//! gate, the handler registry, and a per-peer correlator. Reconnection
//! reuses the same peer: a disconnect aborts its scheduler with
//! `"disconnect"` and detaches it, a connect resumes and reattaches it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::kernel::{AbortReason, Channel, Gate, Scheduler};
use crate::rpc::{
    dispatch, format_notify, parse_value, Correlator, DispatchTarget, Registry, ReplySink,
    RequestError,
};

/// Abort reason recorded when a peer's socket drops.
pub const DISCONNECT: &str = "disconnect";

/// Abort reason used when a new connection reuses a live socket id.
pub const REPEAT_SOCKET_ID: &str = "repeat-socket-id";

/// The send/close primitive the duplex transport consumes. Inbound frames
/// are pushed into the core by the transport glue calling
/// [`Peer::handle_frame`].
#[async_trait]
pub trait FrameSocket: Send + Sync {
    /// The socket id assigned by the transport; it is the peer's identity.
    fn id(&self) -> &str;

    /// Send one frame to the remote end.
    async fn send(&self, frame: Value) -> anyhow::Result<()>;

    /// Tear the connection down without reconnection intent.
    async fn close(&self);
}

/// Peer lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connect,
    Disconnect,
}

struct PeerInner {
    socket: RwLock<Arc<dyn FrameSocket>>,
    scheduler: Scheduler,
    gate: Option<Gate>,
    registry: Arc<Registry>,
    correlator: Correlator,
    events: broadcast::Sender<PeerEvent>,
    default_timeout: Option<Duration>,
}

/// One bidirectional endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub fn new(
        socket: Arc<dyn FrameSocket>,
        parent: &Scheduler,
        registry: Arc<Registry>,
        gate: Option<Gate>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                socket: RwLock::new(socket),
                scheduler: parent.child(),
                gate,
                registry,
                correlator: Correlator::new(),
                events: broadcast::channel(16).0,
                default_timeout,
            }),
        }
    }

    fn socket(&self) -> Arc<dyn FrameSocket> {
        self.inner.socket.read().expect("peer lock poisoned").clone()
    }

    pub fn socket_id(&self) -> String {
        self.socket().id().to_string()
    }

    /// Point the peer at a fresh socket after a reconnect.
    pub fn rebind(&self, socket: Arc<dyn FrameSocket>) {
        *self.inner.socket.write().expect("peer lock poisoned") = socket;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    /// Whether two handles refer to the same peer.
    pub fn same_peer(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // Lifecycle events from the transport
    // =========================================================================

    /// The socket (re)connected. A scheduler previously aborted by a
    /// disconnect is resumed, and the node reattaches to the transport's
    /// abort broadcast.
    pub fn handle_connect(&self) {
        if let Some(reason) = self.inner.scheduler.local_reason() {
            if reason.as_str() == DISCONNECT {
                self.inner.scheduler.resume();
            }
        }
        self.inner.scheduler.recover();
        debug!(socket = %self.socket_id(), "peer connected");
        let _ = self.inner.events.send(PeerEvent::Connect);
    }

    /// The socket dropped. In-flight work aborts with `"disconnect"`;
    /// outstanding correlator entries are left to their timeouts.
    pub fn handle_disconnect(&self) {
        if !self.inner.scheduler.is_aborted() {
            self.inner.scheduler.abort(DISCONNECT);
        }
        self.inner.scheduler.destroy();
        debug!(socket = %self.socket_id(), "peer disconnected");
        let _ = self.inner.events.send(PeerEvent::Disconnect);
    }

    /// A frame arrived from the remote end. Dispatch runs concurrently;
    /// frames start in arrival order.
    pub fn handle_frame(&self, value: Value) {
        let frame = match parse_value(value) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(socket = %self.socket_id(), error = %error, "dropping malformed frame");
                return;
            }
        };
        let target = DispatchTarget {
            registry: self.inner.registry.clone(),
            scheduler: self.inner.scheduler.clone(),
            gate: self.inner.gate.clone(),
            correlator: Some(self.inner.correlator.clone()),
            sender: Some(self.socket_id()),
            default_limited: false,
        };
        let sink = Arc::new(SocketSink {
            socket: self.socket(),
        });
        tokio::spawn(dispatch(frame, target, sink));
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Issue a request with the peer's default timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RequestError> {
        self.request_with_timeout(method, params, self.inner.default_timeout)
            .await
    }

    /// Issue a request. The response future races the peer scheduler, so a
    /// disconnect fails the call with `"disconnect"` even though the
    /// correlator entry survives until its timeout.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RequestError> {
        let (frame, pending) = self
            .inner
            .correlator
            .create_request(method, params, timeout);
        let socket = self.socket();
        let outcome = self
            .inner
            .scheduler
            .race(async move {
                if let Err(error) = socket.send(frame).await {
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

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.socket().send(format_notify(method, params)).await
    }

    /// Command the socket to disconnect without reconnection intent.
    pub async fn close(&self) {
        self.socket().close().await;
    }

    /// Abort both the scheduler and every outstanding request.
    pub fn abort(&self, reason: impl Into<AbortReason>) {
        let reason = reason.into();
        self.inner.scheduler.abort(reason.clone());
        self.inner.correlator.abort_all(reason);
    }

    /// Wait for in-flight handlers, outstanding requests, and gate tokens.
    pub async fn wait_drain(&self) {
        self.inner.scheduler.wait_drain().await;
        self.inner.correlator.await_drain().await;
        if let Some(gate) = &self.inner.gate {
            gate.wait_drain().await;
        }
    }
}

struct SocketSink {
    socket: Arc<dyn FrameSocket>,
}

#[async_trait]
impl ReplySink for SocketSink {
    async fn send(&self, frame: Value) -> anyhow::Result<()> {
        self.socket.send(frame).await
    }
}

// =============================================================================
// Server-side factory
// =============================================================================

struct DuplexServerInner {
    scheduler: Scheduler,
    registry: Arc<Registry>,
    gate: Option<Gate>,
    default_timeout: Option<Duration>,
    peers: Mutex<HashMap<String, Peer>>,
}

/// Accepts sockets and indexes one peer per socket id.
#[derive(Clone)]
pub struct DuplexServer {
    inner: Arc<DuplexServerInner>,
}

impl DuplexServer {
    pub fn new(
        registry: Arc<Registry>,
        gate: Option<Gate>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(DuplexServerInner {
                scheduler: Scheduler::new(),
                registry,
                gate,
                default_timeout,
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Construct a peer for a new socket and index it.
    ///
    /// A socket id already mapping to a live peer evicts it: the old peer
    /// is aborted with `"repeat-socket-id"` and closed before the new one
    /// takes its place.
    pub fn accept(&self, socket: Arc<dyn FrameSocket>) -> Peer {
        let id = socket.id().to_string();
        let evicted = {
            let mut peers = self.inner.peers.lock().expect("peer index lock poisoned");
            peers.remove(&id)
        };
        if let Some(old) = evicted {
            warn!(socket = %id, "socket id already in use, evicting the previous peer");
            old.abort(REPEAT_SOCKET_ID);
            let closing = old.clone();
            tokio::spawn(async move { closing.close().await });
        }

        let peer = Peer::new(
            socket,
            &self.inner.scheduler,
            self.inner.registry.clone(),
            self.inner.gate.clone(),
            self.inner.default_timeout,
        );
        self.inner
            .peers
            .lock()
            .expect("peer index lock poisoned")
            .insert(id.clone(), peer.clone());
        peer.handle_connect();

        // Drop the index entry on disconnect, but only while it still
        // points at this peer and not at a replacement.
        let server = self.clone();
        let watched = peer.clone();
        let mut events = peer.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event == PeerEvent::Disconnect {
                    let mut peers = server
                        .inner
                        .peers
                        .lock()
                        .expect("peer index lock poisoned");
                    if peers.get(&id).is_some_and(|current| current.same_peer(&watched)) {
                        peers.remove(&id);
                    }
                    break;
                }
            }
        });
        peer
    }

    /// Accept a connection and pump its inbound frames into the peer.
    pub fn attach(&self, connection: Connection) -> Peer {
        let peer = self.accept(connection.socket.clone());
        let pumping = peer.clone();
        tokio::spawn(async move {
            while let Ok(frame) = connection.inbound.next().await {
                pumping.handle_frame(frame);
            }
            pumping.handle_disconnect();
        });
        peer
    }

    pub fn peer(&self, socket_id: &str) -> Option<Peer> {
        self.inner
            .peers
            .lock()
            .expect("peer index lock poisoned")
            .get(socket_id)
            .cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.inner
            .peers
            .lock()
            .expect("peer index lock poisoned")
            .len()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Abort every peer and the shared scheduler.
    pub fn abort(&self, reason: impl Into<AbortReason>) {
        let reason = reason.into();
        self.inner.scheduler.abort(reason.clone());
        let peers: Vec<Peer> = self
            .inner
            .peers
            .lock()
            .expect("peer index lock poisoned")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.correlator().abort_all(reason.clone());
        }
    }

    pub async fn wait_drain(&self) {
        self.inner.scheduler.wait_drain().await;
        if let Some(gate) = &self.inner.gate {
            gate.wait_drain().await;
        }
        let peers: Vec<Peer> = self
            .inner
            .peers
            .lock()
            .expect("peer index lock poisoned")
            .values()
            .cloned()
            .collect();
        for peer in peers {
            peer.correlator().await_drain().await;
        }
    }
}

// =============================================================================
// Client-side state machine
// =============================================================================

/// One established connection: the send half plus the inbound frame queue.
/// The queue aborting marks the connection as gone.
pub struct Connection {
    pub socket: Arc<dyn FrameSocket>,
    pub inbound: Arc<Channel<Value>>,
}

/// Dials one connection. The concrete transport lives behind this seam.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Connection>;
}

struct DuplexClientInner {
    connector: Arc<dyn SocketConnector>,
    root: Scheduler,
    peer: Peer,
    reconnect_delay: Duration,
    closing: AtomicBool,
}

/// A client that keeps one peer alive across reconnects.
#[derive(Clone)]
pub struct DuplexClient {
    inner: Arc<DuplexClientInner>,
}

impl DuplexClient {
    /// Dial the first connection and spawn the reconnect loop.
    pub async fn connect(
        connector: Arc<dyn SocketConnector>,
        registry: Arc<Registry>,
        gate: Option<Gate>,
        reconnect_delay: Duration,
        default_timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let connection = connector.connect().await?;
        let root = Scheduler::new();
        let peer = Peer::new(
            connection.socket.clone(),
            &root,
            registry,
            gate,
            default_timeout,
        );
        let client = Self {
            inner: Arc::new(DuplexClientInner {
                connector,
                root,
                peer: peer.clone(),
                reconnect_delay,
                closing: AtomicBool::new(false),
            }),
        };
        peer.handle_connect();
        tokio::spawn(client.clone().run(connection));
        Ok(client)
    }

    /// Pump inbound frames; on socket loss, reconnect after the configured
    /// delay and resume the same peer.
    async fn run(self, mut connection: Connection) {
        loop {
            while let Ok(frame) = connection.inbound.next().await {
                self.inner.peer.handle_frame(frame);
            }
            self.inner.peer.handle_disconnect();
            if self.inner.closing.load(Ordering::SeqCst) {
                return;
            }
            loop {
                tokio::time::sleep(self.inner.reconnect_delay).await;
                if self.inner.closing.load(Ordering::SeqCst) {
                    return;
                }
                match self.inner.connector.connect().await {
                    Ok(next) => {
                        self.inner.peer.rebind(next.socket.clone());
                        self.inner.peer.handle_connect();
                        connection = next;
                        break;
                    }
                    Err(error) => {
                        warn!(error = %error, "reconnect failed, retrying");
                    }
                }
            }
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.inner.peer
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RequestError> {
        self.inner.peer.request(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.inner.peer.notify(method, params).await
    }

    /// Disconnect for good; no reconnection follows.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.peer.close().await;
    }

    pub async fn wait_drain(&self) {
        self.inner.peer.wait_drain().await;
        self.inner.root.wait_drain().await;
    }
}

// =============================================================================
// In-memory socket
// =============================================================================

/// Channel-backed socket for tests and in-process wiring.
pub struct MemorySocket {
    id: String,
    /// Frames this end sends; the remote end's inbound queue.
    outbound: Arc<Channel<Value>>,
    /// Frames arriving at this end.
    inbound: Arc<Channel<Value>>,
}

#[async_trait]
impl FrameSocket for MemorySocket {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, frame: Value) -> anyhow::Result<()> {
        if self.outbound.push(frame) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("socket {} is closed", self.id))
        }
    }

    async fn close(&self) {
        self.outbound.abort();
        self.inbound.abort();
    }
}

/// Build both ends of an in-memory socket. `capacity` bounds each
/// direction's queue, evicting the oldest frame on overflow.
pub fn memory_socket_pair(id: &str, capacity: Option<usize>) -> (Connection, Connection) {
    let a_to_b = Arc::new(Channel::bounded(capacity, None));
    let b_to_a = Arc::new(Channel::bounded(capacity, None));
    let a = Connection {
        socket: Arc::new(MemorySocket {
            id: id.to_string(),
            outbound: a_to_b.clone(),
            inbound: b_to_a.clone(),
        }),
        inbound: b_to_a.clone(),
    };
    let b = Connection {
        socket: Arc::new(MemorySocket {
            id: id.to_string(),
            outbound: b_to_a,
            inbound: a_to_b.clone(),
        }),
        inbound: a_to_b,
    };
    (a, b)
}
