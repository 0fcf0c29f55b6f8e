//! HTTP transport: JSON-RPC over a single POST endpoint.
//!
//! Three stacked middlewares guard the endpoint: a stopped check, a gate
//! availability check, and the dispatch itself. Handler work is spawned
//! off the connection future so a client disconnect aborts only the
//! per-request scheduler (reason `"disconnected"`) while the handler
//! unwinds cleanly through its race waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Extension, Request};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::kernel::{Gate, Scheduler};
use crate::rpc::{
    dispatch, format_error, parse_bytes, DispatchTarget, ErrorObject, Registry, ReplySink,
    CLIENT_DISCONNECTED,
};

struct HttpShared {
    registry: Arc<Registry>,
    gate: Option<Gate>,
    scheduler: Scheduler,
    stopped: AtomicBool,
    path: String,
}

/// The HTTP-side transport. Cheap to clone.
#[derive(Clone)]
pub struct HttpTransport {
    shared: Arc<HttpShared>,
}

impl HttpTransport {
    pub fn new(registry: Arc<Registry>, gate: Option<Gate>, path: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(HttpShared {
                registry,
                gate,
                scheduler: Scheduler::new(),
                stopped: AtomicBool::new(false),
                path: path.into(),
            }),
        }
    }

    /// Build the router: the RPC endpoint with its middleware stack, plus
    /// a health route.
    pub fn router(&self) -> Router {
        let rpc_routes = Router::new()
            .route(&self.shared.path, post(rpc_handler))
            .layer(middleware::from_fn(check_available))
            .layer(middleware::from_fn(check_stopped));

        Router::new()
            .merge(rpc_routes)
            .route("/health", get(health_handler))
            .layer(Extension(self.shared.clone()))
            .layer(TraceLayer::new_for_http())
    }

    /// Admit new requests.
    pub fn start(&self) {
        self.shared.stopped.store(false, Ordering::SeqCst);
    }

    /// Reject new requests with 503; in-flight requests keep running.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Cancel all in-flight requests.
    pub fn abort(&self, reason: impl Into<crate::kernel::AbortReason>) {
        self.shared.scheduler.abort(reason);
    }

    /// Wait for the scheduler and gate to drain. Returns false when the
    /// deadline passed with work still in flight.
    pub async fn wait_drain(&self, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, async {
            self.shared.scheduler.wait_drain().await;
            if let Some(gate) = &self.shared.gate {
                gate.wait_drain().await;
            }
        })
        .await
        .is_ok()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn gate(&self) -> Option<&Gate> {
        self.shared.gate.as_ref()
    }

    /// Serve until ctrl-c, then stop, drain within `drain_deadline`, and
    /// abort whatever lingers.
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        drain_deadline: Duration,
    ) -> anyhow::Result<()> {
        self.start();
        let app = self.router();
        info!(addr = %listener.local_addr()?, path = %self.shared.path, "rpc endpoint listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.stop();
        if !self.wait_drain(drain_deadline).await {
            warn!("drain deadline exceeded, aborting in-flight requests");
            self.abort("shutdown");
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received shutdown signal");
}

// =============================================================================
// Middlewares
// =============================================================================

async fn check_stopped(
    Extension(shared): Extension<Arc<HttpShared>>,
    request: Request,
    next: Next,
) -> Response {
    if shared.stopped.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    next.run(request).await
}

async fn check_available(
    Extension(shared): Extension<Arc<HttpShared>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(gate) = &shared.gate {
        if gate.available() == 0 {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }
    next.run(request).await
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// =============================================================================
// Dispatch endpoint
// =============================================================================

async fn rpc_handler(Extension(shared): Extension<Arc<HttpShared>>, body: Bytes) -> Response {
    let request_scheduler = shared.scheduler.child();
    let sink = Arc::new(HttpReplySink::default());
    let target = DispatchTarget {
        registry: shared.registry.clone(),
        scheduler: request_scheduler.clone(),
        gate: shared.gate.clone(),
        correlator: None,
        sender: None,
        default_limited: true,
    };

    let guard = DisconnectGuard::new(request_scheduler.clone());
    let work_sink = sink.clone();
    let work = tokio::spawn(async move {
        let frame = match parse_bytes(&body) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(error = %error, "rejecting malformed frame");
                let _ = work_sink
                    .send(format_error(None, &ErrorObject::from(&error)))
                    .await;
                return;
            }
        };
        dispatch(frame, target, work_sink).await;
    });

    // Dropping this await (client disconnect) triggers the guard; the
    // spawned work keeps running and unwinds through the abort.
    let _ = work.await;
    guard.disarm();
    request_scheduler.destroy();

    sink.response()
}

/// Aborts the per-request scheduler when the connection future is dropped
/// before the handler finished.
struct DisconnectGuard {
    scheduler: Option<Scheduler>,
}

impl DisconnectGuard {
    fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler: Some(scheduler),
        }
    }

    fn disarm(mut self) {
        self.scheduler = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            if scheduler.tasks() > 0 {
                scheduler.abort(CLIENT_DISCONNECTED);
            }
            scheduler.destroy();
        }
    }
}

/// Collects the single reply frame (and optional status/header envelope)
/// produced for one HTTP request.
#[derive(Default)]
struct HttpReplySink {
    frame: Mutex<Option<Value>>,
    envelope: Mutex<Option<(u16, Vec<(String, String)>)>>,
}

#[async_trait]
impl ReplySink for HttpReplySink {
    async fn send(&self, frame: Value) -> anyhow::Result<()> {
        let mut slot = self.frame.lock().expect("sink lock poisoned");
        if slot.is_some() {
            warn!("handler produced more than one reply frame, keeping the last");
        }
        *slot = Some(frame);
        Ok(())
    }

    fn apply_http(&self, status: u16, headers: &[(String, String)]) {
        *self.envelope.lock().expect("sink lock poisoned") = Some((status, headers.to_vec()));
    }
}

impl HttpReplySink {
    fn response(&self) -> Response {
        let frame = self.frame.lock().expect("sink lock poisoned").take();
        let (status, headers) = self
            .envelope
            .lock()
            .expect("sink lock poisoned")
            .take()
            .unwrap_or((StatusCode::OK.as_u16(), Vec::new()));

        let mut builder = axum::http::Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8");
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let body = frame.map(|f| f.to_string()).unwrap_or_default();
        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
