//! The inbound dispatch pipeline shared by every transport.
//!
//! A decoded frame flows through one routine: responses go to the
//! correlator, requests and notifications resolve a handler, optionally
//! take a gate token, run under a fresh child scheduler, and map their
//! outcome back onto the wire.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::kernel::{Acquired, Gate, GateError, Scheduler, TaskError, Token};

use super::correlator::Correlator;
use super::frame::{format_error, format_notify, format_result, ErrorCode, ErrorObject, Frame};
use super::registry::{HandlerContext, Outcome, Registry};

/// Abort reason used when an HTTP client drops mid-request. Handler
/// failures carrying it are swallowed instead of reported.
pub const CLIENT_DISCONNECTED: &str = "disconnected";

/// Where outbound frames for one inbound frame go.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, frame: Value) -> anyhow::Result<()>;

    /// HTTP envelope hook; transports without statuses ignore it.
    fn apply_http(&self, _status: u16, _headers: &[(String, String)]) {}
}

/// Everything dispatch needs from the owning transport. Cheap to clone.
#[derive(Clone)]
pub struct DispatchTarget {
    pub registry: Arc<Registry>,
    pub scheduler: Scheduler,
    pub gate: Option<Gate>,
    pub correlator: Option<Correlator>,
    /// Sending peer identity; `None` on the HTTP transport.
    pub sender: Option<String>,
    /// Gating policy for bare handlers without a `limited` override.
    pub default_limited: bool,
}

/// Run one inbound frame to completion.
pub async fn dispatch(frame: Frame, target: DispatchTarget, reply: Arc<dyn ReplySink>) {
    match frame {
        Frame::Response { id, result } => {
            let matched = target
                .correlator
                .as_ref()
                .map(|correlator| correlator.deliver_response(&id, result))
                .unwrap_or(false);
            if !matched {
                warn!(id = %id, "response with no matching request, dropping");
            }
        }
        Frame::Request { id, method, params } => {
            handle_call(Some(id), method, params, target, reply).await;
        }
        Frame::Notify { method, params } => {
            handle_call(None, method, params, target, reply).await;
        }
    }
}

async fn handle_call(
    id: Option<String>,
    method: String,
    params: Value,
    target: DispatchTarget,
    reply: Arc<dyn ReplySink>,
) {
    let Some(entry) = target.registry.get(&method) else {
        match &id {
            Some(id) => {
                send_frame(
                    &reply,
                    format_error(Some(id), &ErrorObject::from(ErrorCode::MethodNotFound)),
                )
                .await;
            }
            None => debug!(method = %method, "notification for unregistered method, dropping"),
        }
        return;
    };

    let parent = entry.parent.clone().unwrap_or_else(|| target.scheduler.clone());
    let limited = entry.limited.unwrap_or(target.default_limited);

    // Take a token up front so a saturated gate never invokes the handler.
    let mut token: Option<Token> = None;
    if limited {
        if let Some(gate) = &target.gate {
            match gate.acquire() {
                Ok(Acquired::Ready(t)) => token = Some(t),
                Ok(Acquired::Queued(queued)) => match queued.wait().await {
                    Ok(t) => token = Some(t),
                    Err(error) => {
                        reply_busy(&id, &method, &error, &reply).await;
                        return;
                    }
                },
                Err(error) => {
                    reply_busy(&id, &method, &error, &reply).await;
                    return;
                }
            }
        }
    }

    let child = parent.child();
    let context = HandlerContext {
        scheduler: child.clone(),
        sender: target.sender.clone(),
    };
    let handler = entry.handler.clone();

    if let Some(t) = token.as_mut() {
        t.start_work();
    }
    let result = child.execute((handler)(params, context)).await;
    if let Some(mut t) = token.take() {
        t.finish_work();
        if let Some(gate) = &target.gate {
            gate.release(t);
        }
    }
    child.destroy();

    match result {
        Ok(Outcome::Notify { method, params }) => {
            // Out-of-band reply: the id gets nothing.
            send_frame(&reply, format_notify(&method, params)).await;
        }
        Ok(Outcome::Http {
            status,
            headers,
            result,
        }) => {
            reply.apply_http(status, &headers);
            match &id {
                Some(id) => send_frame(&reply, format_result(id, result)).await,
                None => warn!(method = %method, "handler answered a notification, discarding"),
            }
        }
        Ok(Outcome::Value(value)) => match &id {
            Some(id) => send_frame(&reply, format_result(id, value)).await,
            None => warn!(method = %method, "handler answered a notification, discarding"),
        },
        Ok(Outcome::None) => {}
        Err(TaskError::Aborted(reason)) => {
            if reason.as_str() == CLIENT_DISCONNECTED {
                debug!(method = %method, "request abandoned by client disconnect");
            } else if let Some(id) = &id {
                let error = ErrorObject::new(ErrorCode::Internal.code(), reason.to_string());
                send_frame(&reply, format_error(Some(id), &error)).await;
            } else {
                debug!(method = %method, reason = %reason, "notification handler aborted");
            }
        }
        Err(TaskError::Failed(error)) => {
            warn!(method = %method, error = %error, "handler failed");
            if let Some(id) = &id {
                send_frame(&reply, format_error(Some(id), &ErrorObject::normalize(&error))).await;
            }
        }
    }
}

async fn reply_busy(
    id: &Option<String>,
    method: &str,
    error: &GateError,
    reply: &Arc<dyn ReplySink>,
) {
    match id {
        Some(id) => {
            debug!(method = %method, error = %error, "gate saturated, refusing request");
            send_frame(reply, format_error(Some(id), &ErrorObject::from(ErrorCode::Server))).await;
        }
        None => debug!(method = %method, error = %error, "gate saturated, dropping notification"),
    }
}

async fn send_frame(reply: &Arc<dyn ReplySink>, frame: Value) {
    if let Err(error) = reply.send(frame).await {
        warn!(error = %error, "failed to send outbound frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::frame::parse_value;
    use crate::rpc::registry::HandlerEntry;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn send(&self, frame: Value) -> anyhow::Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<Value> {
            self.frames.lock().unwrap().clone()
        }
    }

    fn target(registry: Arc<Registry>, gate: Option<Gate>) -> DispatchTarget {
        DispatchTarget {
            registry,
            scheduler: Scheduler::new(),
            gate,
            correlator: None,
            sender: None,
            default_limited: true,
        }
    }

    fn request(id: &str, method: &str, params: Value) -> Frame {
        Frame::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn echo_request_gets_result() {
        let registry = Arc::new(Registry::new());
        registry
            .register("echo", |params, _cx| async move { Ok(Outcome::Value(params)) })
            .unwrap();
        let sink = Arc::new(RecordingSink::default());

        dispatch(
            request("1", "echo", json!("wuhu")),
            target(registry, None),
            sink.clone(),
        )
        .await;

        assert_eq!(
            sink.frames(),
            vec![json!({"jsonrpc": "2.0", "id": "1", "result": "wuhu"})]
        );
    }

    #[tokio::test]
    async fn unknown_method_gets_not_found() {
        let registry = Arc::new(Registry::new());
        let sink = Arc::new(RecordingSink::default());

        dispatch(
            request("2", "missing", json!(null)),
            target(registry, None),
            sink.clone(),
        )
        .await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn unknown_method_notification_is_dropped() {
        let registry = Arc::new(Registry::new());
        let sink = Arc::new(RecordingSink::default());

        dispatch(
            Frame::Notify {
                method: "missing".into(),
                params: json!(null),
            },
            target(registry, None),
            sink.clone(),
        )
        .await;

        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn handler_failure_becomes_internal_error() {
        let registry = Arc::new(Registry::new());
        registry
            .register("boom", |_p, _cx| async move {
                Err::<Outcome, _>(anyhow::anyhow!("invalid params"))
            })
            .unwrap();
        let sink = Arc::new(RecordingSink::default());

        dispatch(
            request("2", "boom", json!(1)),
            target(registry, None),
            sink.clone(),
        )
        .await;

        assert_eq!(
            sink.frames(),
            vec![json!({
                "jsonrpc": "2.0",
                "id": "2",
                "error": {"code": -32603, "message": "invalid params"}
            })]
        );
    }

    #[tokio::test]
    async fn notify_outcome_suppresses_id_reply() {
        let registry = Arc::new(Registry::new());
        registry
            .register("echoNotify", |params, _cx| async move {
                Ok(Outcome::notify("echoNotifyResponse", params))
            })
            .unwrap();
        let sink = Arc::new(RecordingSink::default());

        dispatch(
            request("3", "echoNotify", json!("wuhu")),
            target(registry, None),
            sink.clone(),
        )
        .await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        match parse_value(frames[0].clone()).unwrap() {
            Frame::Notify { method, params } => {
                assert_eq!(method, "echoNotifyResponse");
                assert_eq!(params, json!("wuhu"));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn saturated_gate_refuses_without_running_handler() {
        let registry = Arc::new(Registry::new());
        registry
            .register("slow", |_p, _cx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Outcome::None)
            })
            .unwrap();
        // One token, zero queue slots.
        let gate = Gate::new(1, 0);
        let _held = match gate.acquire().unwrap() {
            Acquired::Ready(t) => t,
            Acquired::Queued(_) => unreachable!(),
        };
        let sink = Arc::new(RecordingSink::default());

        dispatch(
            request("4", "slow", json!(null)),
            target(registry, Some(gate)),
            sink.clone(),
        )
        .await;

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["error"]["code"], json!(-32000));
    }

    #[tokio::test]
    async fn disconnected_abort_is_swallowed() {
        let registry = Arc::new(Registry::new());
        registry
            .register("hang", |_p, cx: HandlerContext| async move {
                let scheduler = cx.scheduler.clone();
                match scheduler
                    .race(tokio::time::sleep(Duration::from_secs(10)))
                    .await
                {
                    Ok(_) => Ok(Outcome::value(json!("finished"))),
                    Err(aborted) => Err(aborted.into()),
                }
            })
            .unwrap();

        let parent = Scheduler::new();
        let mut t = target(registry, None);
        t.scheduler = parent.clone();
        let sink = Arc::new(RecordingSink::default());

        let dispatching = tokio::spawn(dispatch(
            request("5", "hang", json!(null)),
            t,
            sink.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        parent.abort(CLIENT_DISCONNECTED);
        tokio::time::timeout(Duration::from_secs(1), dispatching)
            .await
            .unwrap()
            .unwrap();

        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn ungated_entry_skips_a_saturated_gate() {
        let registry = Arc::new(Registry::new());
        registry
            .register_entry(
                "free",
                HandlerEntry::new(|_p, _cx| async move { Ok(Outcome::value(json!("ok"))) })
                    .limited(false),
            )
            .unwrap();
        let gate = Gate::new(1, 0);
        let _held = match gate.acquire().unwrap() {
            Acquired::Ready(t) => t,
            Acquired::Queued(_) => unreachable!(),
        };
        let sink = Arc::new(RecordingSink::default());

        dispatch(
            request("6", "free", json!(null)),
            target(registry, Some(gate)),
            sink.clone(),
        )
        .await;

        assert_eq!(sink.frames()[0]["result"], json!("ok"));
    }
}
