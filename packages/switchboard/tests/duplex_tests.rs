//! End-to-end tests for the duplex transport over in-memory sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use switchboard::kernel::Gate;
use switchboard::rpc::{HandlerContext, HandlerEntry, Outcome, Registry, RequestError};
use switchboard::transport::{
    memory_socket_pair, Connection, DuplexClient, DuplexServer, FrameSocket, PeerEvent,
    SocketConnector, DISCONNECT,
};

/// Dials a fresh in-memory pair per attempt, attaching the far end to the
/// server, and remembers the last socket so tests can kill it.
struct MemoryConnector {
    server: DuplexServer,
    socket_id: String,
    last: Mutex<Option<Arc<dyn FrameSocket>>>,
}

impl MemoryConnector {
    fn new(server: DuplexServer, socket_id: &str) -> Arc<Self> {
        Arc::new(Self {
            server,
            socket_id: socket_id.to_string(),
            last: Mutex::new(None),
        })
    }

    fn last_socket(&self) -> Arc<dyn FrameSocket> {
        self.last.lock().unwrap().clone().expect("no connection yet")
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self) -> anyhow::Result<Connection> {
        let (client_end, server_end) = memory_socket_pair(&self.socket_id, None);
        self.server.attach(server_end);
        *self.last.lock().unwrap() = Some(client_end.socket.clone());
        Ok(client_end)
    }
}

fn echo_server() -> DuplexServer {
    let registry = Arc::new(Registry::new());
    registry
        .register("echo", |params, _cx| async move { Ok(Outcome::Value(params)) })
        .unwrap();
    DuplexServer::new(registry, None, Some(Duration::from_secs(5)))
}

async fn connect_client(
    connector: Arc<MemoryConnector>,
    reconnect_delay: Duration,
) -> DuplexClient {
    DuplexClient::connect(
        connector,
        Arc::new(Registry::new()),
        None,
        reconnect_delay,
        Some(Duration::from_secs(5)),
    )
    .await
    .expect("initial connect")
}

#[tokio::test]
async fn echo_round_trip() {
    let server = echo_server();
    let connector = MemoryConnector::new(server.clone(), "sock-1");
    let client = connect_client(connector, Duration::from_millis(50)).await;

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        client.request("echo", json!("wuhu")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result, json!("wuhu"));

    tokio::time::timeout(Duration::from_secs(1), client.wait_drain())
        .await
        .unwrap();
}

#[tokio::test]
async fn reconnect_reuses_the_same_peer() {
    let server = echo_server();
    let connector = MemoryConnector::new(server.clone(), "sock-2");
    let client = connect_client(connector.clone(), Duration::from_millis(50)).await;
    let mut events = client.peer().subscribe();

    let first = client.request("echo", json!("wuhu")).await.unwrap();
    assert_eq!(first, json!("wuhu"));

    // Forcibly destroy the underlying socket; the client reconnects after
    // its delay and keeps using the same peer object.
    connector.last_socket().close().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = tokio::time::timeout(
        Duration::from_secs(1),
        client.request("echo", json!("wuhu")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(second, json!("wuhu"));

    // Exactly one disconnect and one connect in between.
    assert_eq!(events.try_recv().unwrap(), PeerEvent::Disconnect);
    assert_eq!(events.try_recv().unwrap(), PeerEvent::Connect);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn in_flight_request_fails_on_disconnect() {
    let registry = Arc::new(Registry::new());
    registry
        .register("hang", |_params, cx: HandlerContext| async move {
            cx.scheduler
                .race(tokio::time::sleep(Duration::from_secs(10)))
                .await?;
            Ok(Outcome::None)
        })
        .unwrap();
    let server = DuplexServer::new(registry, None, None);
    let connector = MemoryConnector::new(server.clone(), "sock-3");
    let client = connect_client(connector.clone(), Duration::from_secs(30)).await;

    let requesting = {
        let client = client.clone();
        tokio::spawn(async move { client.request("hang", json!(null)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    connector.last_socket().close().await;

    let result = tokio::time::timeout(Duration::from_secs(1), requesting)
        .await
        .expect("request must fail fast on disconnect")
        .unwrap();
    match result {
        Err(RequestError::Aborted(reason)) => assert_eq!(reason.as_str(), DISCONNECT),
        other => panic!("expected disconnect abort, got {other:?}"),
    }
}

#[tokio::test]
async fn saturated_gate_replies_server_busy() {
    let registry = Arc::new(Registry::new());
    registry
        .register_entry(
            "slow",
            HandlerEntry::new(|_params, _cx| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(Outcome::value(json!("done")))
            })
            .limited(true),
        )
        .unwrap();
    let server = DuplexServer::new(registry, Some(Gate::new(1, 0)), None);
    let connector = MemoryConnector::new(server.clone(), "sock-4");
    let client = connect_client(connector, Duration::from_millis(50)).await;

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.request("slow", json!(null)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = client.request("slow", json!(null)).await;
    match second {
        Err(RequestError::Rpc(error)) => assert_eq!(error.code, -32000),
        other => panic!("expected server-busy error, got {other:?}"),
    }

    let first: Result<Value, RequestError> = tokio::time::timeout(Duration::from_secs(1), first)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.unwrap(), json!("done"));
}

#[tokio::test]
async fn close_does_not_reconnect() {
    let server = echo_server();
    let connector = MemoryConnector::new(server.clone(), "sock-5");
    let client = connect_client(connector, Duration::from_millis(20)).await;
    let mut events = client.peer().subscribe();

    client.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(events.try_recv().unwrap(), PeerEvent::Disconnect);
    assert!(events.try_recv().is_err(), "no reconnect after close");
    assert!(client.peer().scheduler().is_aborted());
}
