// Minimal JSON-RPC echo server over the HTTP transport.
//
// Run with `cargo run --example echo_server`, then:
//   curl -X POST localhost:8080/rpc \
//     -d '{"jsonrpc":"2.0","id":"1","method":"echo","params":"wuhu"}'

use std::sync::Arc;

use anyhow::{Context, Result};
use switchboard::kernel::Gate;
use switchboard::rpc::{Outcome, Registry};
use switchboard::transport::HttpTransport;
use switchboard::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchboard=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let registry = Arc::new(Registry::new());
    registry
        .register("echo", |params, _cx| async move { Ok(Outcome::Value(params)) })
        .expect("echo registers once");

    let gate = Gate::new(config.max_parallel, config.max_queued);
    let transport = HttpTransport::new(registry, Some(gate), config.rpc_path.clone());

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_addr))?;

    transport.serve(listener, config.drain_deadline).await
}
