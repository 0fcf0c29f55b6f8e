//! Configuration loaded from environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Runtime configuration for the transports.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address, e.g. `0.0.0.0:8080`.
    pub http_addr: String,
    /// Path of the JSON-RPC POST endpoint.
    pub rpc_path: String,
    /// Concurrent handler executions allowed by the gate.
    pub max_parallel: usize,
    /// Acquirers allowed to queue behind the gate.
    pub max_queued: usize,
    /// Default per-request timeout; `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Grace period for draining in-flight work on shutdown.
    pub drain_deadline: Duration,
    /// Delay between duplex reconnect attempts.
    pub reconnect_delay: Duration,
    /// This process's name on the multi-node bus.
    pub node_name: String,
    /// NATS server URL backing the bus.
    pub nats_url: String,
    /// Subject the bus envelopes travel on.
    pub bus_subject: String,
}

impl Config {
    /// Load configuration from environment variables, reading a `.env`
    /// file first when present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            rpc_path: env::var("RPC_PATH").unwrap_or_else(|_| "/rpc".to_string()),
            max_parallel: env::var("MAX_PARALLEL")
                .unwrap_or_else(|_| "32".to_string())
                .parse()
                .context("MAX_PARALLEL must be a number")?,
            max_queued: env::var("MAX_QUEUED")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .context("MAX_QUEUED must be a number")?,
            request_timeout: parse_timeout_ms(
                &env::var("REQUEST_TIMEOUT_MS").unwrap_or_else(|_| "30000".to_string()),
            )
            .context("REQUEST_TIMEOUT_MS must be a number of milliseconds, or -1 for none")?,
            drain_deadline: Duration::from_millis(
                env::var("DRAIN_DEADLINE_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()
                    .context("DRAIN_DEADLINE_MS must be a number of milliseconds")?,
            ),
            reconnect_delay: Duration::from_millis(
                env::var("RECONNECT_DELAY_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .context("RECONNECT_DELAY_MS must be a number of milliseconds")?,
            ),
            node_name: env::var("NODE_NAME")
                .unwrap_or_else(|_| format!("node-{}", uuid::Uuid::new_v4())),
            nats_url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            bus_subject: env::var("BUS_SUBJECT").unwrap_or_else(|_| "switchboard.bus".to_string()),
        })
    }
}

/// `-1` means no timeout; any other value is milliseconds.
fn parse_timeout_ms(raw: &str) -> Result<Option<Duration>> {
    let ms: i64 = raw.parse()?;
    if ms < 0 {
        Ok(None)
    } else {
        Ok(Some(Duration::from_millis(ms as u64)))
    }
}
