//! duplex-echo - exercises a messenger pair over the in-memory transport.
//!
//! Environment:
//! - `DUPLEX_DEFAULT_TIMEOUT_MS`: request timeout (default 5000)
//! - `DUPLEX_ECHO_REQUESTS`: number of concurrent echo requests (default 16)
//! - `RUST_LOG`: tracing filter

use std::convert::Infallible;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure};
use futures_util::future::join_all;
use rand::Rng;
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duplex_messenger::{memory, Messenger, MessengerConfig};

const MAX_ECHO_DELAY_MS: u64 = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duplex_messenger=debug,duplex_echo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = MessengerConfig::from_env();
    let request_count: u64 = std::env::var("DUPLEX_ECHO_REQUESTS")
        .unwrap_or_else(|_| "16".into())
        .parse()
        .unwrap_or(16);

    tracing::info!(
        timeout_ms = config.default_timeout_ms(),
        requests = request_count,
        "Starting duplex echo"
    );

    let (left, right) = memory::pair();
    let client = Messenger::new(left, config);
    let server = Messenger::new(right, config);

    server.respond("echo", |payload| {
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_ECHO_DELAY_MS));
        async move {
            tokio::time::sleep(delay).await;
            Ok::<_, Infallible>(payload)
        }
    });
    server.respond_sync("refuse", |_payload| Err::<Value, _>("refusing to answer"));

    client.subscribe("status", |payload| {
        tracing::info!(status = %payload, "Status update from server");
    });
    server.publish("status", json!({ "state": "ready" }));

    // Concurrent echoes complete in random order but resolve in call order
    let started = Instant::now();
    let responses = join_all((0..request_count).map(|n| client.request("echo", json!(n)))).await;
    for (expected, response) in (0..request_count).zip(responses) {
        let value = response?;
        ensure!(
            value == json!(expected),
            "echo {expected} came back as {value}"
        );
    }
    tracing::info!(
        count = request_count,
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "All echo requests answered in call order"
    );

    // A faulting responder sends nothing, so the request runs into its timeout
    match client
        .request_with_timeout("refuse", Value::Null, Duration::from_millis(100))
        .await
    {
        Err(e) if e.is_timeout() => tracing::info!(error = %e, "Refused request timed out"),
        other => bail!("expected the refused request to time out, got {other:?}"),
    }

    Ok(())
}
