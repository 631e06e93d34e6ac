//! Exchange Stream Client Binary
//!
//! Connects to the exchange feed, authenticates when credentials are set,
//! subscribes the configured keys and logs every event until shutdown.
//!
//! # Usage
//!
//! ```bash
//! STREAM_URL=wss://api.example.com/ws/2 \
//! STREAM_SUBSCRIPTIONS=ticker:tBTCUSD,book:tETHUSD:P0 \
//! cargo run --bin exchange-stream-client
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `STREAM_URL`: WebSocket endpoint
//!
//! ## Optional
//! - `STREAM_API_KEY` / `STREAM_API_SECRET`: Credentials for the account channel
//! - `STREAM_SUBSCRIPTIONS`: Comma-separated `channel:instrument[:aux]` keys
//! - `STREAM_BATCH_MODE`: Queue subscription changes (default: false)
//! - `STREAM_RECONNECT_ENABLED`: Reconnect and resubscribe after a drop (default: false)
//! - `STREAM_METRICS_PORT`: Prometheus metrics port (default: 0 = disabled)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: info)

use std::time::Duration;

use exchange_stream_client::infrastructure::exchange::{ReconnectConfig, ReconnectPolicy};
use exchange_stream_client::infrastructure::telemetry;
use exchange_stream_client::{
    ClientConfig, ClientSettings, MarketPayload, StreamClient, StreamEvent, SubscriptionKey,
    init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting exchange stream client");

    let settings = ClientSettings::from_env()?;
    log_settings(&settings);

    if settings.metrics_port > 0 {
        let addr = init_metrics(settings.metrics_port)?;
        tracing::info!(%addr, "Metrics endpoint listening");
    }

    let client = StreamClient::new(
        ClientConfig::from_settings(&settings),
        settings.credentials.clone(),
    );
    let Some(mut events) = client.take_events() else {
        anyhow::bail!("event receiver already taken");
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown.clone()));

    open_session(&client, &settings, &settings.subscriptions, &shutdown).await?;

    let mut policy = ReconnectPolicy::new(ReconnectConfig::from_settings(&settings.reconnect));

    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let StreamEvent::Disconnected { reason, lost } = event else {
            log_event(&event);
            continue;
        };

        if client.is_connected() {
            tracing::debug!(%reason, "Ignoring teardown of a superseded session");
            continue;
        }
        tracing::warn!(%reason, lost = lost.len(), "Session lost");
        if !settings.reconnect.enabled {
            break;
        }
        if !reconnect(&client, &settings, &lost, &mut policy, &shutdown).await {
            break;
        }
    }

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, client.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timed out");
    }

    tracing::info!("Exchange stream client stopped");
    Ok(())
}

/// Connect, authenticate if credentials are configured, and subscribe `keys`.
async fn open_session(
    client: &StreamClient,
    settings: &ClientSettings,
    keys: &[SubscriptionKey],
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let session_id = client.connect(cancel).await?;
    tracing::info!(%session_id, url = %settings.url, "Connected");

    if settings.credentials.is_some() {
        let user_id = client.authenticate(cancel).await?;
        tracing::info!(user_id, "Account channel open");
    }

    for key in keys {
        match client.subscribe(key.clone(), cancel).await {
            Ok(subscription) => tracing::info!(%key, ?subscription, "Subscribed"),
            Err(e) => tracing::warn!(%key, error = %e, kind = %e.kind(), "Subscribe failed"),
        }
    }
    Ok(())
}

/// Retry `open_session` with backoff, resubscribing the keys lost with the
/// previous session. Returns `false` once attempts run out or on shutdown.
async fn reconnect(
    client: &StreamClient,
    settings: &ClientSettings,
    lost: &[SubscriptionKey],
    policy: &mut ReconnectPolicy,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        let Some(delay) = policy.next_delay() else {
            tracing::error!(attempts = policy.attempt_count(), "Reconnect attempts exhausted");
            return false;
        };
        tracing::info!(
            attempt = policy.attempt_count(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting"
        );

        tokio::select! {
            () = shutdown.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }

        match open_session(client, settings, lost, shutdown).await {
            Ok(()) => {
                policy.reset();
                return true;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reconnect failed");
                client.disconnect().await;
            }
        }
    }
}

fn log_event(event: &StreamEvent) {
    match event {
        StreamEvent::Market(market) => match &market.payload {
            MarketPayload::Ticker(ticker) => tracing::info!(
                key = %market.key,
                bid = %ticker.bid,
                ask = %ticker.ask,
                last = %ticker.last_price,
                "Ticker"
            ),
            MarketPayload::Trades(trades) => tracing::info!(
                key = %market.key,
                count = trades.len(),
                snapshot = market.snapshot,
                "Trades"
            ),
            MarketPayload::Book(levels) => tracing::debug!(
                key = %market.key,
                levels = levels.len(),
                snapshot = market.snapshot,
                "Book"
            ),
            MarketPayload::Candles(candles) => tracing::debug!(
                key = %market.key,
                count = candles.len(),
                snapshot = market.snapshot,
                "Candles"
            ),
        },
        StreamEvent::Account(account) => tracing::info!(
            tag = account.tag.as_str(),
            snapshot = account.snapshot,
            "Account update"
        ),
        StreamEvent::Error(error) => {
            tracing::warn!(kind = %error.kind, message = %error.message, "Stream error");
        }
        StreamEvent::Disconnected { reason, lost } => {
            tracing::warn!(%reason, lost = lost.len(), "Disconnected");
        }
    }
}

/// Log the parsed configuration.
fn log_settings(settings: &ClientSettings) {
    tracing::info!(
        url = %settings.url,
        authenticated = settings.credentials.is_some(),
        subscriptions = settings.subscriptions.len(),
        batch_mode = settings.batch_mode,
        reconnect = settings.reconnect.enabled,
        metrics_port = settings.metrics_port,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
