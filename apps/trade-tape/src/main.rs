//! Trade Tape Binary
//!
//! Plays a scenario file against a tape backed by the in-memory trader and
//! logs every tape update.
//!
//! # Usage
//!
//! ```bash
//! TAPE_SYMBOL=AAPL TAPE_SCENARIO=scenarios/open.json cargo run --bin trade-tape
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `TAPE_SYMBOL`: symbol bound at startup
//!
//! ## Optional
//! - `TAPE_DEPTH`: tape depth, 1 to 500 (default: 100)
//! - `TAPE_THRESHOLD`: volume threshold, a number or a Rhai expression over
//!   `trade` and `instrument` (default: 0)
//! - `TAPE_DISPLAY_CURRENCY`: show currency in the price header (default: false)
//! - `TAPE_SCENARIO`: scenario file to play
//! - `TAPE_METRICS_ENABLED`: expose Prometheus metrics (default: false)
//! - `TAPE_METRICS_PORT`: metrics port (default: 9090)
//! - `OTEL_ENABLED`: export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: service name (default: trade-tape)
//! - `RUST_LOG`: log filter (default: trade_tape=info)

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use trade_tape::infrastructure::telemetry;
use trade_tape::{AppConfig, LoggingObserver, Scenario, TapeService, init_metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting trade tape");

    let config = AppConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if config.metrics.enabled {
        let addr = init_metrics(config.metrics).context("failed to start metrics exporter")?;
        tracing::info!(%addr, "Metrics exporter listening");
    }

    let scenario = match &config.scenario {
        Some(path) => Scenario::load(path).await?,
        None => {
            tracing::warn!("No TAPE_SCENARIO set, running an empty live-only session");
            Scenario::default()
        }
    };

    let trader = scenario.build_trader();
    let shutdown = CancellationToken::new();

    let handle = TapeService::new(trader.clone(), Arc::new(LoggingObserver))
        .spawn(&config.tape, shutdown.clone())
        .context("invalid tape settings")?;

    handle
        .select_instrument(scenario.instrument(&config.symbol))
        .await?;

    tokio::select! {
        result = scenario.play(&trader, &handle, config.tape.clone()) => {
            result?;
            let snapshot = handle.snapshot().await?;
            tracing::info!(
                state = snapshot.state.as_str(),
                epoch = %snapshot.epoch,
                prints = snapshot.prints.len(),
                header = %snapshot.price_label,
                "Scenario complete"
            );
        }
        () = await_shutdown() => {}
    }

    handle.shutdown().await?;
    tracing::info!("Trade tape stopped");

    Ok(())
}

/// Load .env from the current directory or the nearest ancestor.
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

/// Log the parsed configuration.
fn log_config(config: &AppConfig) {
    tracing::info!(
        symbol = %config.symbol,
        depth = config.tape.depth,
        threshold = %config.tape.threshold,
        display_currency = config.tape.display_currency,
        scenario = ?config.scenario,
        metrics = config.metrics.enabled,
        "Configuration loaded"
    );
}

/// Wait for Ctrl+C or SIGTERM.
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
