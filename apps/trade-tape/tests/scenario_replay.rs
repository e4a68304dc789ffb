//! Scenario Replay Integration Tests
//!
//! Loads scenario files from disk and plays them against a running tape.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use trade_tape::{
    RecordingObserver, ReplayError, Scenario, ServiceError, TapeConfig, TapeEvent, TapeService,
    TapeState,
};

fn write_scenario(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

const OPENING_BELL: &str = r#"{
    "capabilities": { "historical": true, "market_center": false, "history_order": "oldest_first" },
    "instruments": [{ "symbol": "AAPL", "currency": "USD" }],
    "history": {
        "AAPL": [
            { "symbol": "AAPL", "price": "187.00", "volume": "100", "side": "buy", "timestamp": "2024-01-15T14:29:50Z" },
            { "symbol": "AAPL", "price": "187.05", "volume": "400", "side": "sell", "timestamp": "2024-01-15T14:29:55Z" }
        ]
    },
    "held_history": ["AAPL"],
    "steps": [
        { "type": "select", "symbol": "AAPL" },
        { "type": "print", "print": { "symbol": "AAPL", "price": "187.10", "volume": "250", "side": "buy", "timestamp": "2024-01-15T14:30:00Z", "pool": "XNAS" } },
        { "type": "print", "print": { "symbol": "AAPL", "price": "0", "volume": "900", "side": "buy", "timestamp": "2024-01-15T14:30:01Z" } },
        { "type": "wait", "millis": 20 },
        { "type": "release_history", "symbol": "AAPL" },
        { "type": "wait", "millis": 20 }
    ]
}"#;

#[tokio::test]
async fn replays_backfill_merge_from_file() {
    let file = write_scenario(OPENING_BELL);
    let scenario = Scenario::load(file.path()).await.unwrap();
    let trader = scenario.build_trader();
    let observer = Arc::new(RecordingObserver::new());
    let config = TapeConfig::default().with_display_currency(true);

    let handle = TapeService::new(trader.clone(), observer.clone())
        .spawn(&config, CancellationToken::new())
        .unwrap();

    timeout(Duration::from_secs(5), scenario.play(&trader, &handle, config))
        .await
        .unwrap()
        .unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert!(matches!(snapshot.state, TapeState::Steady(_)));
    assert_eq!(snapshot.price_label, "Price, USD");

    // Zero-priced print ignored, history reversed under the live print.
    let volumes: Vec<String> = snapshot
        .prints
        .iter()
        .map(|p| p.volume.to_string())
        .collect();
    assert_eq!(volumes, vec!["250", "400", "100"]);

    // No market center capability: pool stripped.
    assert!(snapshot.prints.iter().all(|p| p.pool.is_none()));

    assert!(
        observer
            .events()
            .iter()
            .any(|e| matches!(e, TapeEvent::EmptyStateChanged(false)))
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconfigure_step_patches_settings() {
    let file = write_scenario(
        r#"{
        "capabilities": { "historical": false },
        "steps": [
            { "type": "select", "symbol": "MSFT" },
            { "type": "reconfigure", "depth": 2, "threshold": "if trade.volume > 500 { 0 } else { 1000 }" },
            { "type": "print", "print": { "symbol": "MSFT", "price": "402.1", "volume": "600", "side": "buy", "timestamp": "2024-01-15T14:30:00Z" } },
            { "type": "print", "print": { "symbol": "MSFT", "price": "402.2", "volume": "300", "side": "sell", "timestamp": "2024-01-15T14:30:01Z" } },
            { "type": "print", "print": { "symbol": "MSFT", "price": "402.3", "volume": "1200", "side": "buy", "timestamp": "2024-01-15T14:30:02Z" } },
            { "type": "print", "print": { "symbol": "MSFT", "price": "402.4", "volume": "700", "side": "buy", "timestamp": "2024-01-15T14:30:03Z" } },
            { "type": "wait", "millis": 20 }
        ]
    }"#,
    );
    let scenario = Scenario::load(file.path()).await.unwrap();
    let trader = scenario.build_trader();
    let handle = TapeService::new(trader.clone(), Arc::new(RecordingObserver::new()))
        .spawn(&TapeConfig::default(), CancellationToken::new())
        .unwrap();

    scenario
        .play(&trader, &handle, TapeConfig::default())
        .await
        .unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.depth.get(), 2);
    let volumes: Vec<String> = snapshot
        .prints
        .iter()
        .map(|p| p.volume.to_string())
        .collect();
    assert_eq!(volumes, vec!["700", "1200"]);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_reconfigure_step_reports_index() {
    let file = write_scenario(
        r#"{
        "steps": [
            { "type": "select", "symbol": "AAPL" },
            { "type": "teardown" },
            { "type": "reconfigure", "depth": 0 }
        ]
    }"#,
    );
    let scenario = Scenario::load(file.path()).await.unwrap();
    let trader = scenario.build_trader();
    let handle = TapeService::new(trader.clone(), Arc::new(RecordingObserver::new()))
        .spawn(&TapeConfig::default(), CancellationToken::new())
        .unwrap();

    let err = scenario
        .play(&trader, &handle, TapeConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReplayError::Step {
            index: 2,
            source: ServiceError::Config(_)
        }
    ));
    assert_eq!(handle.snapshot().await.unwrap().state, TapeState::Idle);
    assert_eq!(trader.upstream_subscriptions(), 0);

    handle.shutdown().await.unwrap();
}
