//! Scenario Replay
//!
//! JSON scenario files script a trader session: the trader's capabilities,
//! the history it returns per symbol, and a sequence of steps (instrument
//! switches, live prints, history releases, settings changes) played against
//! a running tape.
//!
//! # Format
//!
//! ```json
//! {
//!   "capabilities": { "historical": true, "history_order": "oldest_first" },
//!   "instruments": [{ "symbol": "AAPL", "currency": "USD" }],
//!   "history": { "AAPL": [ { "symbol": "AAPL", "price": "187.2", ... } ] },
//!   "history_failures": { "MSFT": "gateway timeout" },
//!   "held_history": ["AAPL"],
//!   "steps": [
//!     { "type": "select", "symbol": "AAPL" },
//!     { "type": "print", "print": { "symbol": "AAPL", ... } },
//!     { "type": "release_history", "symbol": "AAPL" },
//!     { "type": "reconfigure", "depth": 50, "threshold": "100" },
//!     { "type": "wait", "millis": 250 }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::services::{ServiceError, TapeHandle};
use crate::domain::trade::{Instrument, SourceCapabilities, TradePrint};
use crate::infrastructure::config::TapeConfig;
use crate::infrastructure::memory::MemoryTrader;

/// Replay error.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Scenario file could not be read.
    #[error("failed to read scenario {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Scenario file is not valid JSON for the format.
    #[error("invalid scenario {path}: {source}")]
    Parse {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The tape rejected a step.
    #[error("step {index} failed: {source}")]
    Step {
        /// Zero-based step index.
        index: usize,
        /// Underlying error.
        #[source]
        source: ServiceError,
    },
}

/// One scripted action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Bind the tape to a symbol.
    Select {
        /// Symbol, resolved against the scenario's instruments.
        symbol: String,
    },
    /// Push a live print.
    Print {
        /// The print.
        print: TradePrint,
    },
    /// Let a held history query complete.
    ReleaseHistory {
        /// Symbol whose history is released.
        symbol: String,
    },
    /// Hold history queries for a symbol.
    HoldHistory {
        /// Symbol whose history is held.
        symbol: String,
    },
    /// Change tape settings.
    Reconfigure {
        /// New depth.
        #[serde(default)]
        depth: Option<usize>,
        /// New threshold.
        #[serde(default)]
        threshold: Option<String>,
        /// New currency display flag.
        #[serde(default)]
        display_currency: Option<bool>,
    },
    /// Unbind the tape.
    Teardown,
    /// Pause.
    Wait {
        /// Milliseconds to wait.
        millis: u64,
    },
}

/// A scripted trader session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Trader capabilities.
    #[serde(default)]
    pub capabilities: SourceCapabilities,
    /// Known instruments.
    #[serde(default)]
    pub instruments: Vec<Instrument>,
    /// History per symbol, in the declared history order.
    #[serde(default)]
    pub history: HashMap<String, Vec<TradePrint>>,
    /// Symbols whose history queries fail, with the error message.
    #[serde(default)]
    pub history_failures: HashMap<String, String>,
    /// Symbols whose history is held until a release step.
    #[serde(default)]
    pub held_history: Vec<String>,
    /// Steps to play.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Load a scenario file.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Io`] or [`ReplayError::Parse`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let raw = tokio::fs::read_to_string(path).await.map_err(|source| ReplayError::Io {
            path: display.clone(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| ReplayError::Parse {
            path: display,
            source,
        })
    }

    /// Resolve `symbol` to a known instrument, or a bare one.
    #[must_use]
    pub fn instrument(&self, symbol: &str) -> Instrument {
        self.instruments
            .iter()
            .find(|i| i.symbol == symbol)
            .cloned()
            .unwrap_or_else(|| Instrument::new(symbol))
    }

    /// Build a trader scripted with this scenario's history.
    #[must_use]
    pub fn build_trader(&self) -> Arc<MemoryTrader> {
        let trader = MemoryTrader::new(self.capabilities);

        for (symbol, prints) in &self.history {
            trader.set_history(symbol.clone(), prints.clone());
        }
        for (symbol, message) in &self.history_failures {
            trader.fail_history(symbol.clone(), message.clone());
        }
        for symbol in &self.held_history {
            trader.hold_history(symbol.clone());
        }

        Arc::new(trader)
    }

    /// Play every step against `handle`, publishing prints through `trader`.
    ///
    /// `config` is the tape's current settings; reconfigure steps patch it.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Step`] for the first step the tape rejects.
    pub async fn play(
        &self,
        trader: &MemoryTrader,
        handle: &TapeHandle,
        mut config: TapeConfig,
    ) -> Result<(), ReplayError> {
        for (index, step) in self.steps.iter().enumerate() {
            tracing::debug!(index, ?step, "Playing step");

            let result = match step {
                Step::Select { symbol } => handle.select_instrument(self.instrument(symbol)).await,
                Step::Print { print } => {
                    let receivers = trader.publish(print.clone());
                    if receivers == 0 {
                        tracing::debug!(symbol = %print.symbol, "Print had no subscribers");
                    }
                    Ok(())
                }
                Step::ReleaseHistory { symbol } => {
                    trader.release_history(symbol);
                    Ok(())
                }
                Step::HoldHistory { symbol } => {
                    trader.hold_history(symbol.clone());
                    Ok(())
                }
                Step::Reconfigure {
                    depth,
                    threshold,
                    display_currency,
                } => {
                    let mut next = config.clone();
                    if let Some(depth) = depth {
                        next.depth = *depth;
                    }
                    if let Some(threshold) = threshold {
                        next.threshold.clone_from(threshold);
                    }
                    if let Some(display_currency) = display_currency {
                        next.display_currency = *display_currency;
                    }
                    let result = handle.reconfigure(next.clone()).await;
                    if result.is_ok() {
                        config = next;
                    }
                    result
                }
                Step::Teardown => handle.teardown().await,
                Step::Wait { millis } => {
                    tokio::time::sleep(Duration::from_millis(*millis)).await;
                    Ok(())
                }
            };

            result.map_err(|source| ReplayError::Step { index, source })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::trade::HistoryOrder;

    const SCENARIO: &str = r#"{
        "capabilities": { "historical": true, "market_center": true, "history_order": "oldest_first" },
        "instruments": [{ "symbol": "AAPL", "currency": "USD", "lot": "10" }],
        "history": {
            "AAPL": [
                { "symbol": "AAPL", "price": "187.10", "volume": "200", "side": "buy", "timestamp": "2024-01-15T14:29:58Z" }
            ]
        },
        "history_failures": { "MSFT": "gateway timeout" },
        "held_history": ["AAPL"],
        "steps": [
            { "type": "select", "symbol": "AAPL" },
            { "type": "print", "print": { "symbol": "AAPL", "price": "187.25", "volume": "300", "side": "sell", "timestamp": "2024-01-15T14:30:00Z", "pool": "XNAS" } },
            { "type": "release_history", "symbol": "AAPL" },
            { "type": "reconfigure", "threshold": "if trade.volume > 250 { 0 } else { 1000 }" },
            { "type": "teardown" },
            { "type": "wait", "millis": 5 }
        ]
    }"#;

    #[tokio::test]
    async fn loads_scenario_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();

        let scenario = Scenario::load(file.path()).await.unwrap();

        assert!(scenario.capabilities.historical);
        assert!(scenario.capabilities.market_center);
        assert_eq!(scenario.capabilities.history_order, HistoryOrder::OldestFirst);
        assert_eq!(scenario.history["AAPL"].len(), 1);
        assert_eq!(scenario.steps.len(), 6);
        assert_eq!(
            scenario.steps[0],
            Step::Select {
                symbol: "AAPL".to_string()
            }
        );
        assert!(matches!(
            &scenario.steps[3],
            Step::Reconfigure { depth: None, threshold: Some(t), display_currency: None } if t.starts_with("if trade.volume")
        ));
    }

    #[test]
    fn instrument_lookup_falls_back_to_bare_symbol() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();

        let aapl = scenario.instrument("AAPL");
        assert_eq!(aapl.currency.as_deref(), Some("USD"));
        assert_eq!(aapl.lot, Decimal::from(10));

        let msft = scenario.instrument("MSFT");
        assert_eq!(msft, Instrument::new("MSFT"));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Scenario::load(dir.path().join("absent.json")).await.unwrap_err();
        assert!(matches!(err, ReplayError::Io { .. }));
    }

    #[tokio::test]
    async fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "steps": [ { "type": "explode" } ] }"#).unwrap();

        let err = Scenario::load(file.path()).await.unwrap_err();
        assert!(matches!(err, ReplayError::Parse { .. }));
    }

    #[tokio::test]
    async fn built_trader_carries_scripted_history() {
        use crate::application::ports::TradeDataSource;
        use crate::domain::buffer::Depth;

        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let trader = scenario.build_trader();
        trader.release_history("AAPL");

        let prints = trader
            .fetch_history(&scenario.instrument("AAPL"), Depth::default())
            .await
            .unwrap();
        assert_eq!(prints.len(), 1);

        let err = trader
            .fetch_history(&scenario.instrument("MSFT"), Depth::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gateway timeout"));
    }
}
