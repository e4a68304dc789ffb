//! Trade Print Types
//!
//! Canonical representation of executed trades observed on the tape and of
//! the instrument a tape is bound to. Prints are immutable once observed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggressor side of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buyer-initiated trade.
    Buy,
    /// Seller-initiated trade.
    Sell,
}

impl Side {
    /// Get the side name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    /// Check if this is the buy side.
    #[must_use]
    pub const fn is_buy(&self) -> bool {
        matches!(self, Self::Buy)
    }
}

/// One observed executed trade for an instrument.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "symbol": "AAPL",
///   "price": "187.25",
///   "volume": "300",
///   "side": "buy",
///   "timestamp": "2024-01-15T14:30:00Z",
///   "pool": "XNAS"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradePrint {
    /// Instrument symbol.
    pub symbol: String,
    /// Execution price.
    pub price: Decimal,
    /// Traded quantity.
    pub volume: Decimal,
    /// Aggressor side.
    pub side: Side,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
    /// Market center, only when the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

impl TradePrint {
    /// Create a print without a market center.
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        price: Decimal,
        volume: Decimal,
        side: Side,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            side,
            timestamp,
            pool: None,
        }
    }

    /// Attach a market center.
    #[must_use]
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    /// Drop the market center, for sources without that capability.
    #[must_use]
    pub fn without_pool(mut self) -> Self {
        self.pool = None;
        self
    }
}

/// The instrument a tape is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Ticker symbol.
    pub symbol: String,
    /// Quote currency, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Lot size.
    #[serde(default = "default_lot")]
    pub lot: Decimal,
}

const fn default_lot() -> Decimal {
    Decimal::ONE
}

impl Instrument {
    /// Create an instrument with a lot size of one and no currency.
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            currency: None,
            lot: default_lot(),
        }
    }

    /// Set the quote currency.
    #[must_use]
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    /// Set the lot size.
    #[must_use]
    pub const fn with_lot(mut self, lot: Decimal) -> Self {
        self.lot = lot;
        self
    }
}

/// Order in which a source returns historical prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    /// Most recent print first.
    #[default]
    NewestFirst,
    /// Oldest print first.
    OldestFirst,
}

/// What a trade data source can do beyond pushing live prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceCapabilities {
    /// Source answers historical time-and-sales queries.
    #[serde(default)]
    pub historical: bool,
    /// Source reports the market center of each print.
    #[serde(default)]
    pub market_center: bool,
    /// Order of historical results.
    #[serde(default)]
    pub history_order: HistoryOrder,
}

impl SourceCapabilities {
    /// Live prints only.
    #[must_use]
    pub const fn live_only() -> Self {
        Self {
            historical: false,
            market_center: false,
            history_order: HistoryOrder::NewestFirst,
        }
    }

    /// Live prints plus history in the given order.
    #[must_use]
    pub const fn with_history(order: HistoryOrder) -> Self {
        Self {
            historical: true,
            market_center: false,
            history_order: order,
        }
    }

    /// Also report market centers.
    #[must_use]
    pub const fn with_market_center(mut self) -> Self {
        self.market_center = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn print_deserializes_without_pool() {
        let json = r#"{
            "symbol": "AAPL",
            "price": "187.25",
            "volume": "300",
            "side": "sell",
            "timestamp": "2024-01-15T14:30:00Z"
        }"#;

        let print: TradePrint = serde_json::from_str(json).unwrap();

        assert_eq!(print.symbol, "AAPL");
        assert_eq!(print.price, Decimal::from_str("187.25").unwrap());
        assert_eq!(print.volume, Decimal::from(300));
        assert_eq!(print.side, Side::Sell);
        assert!(print.pool.is_none());
    }

    #[test]
    fn pool_is_skipped_when_absent() {
        let print = TradePrint::new(
            "MSFT",
            Decimal::from(400),
            Decimal::from(10),
            Side::Buy,
            Utc::now(),
        );

        let json = serde_json::to_string(&print).unwrap();
        assert!(!json.contains("pool"));

        let json = serde_json::to_string(&print.with_pool("ARCA")).unwrap();
        assert!(json.contains("\"pool\":\"ARCA\""));
    }

    #[test]
    fn without_pool_strips_market_center() {
        let print = TradePrint::new("MSFT", Decimal::ONE, Decimal::ONE, Side::Buy, Utc::now())
            .with_pool("IEX")
            .without_pool();

        assert!(print.pool.is_none());
    }

    #[test]
    fn instrument_lot_defaults_to_one() {
        let instrument: Instrument = serde_json::from_str(r#"{"symbol":"SBER"}"#).unwrap();
        assert_eq!(instrument.lot, Decimal::ONE);
        assert!(instrument.currency.is_none());
    }

    #[test]
    fn capabilities_builders() {
        let caps = SourceCapabilities::with_history(HistoryOrder::OldestFirst).with_market_center();
        assert!(caps.historical);
        assert!(caps.market_center);
        assert_eq!(caps.history_order, HistoryOrder::OldestFirst);

        let live = SourceCapabilities::live_only();
        assert!(!live.historical);
        assert_eq!(live, SourceCapabilities::default());
    }

    #[test]
    fn side_helpers() {
        assert!(Side::Buy.is_buy());
        assert!(!Side::Sell.is_buy());
        assert_eq!(Side::Sell.as_str(), "sell");
    }
}
