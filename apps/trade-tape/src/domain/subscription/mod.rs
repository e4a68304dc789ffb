//! Field Subscription Tracking
//!
//! A trader delivers data per field key: a datum kind for one symbol. Several
//! consumers (tapes) may want the same field key while the upstream only
//! needs one subscription. The registry reference counts field keys per
//! consumer and reports when the upstream subscription must be opened or
//! closed.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a consumer of trader data.
pub type ConsumerId = u64;

/// Kind of data a trader can push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraderDatum {
    /// Executed trade prints (time and sales).
    MarketPrint,
}

impl TraderDatum {
    /// Get the datum name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MarketPrint => "market_print",
        }
    }
}

/// Subscription identifier: datum kind plus symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    /// Datum kind.
    pub datum: TraderDatum,
    /// Instrument symbol.
    pub symbol: String,
}

impl FieldKey {
    /// Key for the trade prints of `symbol`.
    #[must_use]
    pub fn market_print(symbol: impl Into<String>) -> Self {
        Self {
            datum: TraderDatum::MarketPrint,
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.datum.as_str(), self.symbol)
    }
}

/// Upstream effect of a registry change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamChange {
    /// First consumer for the key; open the upstream subscription.
    Open,
    /// Last consumer left; close the upstream subscription.
    Close,
    /// Other consumers still hold (or already held) the key.
    Unchanged,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    consumer_keys: HashMap<ConsumerId, HashSet<FieldKey>>,
    refcount: HashMap<FieldKey, usize>,
}

impl RegistryState {
    fn release(&mut self, key: &FieldKey) -> UpstreamChange {
        let Some(count) = self.refcount.get_mut(key) else {
            return UpstreamChange::Unchanged;
        };

        *count = count.saturating_sub(1);
        if *count == 0 {
            self.refcount.remove(key);
            UpstreamChange::Close
        } else {
            UpstreamChange::Unchanged
        }
    }
}

/// Thread-safe reference-counted field key registry.
///
/// # Example
///
/// ```rust
/// use trade_tape::domain::subscription::{FieldKey, SubscriptionRegistry, UpstreamChange};
///
/// let registry = SubscriptionRegistry::new();
/// let key = FieldKey::market_print("AAPL");
///
/// assert_eq!(registry.add(1, &key), UpstreamChange::Open);
/// assert_eq!(registry.add(2, &key), UpstreamChange::Unchanged);
/// assert_eq!(registry.remove(1, &key), UpstreamChange::Unchanged);
/// assert_eq!(registry.remove(2, &key), UpstreamChange::Close);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` for `key`.
    pub fn add(&self, consumer: ConsumerId, key: &FieldKey) -> UpstreamChange {
        let mut state = self.state.write();

        let keys = state.consumer_keys.entry(consumer).or_default();
        if !keys.insert(key.clone()) {
            return UpstreamChange::Unchanged;
        }

        let count = state.refcount.entry(key.clone()).or_insert(0);
        *count += 1;

        if *count == 1 {
            UpstreamChange::Open
        } else {
            UpstreamChange::Unchanged
        }
    }

    /// Unregister `consumer` from `key`.
    pub fn remove(&self, consumer: ConsumerId, key: &FieldKey) -> UpstreamChange {
        let mut state = self.state.write();

        let Some(keys) = state.consumer_keys.get_mut(&consumer) else {
            return UpstreamChange::Unchanged;
        };
        if !keys.remove(key) {
            return UpstreamChange::Unchanged;
        }
        if keys.is_empty() {
            state.consumer_keys.remove(&consumer);
        }

        state.release(key)
    }

    /// Drop every key held by `consumer`.
    ///
    /// Returns the keys whose upstream subscription must close.
    pub fn consumer_disconnected(&self, consumer: ConsumerId) -> Vec<FieldKey> {
        let mut state = self.state.write();

        let Some(keys) = state.consumer_keys.remove(&consumer) else {
            return Vec::new();
        };

        keys.into_iter()
            .filter(|key| state.release(key) == UpstreamChange::Close)
            .collect()
    }

    /// Check if any consumer holds `key`.
    #[must_use]
    pub fn is_active(&self, key: &FieldKey) -> bool {
        self.state.read().refcount.contains_key(key)
    }

    /// Number of consumers holding `key`.
    #[must_use]
    pub fn consumers_of(&self, key: &FieldKey) -> usize {
        self.state.read().refcount.get(key).copied().unwrap_or(0)
    }

    /// Every key with at least one consumer.
    #[must_use]
    pub fn active_keys(&self) -> Vec<FieldKey> {
        self.state.read().refcount.keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn aapl() -> FieldKey {
        FieldKey::market_print("AAPL")
    }

    #[test]
    fn first_consumer_opens_upstream() {
        let registry = SubscriptionRegistry::new();

        assert_eq!(registry.add(1, &aapl()), UpstreamChange::Open);
        assert!(registry.is_active(&aapl()));
    }

    #[test]
    fn duplicate_add_is_not_counted_twice() {
        let registry = SubscriptionRegistry::new();
        registry.add(1, &aapl());

        assert_eq!(registry.add(1, &aapl()), UpstreamChange::Unchanged);
        assert_eq!(registry.consumers_of(&aapl()), 1);
        assert_eq!(registry.remove(1, &aapl()), UpstreamChange::Close);
    }

    #[test]
    fn last_consumer_closes_upstream() {
        let registry = SubscriptionRegistry::new();
        registry.add(1, &aapl());
        registry.add(2, &aapl());

        assert_eq!(registry.remove(1, &aapl()), UpstreamChange::Unchanged);
        assert_eq!(registry.remove(2, &aapl()), UpstreamChange::Close);
        assert!(!registry.is_active(&aapl()));
    }

    #[test]
    fn remove_unknown_is_unchanged() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.remove(9, &aapl()), UpstreamChange::Unchanged);

        registry.add(1, &FieldKey::market_print("MSFT"));
        assert_eq!(registry.remove(1, &aapl()), UpstreamChange::Unchanged);
    }

    #[test]
    fn disconnect_releases_only_last_holders() {
        let registry = SubscriptionRegistry::new();
        let msft = FieldKey::market_print("MSFT");
        registry.add(1, &aapl());
        registry.add(1, &msft);
        registry.add(2, &aapl());

        let closed = registry.consumer_disconnected(1);

        assert_eq!(closed, vec![msft]);
        assert!(registry.is_active(&aapl()));
        assert!(registry.consumer_disconnected(1).is_empty());
    }

    #[test]
    fn field_key_display() {
        assert_eq!(aapl().to_string(), "market_print:AAPL");
    }

    #[test]
    fn concurrent_adds_and_removes_balance() {
        let registry = Arc::new(SubscriptionRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|consumer| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..100 {
                        registry.add(consumer, &aapl());
                        registry.remove(consumer, &aapl());
                    }
                    registry.add(consumer, &aapl());
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.consumers_of(&aapl()), 8);
        assert_eq!(registry.active_keys(), vec![aapl()]);
    }
}
