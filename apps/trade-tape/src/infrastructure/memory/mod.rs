//! In-Memory Trader
//!
//! A [`TradeDataSource`] whose live prints come from [`MemoryTrader::publish`]
//! and whose history is scripted per symbol. Live prints fan out through one
//! `tokio::sync::broadcast` channel per field key, opened when the first
//! consumer subscribes and closed when the last one leaves.
//!
//! History can be held back with [`MemoryTrader::hold_history`] until
//! [`MemoryTrader::release_history`], which lets callers control exactly when
//! a backfill resolves relative to live prints.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::application::ports::{
    ConsumerId, FieldKey, HistoryOrder, PrintStream, SourceCapabilities, SourceError,
    TradeDataSource,
};
use crate::domain::buffer::Depth;
use crate::domain::subscription::{SubscriptionRegistry, UpstreamChange};
use crate::domain::trade::{Instrument, TradePrint};

/// Default capacity of each per-key broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Clone)]
enum ScriptedHistory {
    Prints(Vec<TradePrint>),
    Failure(String),
}

/// Scriptable in-process trader.
#[derive(Debug)]
pub struct MemoryTrader {
    capabilities: SourceCapabilities,
    capacity: usize,
    registry: SubscriptionRegistry,
    channels: RwLock<HashMap<FieldKey, broadcast::Sender<TradePrint>>>,
    history: RwLock<HashMap<String, ScriptedHistory>>,
    gates: RwLock<HashMap<String, watch::Sender<bool>>>,
    refused: RwLock<HashSet<String>>,
    history_requests: AtomicUsize,
}

impl MemoryTrader {
    /// Create a trader with the given capabilities.
    #[must_use]
    pub fn new(capabilities: SourceCapabilities) -> Self {
        Self::with_capacity(capabilities, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a trader with a custom broadcast channel capacity.
    #[must_use]
    pub fn with_capacity(capabilities: SourceCapabilities, capacity: usize) -> Self {
        Self {
            capabilities,
            capacity: capacity.max(1),
            registry: SubscriptionRegistry::new(),
            channels: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            gates: RwLock::new(HashMap::new()),
            refused: RwLock::new(HashSet::new()),
            history_requests: AtomicUsize::new(0),
        }
    }

    /// Push a live print to every consumer of its symbol.
    ///
    /// Returns the number of receivers reached; zero if nobody subscribed.
    pub fn publish(&self, print: TradePrint) -> usize {
        let key = FieldKey::market_print(&print.symbol);
        self.channels
            .read()
            .get(&key)
            .and_then(|tx| tx.send(print).ok())
            .unwrap_or(0)
    }

    /// Script the history returned for `symbol`, in the declared history order.
    pub fn set_history(&self, symbol: impl Into<String>, prints: Vec<TradePrint>) {
        self.history
            .write()
            .insert(symbol.into(), ScriptedHistory::Prints(prints));
    }

    /// Make history queries for `symbol` fail with `message`.
    pub fn fail_history(&self, symbol: impl Into<String>, message: impl Into<String>) {
        self.history
            .write()
            .insert(symbol.into(), ScriptedHistory::Failure(message.into()));
    }

    /// Hold history queries for `symbol` until released.
    pub fn hold_history(&self, symbol: impl Into<String>) {
        let (tx, _rx) = watch::channel(false);
        self.gates.write().insert(symbol.into(), tx);
    }

    /// Let held history queries for `symbol` complete.
    pub fn release_history(&self, symbol: &str) {
        if let Some(gate) = self.gates.write().remove(symbol) {
            gate.send_replace(true);
        }
    }

    /// Refuse live subscriptions for `symbol` after registering them.
    pub fn refuse_subscriptions(&self, symbol: impl Into<String>) {
        self.refused.write().insert(symbol.into());
    }

    /// Number of history queries received.
    #[must_use]
    pub fn history_requests(&self) -> usize {
        self.history_requests.load(Ordering::Relaxed)
    }

    /// Number of field keys with an open upstream subscription.
    #[must_use]
    pub fn upstream_subscriptions(&self) -> usize {
        self.registry.active_keys().len()
    }

    /// Number of consumers subscribed to `key`.
    #[must_use]
    pub fn consumers_of(&self, key: &FieldKey) -> usize {
        self.registry.consumers_of(key)
    }

    fn receiver(&self, key: &FieldKey) -> broadcast::Receiver<TradePrint> {
        if let Some(tx) = self.channels.read().get(key) {
            return tx.subscribe();
        }

        self.channels
            .write()
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn scripted_history(&self, instrument: &Instrument, depth: Depth) -> Result<Vec<TradePrint>, SourceError> {
        let scripted = self.history.read().get(&instrument.symbol).cloned();

        match scripted {
            None => Ok(Vec::new()),
            Some(ScriptedHistory::Failure(message)) => Err(SourceError::HistoryFailed {
                symbol: instrument.symbol.clone(),
                message,
            }),
            Some(ScriptedHistory::Prints(mut prints)) => {
                let depth = depth.get();
                if prints.len() > depth {
                    match self.capabilities.history_order {
                        HistoryOrder::NewestFirst => prints.truncate(depth),
                        HistoryOrder::OldestFirst => {
                            prints.drain(..prints.len() - depth);
                        }
                    }
                }
                Ok(prints)
            }
        }
    }
}

#[async_trait]
impl TradeDataSource for MemoryTrader {
    fn capabilities(&self) -> SourceCapabilities {
        self.capabilities
    }

    async fn subscribe(
        &self,
        consumer: ConsumerId,
        key: &FieldKey,
    ) -> Result<PrintStream, SourceError> {
        if self.registry.add(consumer, key) == UpstreamChange::Open {
            tracing::debug!(key = %key, "Opening upstream subscription");
        }

        if self.refused.read().contains(&key.symbol) {
            return Err(SourceError::SubscriptionFailed {
                key: key.clone(),
                message: "subscription refused".to_string(),
            });
        }

        let rx = self.receiver(key);
        let stream = BroadcastStream::new(rx).filter_map(|item| match item {
            Ok(print) => Some(print),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Live consumer lagged, prints dropped");
                None
            }
        });

        Ok(Box::pin(stream))
    }

    fn unsubscribe(&self, consumer: ConsumerId, key: &FieldKey) {
        if self.registry.remove(consumer, key) == UpstreamChange::Close {
            tracing::debug!(key = %key, "Closing upstream subscription");
            self.channels.write().remove(key);
        }
    }

    async fn fetch_history(
        &self,
        instrument: &Instrument,
        depth: Depth,
    ) -> Result<Vec<TradePrint>, SourceError> {
        if !self.capabilities.historical {
            return Err(SourceError::HistoryUnsupported);
        }

        self.history_requests.fetch_add(1, Ordering::Relaxed);

        let gate = self
            .gates
            .read()
            .get(&instrument.symbol)
            .map(watch::Sender::subscribe);
        if let Some(mut gate) = gate {
            // A dropped sender also counts as released.
            let _ = gate.wait_for(|released| *released).await;
        }

        self.scripted_history(instrument, depth)
    }
}
