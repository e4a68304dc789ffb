//! Trade Data Source Port (Driven Port)
//!
//! A trader pushes live prints per field key and may answer historical
//! time-and-sales queries. The upstream subscription is shared across tapes,
//! so every subscribe must be paired with an unsubscribe; [`SubscriptionGuard`]
//! makes that pairing hold on every exit path.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::domain::buffer::Depth;
use crate::domain::subscription::{ConsumerId, FieldKey};
use crate::domain::trade::{Instrument, SourceCapabilities, TradePrint};

/// Push stream of live prints for one field key.
pub type PrintStream = Pin<Box<dyn Stream<Item = TradePrint> + Send>>;

/// Trader error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The trader does not answer history queries.
    #[error("historical trades are not supported by this source")]
    HistoryUnsupported,

    /// The trader refused or failed the subscription.
    #[error("subscription to {key} failed: {message}")]
    SubscriptionFailed {
        /// Field key that was requested.
        key: FieldKey,
        /// Error details.
        message: String,
    },

    /// The history query failed.
    #[error("history request for {symbol} failed: {message}")]
    HistoryFailed {
        /// Instrument symbol.
        symbol: String,
        /// Error details.
        message: String,
    },

    /// The trader is gone.
    #[error("trader disconnected")]
    Disconnected,
}

/// Port for a trader delivering time-and-sales data.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeDataSource: Send + Sync {
    /// What this trader supports beyond live prints.
    fn capabilities(&self) -> SourceCapabilities;

    /// Subscribe `consumer` to `key` and return its live print stream.
    async fn subscribe(
        &self,
        consumer: ConsumerId,
        key: &FieldKey,
    ) -> Result<PrintStream, SourceError>;

    /// Release `consumer`'s subscription to `key`. Unknown pairs are ignored.
    fn unsubscribe(&self, consumer: ConsumerId, key: &FieldKey);

    /// Fetch up to `depth` recent prints for `instrument`, in the order
    /// declared by [`SourceCapabilities::history_order`].
    async fn fetch_history(
        &self,
        instrument: &Instrument,
        depth: Depth,
    ) -> Result<Vec<TradePrint>, SourceError>;
}

/// Scoped subscription; unsubscribes when dropped.
pub struct SubscriptionGuard {
    source: Arc<dyn TradeDataSource>,
    consumer: ConsumerId,
    key: FieldKey,
}

impl SubscriptionGuard {
    /// Subscribe and wrap the result in a guard.
    ///
    /// The guard exists before the subscribe call, so a failed activation
    /// still releases whatever the trader registered.
    ///
    /// # Errors
    ///
    /// Returns the trader's [`SourceError`] if the subscription fails.
    pub async fn acquire(
        source: Arc<dyn TradeDataSource>,
        consumer: ConsumerId,
        key: FieldKey,
    ) -> Result<(Self, PrintStream), SourceError> {
        let guard = Self {
            source,
            consumer,
            key,
        };
        let stream = guard.source.subscribe(guard.consumer, &guard.key).await?;
        Ok((guard, stream))
    }

    /// The subscribed field key.
    #[must_use]
    pub const fn key(&self) -> &FieldKey {
        &self.key
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("consumer", &self.consumer)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        tracing::debug!(consumer = self.consumer, key = %self.key, "Releasing subscription");
        self.source.unsubscribe(self.consumer, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;

    #[tokio::test]
    async fn guard_unsubscribes_on_drop() {
        let mut source = MockTradeDataSource::new();
        source
            .expect_subscribe()
            .returning(|_, _| Ok(Box::pin(futures::stream::empty())));
        source
            .expect_unsubscribe()
            .with(eq(7), eq(FieldKey::market_print("AAPL")))
            .times(1)
            .return_const(());

        let (guard, _stream) =
            SubscriptionGuard::acquire(Arc::new(source), 7, FieldKey::market_print("AAPL"))
                .await
                .unwrap();
        assert_eq!(guard.key().symbol, "AAPL");

        drop(guard);
    }

    #[tokio::test]
    async fn failed_activation_still_releases() {
        let mut source = MockTradeDataSource::new();
        source.expect_subscribe().returning(|_, key| {
            Err(SourceError::SubscriptionFailed {
                key: key.clone(),
                message: "rejected".to_string(),
            })
        });
        source.expect_unsubscribe().times(1).return_const(());

        let result =
            SubscriptionGuard::acquire(Arc::new(source), 1, FieldKey::market_print("MSFT")).await;

        assert!(matches!(
            result,
            Err(SourceError::SubscriptionFailed { ref message, .. }) if message == "rejected"
        ));
    }

    #[test]
    fn error_messages() {
        let err = SourceError::HistoryFailed {
            symbol: "AAPL".to_string(),
            message: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "history request for AAPL failed: timeout");
        assert_eq!(
            SourceError::SubscriptionFailed {
                key: FieldKey::market_print("X"),
                message: "nope".to_string()
            }
            .to_string(),
            "subscription to market_print:X failed: nope"
        );
    }
}
