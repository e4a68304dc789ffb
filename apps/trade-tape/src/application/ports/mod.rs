//! Application Ports (Driver and Driven)
//!
//! - **Driven**: `TradeDataSource`, the trader that pushes live prints and
//!   optionally answers history queries.
//! - **Driver-facing callbacks**: `TapeObserver`, how the tape reports buffer
//!   contents, empty state and backfill failures to whoever renders it.

mod observer_port;
mod trade_source_port;

pub use observer_port::{LoggingObserver, NoOpObserver, RecordingObserver, TapeObserver};
pub(crate) use observer_port::notify;
pub use trade_source_port::{PrintStream, SourceError, SubscriptionGuard, TradeDataSource};

pub use crate::domain::subscription::{ConsumerId, FieldKey, TraderDatum};
pub use crate::domain::trade::{HistoryOrder, SourceCapabilities};

#[cfg(test)]
pub use observer_port::MockTapeObserver;
