#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::redundant_clone
    )
)]

//! Trade Tape - Time and Sales Reconciliation Engine
//!
//! Keeps a depth-bounded, newest-first tape of executed trades for one
//! instrument. Live prints pushed by a trader are merged with a historical
//! backfill fetched when the instrument is selected; a volume threshold
//! (a number or a sandboxed expression) decides which prints are shown.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: pure reconciliation logic
//!   - `trade`: prints, instruments, source capabilities
//!   - `expression`: sandboxed threshold expressions
//!   - `threshold`: threshold parsing and the admission predicate
//!   - `buffer` / `queue`: display buffer and live holding queue
//!   - `reconciler`: epoch state machine
//!   - `subscription`: reference-counted field key subscriptions
//!
//! - **Application**: ports and the tape service
//!   - `ports`: trader and observer interfaces
//!   - `services`: the single-owner tape task
//!
//! - **Infrastructure**: adapters
//!   - `config`: tape settings and environment loading
//!   - `memory`: in-process trader
//!   - `replay`: scenario files
//!   - `metrics` / `telemetry`: observability
//!
//! # Data Flow
//!
//! ```text
//!                     live prints        ┌────────────┐
//! Trader ───────────────────────────────►│            │  on_buffer_changed
//!   │                                    │    Tape    │──────────────────► Observer
//!   │  fetch_history (spawned, epoch e)  │  Service   │  on_empty_state_changed
//!   └───────────────────────────────────►│ (Reconciler│  on_backfill_error
//!        BackfillOutcome { e, result }   │   owner)   │
//!                                        └────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Tape types and reconciliation logic.
pub mod domain;

/// Application layer - Ports and the tape service.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::buffer::{BoundedBuffer, Depth, InvalidDepth};
pub use domain::expression::{
    BindingValue, Bindings, EvaluationError, ExpressionEvaluator, ScriptEvaluator,
};
pub use domain::reconciler::{Epoch, Reconciler, TapeEvent, TapeState};
pub use domain::threshold::{Admission, Predicate, ThresholdError, ThresholdSpec};
pub use domain::trade::{HistoryOrder, Instrument, Side, SourceCapabilities, TradePrint};

// Ports and service
pub use application::ports::{
    FieldKey, LoggingObserver, NoOpObserver, RecordingObserver, SourceError, SubscriptionGuard,
    TapeObserver, TradeDataSource, TraderDatum,
};
pub use application::services::{ServiceError, TapeHandle, TapeService, TapeSnapshot};

// Infrastructure config
pub use infrastructure::config::{AppConfig, ConfigError, MetricsSettings, TapeConfig};

// In-memory trader and replay (for integration tests)
pub use infrastructure::memory::MemoryTrader;
pub use infrastructure::replay::{ReplayError, Scenario, Step};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
