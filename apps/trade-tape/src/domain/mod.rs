//! Domain Layer - Tape types and reconciliation logic.
//!
//! Pure and synchronous. Nothing here performs I/O; the application layer
//! feeds prints and backfill results in and drains the resulting events.

/// Trade prints, instruments and source capabilities.
pub mod trade;

/// Sandboxed arithmetic expressions for dynamic thresholds.
pub mod expression;

/// Threshold parsing and the admission predicate.
pub mod threshold;

/// Depth-capped display buffer.
pub mod buffer;

/// Holding queue for live prints during a backfill.
pub mod queue;

/// Epoch state machine merging live and historical prints.
pub mod reconciler;

/// Reference-counted field key subscriptions.
pub mod subscription;
