//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete traders, settings, scenario replay and observability.

/// Tape settings and environment configuration.
pub mod config;

/// In-process trader backed by broadcast channels.
pub mod memory;

/// JSON scenario files for replaying trader sessions.
pub mod replay;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
