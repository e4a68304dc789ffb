//! Application Layer - Ports and the tape service.
//!
//! Ports describe what the tape needs from a trader and what it reports to
//! its presentation layer. The service owns one reconciler and drives it.

/// Port interfaces for traders and observers.
pub mod ports;

/// The tape actor and its handle.
pub mod services;
