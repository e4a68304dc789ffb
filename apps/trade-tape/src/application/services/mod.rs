//! Application Services
//!
//! The tape service: one task per tape owning its reconciler.

mod tape_service;

pub use tape_service::{BackfillOutcome, ServiceError, TapeHandle, TapeService, TapeSnapshot};
