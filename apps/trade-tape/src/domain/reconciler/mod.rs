//! Tape Reconciler
//!
//! Single-owner state machine that merges live prints with a historical
//! backfill into the display buffer.
//!
//! # States
//!
//! ```text
//!            select_instrument (history)          backfill resolved (epoch e)
//!   Idle ──────────────────────────────► AwaitingBackfill(e) ─────────────► Steady(e)
//!    │                                        ▲       │                        │
//!    │ select_instrument (live only)          └───────┴── select_instrument ───┘
//!    └──────────────────────────────────────────────────────────────► Steady(e)
//! ```
//!
//! Every instrument selection starts a new epoch. A backfill result carries
//! the epoch it was requested under and is applied only while the reconciler
//! is still waiting on that epoch; anything else is stale and dropped. The
//! in-flight fetch is never cancelled, its result is just ignored.
//!
//! While a backfill is outstanding, admitted live prints are queued instead of
//! written to the buffer. On resolution the queue (newest-first) is placed
//! above the admitted backfill (normalized newest-first) and the buffer is
//! replaced in one step.
//!
//! The reconciler does no I/O. Observable effects are collected as
//! [`TapeEvent`]s and drained with [`Reconciler::take_events`].

use std::fmt;

use rust_decimal::Decimal;

use super::buffer::{BoundedBuffer, Depth};
use super::queue::LiveQueue;
use super::threshold::{Admission, Predicate};
use super::trade::{HistoryOrder, Instrument, SourceCapabilities, TradePrint};

// =============================================================================
// Types
// =============================================================================

/// Generation counter for instrument selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(u64);

impl Epoch {
    /// Create an epoch from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The epoch after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reconciler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeState {
    /// No instrument bound.
    Idle,
    /// Waiting for the backfill requested under this epoch.
    AwaitingBackfill(Epoch),
    /// Live prints go straight to the buffer.
    Steady(Epoch),
}

impl TapeState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingBackfill(_) => "awaiting_backfill",
            Self::Steady(_) => "steady",
        }
    }

    /// Check if live prints are being queued.
    #[must_use]
    pub const fn is_queueing(&self) -> bool {
        matches!(self, Self::AwaitingBackfill(_))
    }
}

/// Observable effect of a reconciler transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapeEvent {
    /// Buffer contents after a mutation, newest first.
    BufferChanged(Vec<TradePrint>),
    /// Empty-state flag flipped.
    EmptyStateChanged(bool),
    /// Historical fetch failed for the current epoch.
    BackfillError(String),
}

/// A historical fetch the caller should issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    /// Epoch the result must be tagged with.
    pub epoch: Epoch,
    /// Instrument to fetch.
    pub instrument: Instrument,
    /// Number of prints wanted.
    pub depth: Depth,
}

/// Why a live print was dropped before reaching the predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No instrument is bound.
    Unbound,
    /// Print belongs to another instrument.
    ForeignSymbol,
    /// Print carries no price.
    NoPrice,
}

/// What happened to a live print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    /// Dropped without evaluation.
    Ignored(IgnoreReason),
    /// Rejected by the threshold predicate.
    Rejected(Admission),
    /// Held until the backfill resolves.
    Queued,
    /// Written to the buffer head.
    Inserted,
}

impl LiveOutcome {
    /// Metric label for this outcome.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ignored(_) => "ignored",
            Self::Rejected(admission) => admission.as_str(),
            Self::Queued => "queued",
            Self::Inserted => "inserted",
        }
    }
}

/// What happened to a backfill result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillResolution {
    /// Merged into the buffer.
    Applied {
        /// Live prints flushed from the queue.
        queued: usize,
        /// Backfill prints that passed the predicate.
        admitted: usize,
    },
    /// Fetch failed; queued prints were flushed on their own.
    Failed {
        /// Live prints flushed from the queue.
        queued: usize,
    },
    /// Result belongs to a superseded epoch and was dropped.
    Stale,
}

impl BackfillResolution {
    /// Metric label for this resolution.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Failed { .. } => "failed",
            Self::Stale => "stale",
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Owns the buffer, queue and epoch for one tape.
#[derive(Debug)]
pub struct Reconciler {
    epoch: Epoch,
    state: TapeState,
    instrument: Option<Instrument>,
    capabilities: SourceCapabilities,
    predicate: Predicate,
    buffer: BoundedBuffer,
    queue: LiveQueue,
    empty: bool,
    events: Vec<TapeEvent>,
}

impl Reconciler {
    /// Create an idle reconciler.
    #[must_use]
    pub fn new(depth: Depth, predicate: Predicate) -> Self {
        Self {
            epoch: Epoch::default(),
            state: TapeState::Idle,
            instrument: None,
            capabilities: SourceCapabilities::default(),
            predicate,
            buffer: BoundedBuffer::new(depth),
            queue: LiveQueue::new(),
            empty: true,
            events: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> TapeState {
        self.state
    }

    /// Current epoch.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Bound instrument, if any.
    #[must_use]
    pub const fn bound_instrument(&self) -> Option<&Instrument> {
        self.instrument.as_ref()
    }

    /// The display buffer.
    #[must_use]
    pub const fn buffer(&self) -> &BoundedBuffer {
        &self.buffer
    }

    /// Number of live prints waiting on the backfill.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing has been admitted for the current instrument.
    #[must_use]
    pub const fn is_empty_state(&self) -> bool {
        self.empty
    }

    /// Take the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<TapeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Bind an instrument, starting a new epoch.
    ///
    /// Clears the buffer and queue. Returns the backfill to issue when the
    /// source supports history; otherwise the tape starts steady and empty.
    pub fn select_instrument(
        &mut self,
        instrument: Instrument,
        capabilities: SourceCapabilities,
    ) -> Option<BackfillRequest> {
        self.epoch = self.epoch.next();
        self.capabilities = capabilities;
        self.queue.clear();
        self.clear_buffer();
        self.set_empty(true);

        tracing::debug!(
            symbol = %instrument.symbol,
            epoch = %self.epoch,
            historical = capabilities.historical,
            "Instrument selected"
        );

        self.instrument = Some(instrument.clone());

        if capabilities.historical {
            self.state = TapeState::AwaitingBackfill(self.epoch);
            Some(BackfillRequest {
                epoch: self.epoch,
                instrument,
                depth: self.buffer.depth(),
            })
        } else {
            self.state = TapeState::Steady(self.epoch);
            None
        }
    }

    /// Apply new depth and threshold.
    ///
    /// The buffer shrinks immediately if the depth went down. Callers re-bind
    /// the instrument afterwards so the whole tape is rebuilt under the new
    /// threshold.
    pub fn reconfigure(&mut self, depth: Depth, predicate: Predicate) {
        let before = self.buffer.len();
        self.buffer.set_depth(depth);
        self.predicate = predicate;

        if self.buffer.len() != before {
            self.emit_buffer();
        }
    }

    /// Handle one pushed live print.
    pub fn on_live_print(&mut self, print: TradePrint) -> LiveOutcome {
        let Some(instrument) = self.instrument.as_ref() else {
            return LiveOutcome::Ignored(IgnoreReason::Unbound);
        };

        if print.symbol != instrument.symbol {
            return LiveOutcome::Ignored(IgnoreReason::ForeignSymbol);
        }

        if print.price == Decimal::ZERO {
            return LiveOutcome::Ignored(IgnoreReason::NoPrice);
        }

        let admission = self.predicate.evaluate(&print, instrument);
        if !admission.is_admitted() {
            return LiveOutcome::Rejected(admission);
        }

        let print = self.normalize(print);

        match self.state {
            TapeState::Idle => LiveOutcome::Ignored(IgnoreReason::Unbound),
            TapeState::AwaitingBackfill(_) => {
                self.queue.enqueue(print);
                LiveOutcome::Queued
            }
            TapeState::Steady(_) => {
                self.buffer.insert_at_head(print);
                self.emit_buffer();
                self.set_empty(false);
                LiveOutcome::Inserted
            }
        }
    }

    /// Handle a backfill result tagged with `epoch`.
    pub fn on_backfill<E: fmt::Display>(
        &mut self,
        epoch: Epoch,
        result: Result<Vec<TradePrint>, E>,
    ) -> BackfillResolution {
        if self.state != TapeState::AwaitingBackfill(epoch) {
            tracing::debug!(
                stale_epoch = %epoch,
                current_epoch = %self.epoch,
                "Discarding stale backfill"
            );
            return BackfillResolution::Stale;
        }

        let queued = self.queue.drain_and_clear();
        let queued_count = queued.len();
        self.state = TapeState::Steady(epoch);

        let resolution = match result {
            Ok(history) => {
                let admitted = self.admit_history(history);
                let admitted_count = admitted.len();
                self.buffer.replace_all(queued.into_iter().chain(admitted));
                BackfillResolution::Applied {
                    queued: queued_count,
                    admitted: admitted_count,
                }
            }
            Err(e) => {
                self.buffer.replace_all(queued);
                self.events.push(TapeEvent::BackfillError(e.to_string()));
                BackfillResolution::Failed {
                    queued: queued_count,
                }
            }
        };

        self.emit_buffer();
        if !self.buffer.is_empty() {
            self.set_empty(false);
        }

        resolution
    }

    /// Unbind the instrument and drop all state.
    ///
    /// Any backfill still in flight becomes stale.
    pub fn teardown(&mut self) {
        self.state = TapeState::Idle;
        self.instrument = None;
        self.queue.clear();
        self.clear_buffer();
        self.set_empty(true);
    }

    /// Filter history through the predicate and order it newest-first.
    fn admit_history(&self, mut history: Vec<TradePrint>) -> Vec<TradePrint> {
        if self.capabilities.history_order == HistoryOrder::OldestFirst {
            history.reverse();
        }

        let Some(instrument) = self.instrument.as_ref() else {
            return Vec::new();
        };

        history
            .into_iter()
            .filter(|print| self.predicate.admits(print, instrument))
            .map(|print| self.normalize(print))
            .collect()
    }

    fn normalize(&self, print: TradePrint) -> TradePrint {
        if self.capabilities.market_center {
            print
        } else {
            print.without_pool()
        }
    }

    fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.emit_buffer();
    }

    fn emit_buffer(&mut self) {
        self.events
            .push(TapeEvent::BufferChanged(self.buffer.snapshot()));
    }

    fn set_empty(&mut self, empty: bool) {
        if self.empty != empty {
            self.empty = empty;
            self.events.push(TapeEvent::EmptyStateChanged(empty));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
