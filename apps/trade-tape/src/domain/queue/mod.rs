//! Live Ingestion Queue
//!
//! Holds admitted live prints while a backfill is outstanding. Prints are
//! prepended, so the queue reads newest-first, the same orientation as the
//! display buffer. There is no capacity: the queue only grows for as long as
//! the backfill takes.

use std::collections::VecDeque;

use super::trade::TradePrint;

/// Newest-first holding area for live prints.
#[derive(Debug, Clone, Default)]
pub struct LiveQueue {
    prints: VecDeque<TradePrint>,
}

impl LiveQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a print.
    pub fn enqueue(&mut self, print: TradePrint) {
        self.prints.push_front(print);
    }

    /// Take every queued print, newest first, leaving the queue empty.
    pub fn drain_and_clear(&mut self) -> Vec<TradePrint> {
        self.prints.drain(..).collect()
    }

    /// Discard every queued print.
    pub fn clear(&mut self) {
        self.prints.clear();
    }

    /// Number of queued prints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prints.len()
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prints.is_empty()
    }
}
