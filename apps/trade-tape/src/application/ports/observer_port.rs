//! Tape Observer Port
//!
//! Synchronous callbacks invoked by the tape service after each reconciler
//! transition. Implementations must not block; they run on the tape task.

use parking_lot::Mutex;

use crate::domain::reconciler::TapeEvent;
use crate::domain::trade::TradePrint;

/// Receiver of tape notifications.
#[cfg_attr(test, mockall::automock)]
pub trait TapeObserver: Send + Sync {
    /// Buffer was mutated; `prints` is its full content, newest first.
    fn on_buffer_changed(&self, prints: &[TradePrint]);

    /// Empty-state flag flipped.
    fn on_empty_state_changed(&self, empty: bool);

    /// Historical fetch failed for the current instrument.
    fn on_backfill_error(&self, message: &str);
}

/// Dispatch a reconciler event to an observer.
pub(crate) fn notify(observer: &dyn TapeObserver, event: &TapeEvent) {
    match event {
        TapeEvent::BufferChanged(prints) => observer.on_buffer_changed(prints),
        TapeEvent::EmptyStateChanged(empty) => observer.on_empty_state_changed(*empty),
        TapeEvent::BackfillError(message) => observer.on_backfill_error(message),
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl TapeObserver for NoOpObserver {
    fn on_buffer_changed(&self, _prints: &[TradePrint]) {}

    fn on_empty_state_changed(&self, _empty: bool) {}

    fn on_backfill_error(&self, _message: &str) {}
}

/// Observer that logs each notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl TapeObserver for LoggingObserver {
    fn on_buffer_changed(&self, prints: &[TradePrint]) {
        match prints.first() {
            Some(head) => tracing::info!(
                len = prints.len(),
                symbol = %head.symbol,
                price = %head.price,
                volume = %head.volume,
                side = head.side.as_str(),
                pool = head.pool.as_deref().unwrap_or("-"),
                "Tape updated"
            ),
            None => tracing::info!(len = 0, "Tape cleared"),
        }
    }

    fn on_empty_state_changed(&self, empty: bool) {
        tracing::info!(empty, "Tape empty state changed");
    }

    fn on_backfill_error(&self, message: &str) {
        tracing::warn!(error = %message, "Backfill failed");
    }
}

/// Observer that records every notification as a [`TapeEvent`].
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TapeEvent>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<TapeEvent> {
        self.events.lock().clone()
    }

    /// Last buffer content reported, if any.
    #[must_use]
    pub fn last_buffer(&self) -> Option<Vec<TradePrint>> {
        self.events.lock().iter().rev().find_map(|event| match event {
            TapeEvent::BufferChanged(prints) => Some(prints.clone()),
            _ => None,
        })
    }

    /// Every backfill error message reported.
    #[must_use]
    pub fn backfill_errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                TapeEvent::BackfillError(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every empty-state value reported, in order.
    #[must_use]
    pub fn empty_states(&self) -> Vec<bool> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                TapeEvent::EmptyStateChanged(empty) => Some(*empty),
                _ => None,
            })
            .collect()
    }
}

impl TapeObserver for RecordingObserver {
    fn on_buffer_changed(&self, prints: &[TradePrint]) {
        self.events
            .lock()
            .push(TapeEvent::BufferChanged(prints.to_vec()));
    }

    fn on_empty_state_changed(&self, empty: bool) {
        self.events.lock().push(TapeEvent::EmptyStateChanged(empty));
    }

    fn on_backfill_error(&self, message: &str) {
        self.events
            .lock()
            .push(TapeEvent::BackfillError(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;

    #[test]
    fn notify_routes_each_event() {
        let mut observer = MockTapeObserver::new();
        observer
            .expect_on_buffer_changed()
            .withf(|prints| prints.is_empty())
            .times(1)
            .return_const(());
        observer
            .expect_on_empty_state_changed()
            .with(eq(true))
            .times(1)
            .return_const(());
        observer
            .expect_on_backfill_error()
            .withf(|message| message == "boom")
            .times(1)
            .return_const(());

        notify(&observer, &TapeEvent::BufferChanged(vec![]));
        notify(&observer, &TapeEvent::EmptyStateChanged(true));
        notify(&observer, &TapeEvent::BackfillError("boom".to_string()));
    }

    #[test]
    fn recording_observer_keeps_order() {
        let observer = RecordingObserver::new();

        observer.on_empty_state_changed(true);
        observer.on_buffer_changed(&[]);
        observer.on_backfill_error("late");
        observer.on_empty_state_changed(false);

        assert_eq!(observer.events().len(), 4);
        assert_eq!(observer.empty_states(), vec![true, false]);
        assert_eq!(observer.backfill_errors(), vec!["late".to_string()]);
        assert_eq!(observer.last_buffer(), Some(vec![]));
    }
}
