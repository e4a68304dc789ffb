//! Prometheus Metrics Module
//!
//! Counters and gauges describing tape activity.
//!
//! # Metrics
//!
//! - `trade_tape_prints_total{source, outcome}`: prints seen, by where they
//!   came from (`live`, `backfill`) and what happened to them.
//! - `trade_tape_backfills_total{outcome}`: backfill results by resolution.
//! - `trade_tape_buffer_len`: current display buffer length.
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::infrastructure::config::MetricsSettings;

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus exporter with an HTTP scrape endpoint.
///
/// Later calls are no-ops and return the address of the first install.
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns the exporter's [`BuildError`] if the recorder or listener cannot
/// be installed.
pub fn init_metrics(settings: MetricsSettings) -> Result<SocketAddr, BuildError> {
    if let Some(addr) = INSTALLED.get() {
        return Ok(*addr);
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metrics();

    Ok(*INSTALLED.get_or_init(|| addr))
}

fn register_metrics() {
    describe_counter!(
        "trade_tape_prints_total",
        "Trade prints processed by the tape, by source and outcome"
    );
    describe_counter!(
        "trade_tape_backfills_total",
        "Backfill results by resolution"
    );
    describe_gauge!(
        "trade_tape_buffer_len",
        "Number of prints on the display buffer"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Where a print came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintSource {
    /// Pushed by the live subscription.
    Live,
    /// Returned by a history query.
    Backfill,
}

impl PrintSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Backfill => "backfill",
        }
    }
}

/// Record prints with the given outcome label.
pub fn record_prints(source: PrintSource, outcome: &'static str, count: u64) {
    if count == 0 {
        return;
    }
    counter!(
        "trade_tape_prints_total",
        "source" => source.as_str(),
        "outcome" => outcome
    )
    .increment(count);
}

/// Record a backfill resolution.
pub fn record_backfill(outcome: &'static str) {
    counter!("trade_tape_backfills_total", "outcome" => outcome).increment(1);
}

/// Update the buffer length gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_buffer_len(len: usize) {
    gauge!("trade_tape_buffer_len").set(len as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_source_as_str() {
        assert_eq!(PrintSource::Live.as_str(), "live");
        assert_eq!(PrintSource::Backfill.as_str(), "backfill");
    }

    #[test]
    fn recording_without_exporter_is_noop() {
        record_prints(PrintSource::Live, "inserted", 1);
        record_prints(PrintSource::Backfill, "admitted", 0);
        record_backfill("stale");
        set_buffer_len(3);
    }
}
