//! Volume Threshold Predicate
//!
//! Decides whether a trade print is admitted to the tape. A threshold is
//! either a literal number or an expression evaluated per print through an
//! injected [`ExpressionEvaluator`].
//!
//! Evaluation failures are fail-closed: the print is rejected, the failure is
//! logged at debug level, and the engine carries on.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use super::expression::{Bindings, EvaluationError, ExpressionEvaluator};
use super::trade::{Instrument, TradePrint};

/// Largest literal threshold accepted at configuration time.
pub const MAX_LITERAL_THRESHOLD: i64 = 10_000_000;

// =============================================================================
// Threshold Specification
// =============================================================================

/// A volume threshold as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThresholdSpec {
    /// Fixed minimum volume.
    Literal(Decimal),
    /// Expression evaluated per print to a minimum volume.
    Expression(String),
}

impl Default for ThresholdSpec {
    fn default() -> Self {
        Self::Literal(Decimal::ZERO)
    }
}

impl ThresholdSpec {
    /// Interpret raw threshold text.
    ///
    /// A decimal comma is accepted. Blank text means zero. Anything that is
    /// not a number is kept as expression source.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Self::default();
        }

        let normalized = trimmed.replace(',', ".");
        Decimal::from_str(&normalized)
            .or_else(|_| Decimal::from_scientific(&normalized))
            .map_or_else(|_| Self::Expression(trimmed.to_string()), Self::Literal)
    }

    /// Validate the threshold for activation.
    ///
    /// Literals must lie in `[0, 10_000_000]`; expressions must parse.
    ///
    /// # Errors
    ///
    /// Returns [`ThresholdError`] describing the first problem found.
    pub fn validate(&self, evaluator: &dyn ExpressionEvaluator) -> Result<(), ThresholdError> {
        match self {
            Self::Literal(value) => {
                if *value < Decimal::ZERO || *value > Decimal::from(MAX_LITERAL_THRESHOLD) {
                    return Err(ThresholdError::OutOfRange(*value));
                }
                Ok(())
            }
            Self::Expression(source) => evaluator
                .check(source)
                .map_err(ThresholdError::InvalidExpression),
        }
    }
}

impl From<&str> for ThresholdSpec {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl fmt::Display for ThresholdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value}"),
            Self::Expression(source) => f.write_str(source),
        }
    }
}

/// Threshold configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThresholdError {
    /// Literal threshold outside the accepted range.
    #[error("threshold {0} must be between 0 and 10000000")]
    OutOfRange(Decimal),
    /// Expression source does not parse.
    #[error("threshold expression is invalid: {0}")]
    InvalidExpression(#[source] EvaluationError),
}

// =============================================================================
// Predicate Evaluator
// =============================================================================

/// Outcome of testing one print against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Volume meets the threshold.
    Admitted,
    /// Volume is below the threshold.
    BelowThreshold,
    /// The threshold expression failed; the print is rejected.
    EvaluationFailed,
}

impl Admission {
    /// Check if the print was admitted.
    #[must_use]
    pub const fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// Metric label for this outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::BelowThreshold => "below_threshold",
            Self::EvaluationFailed => "evaluation_failed",
        }
    }
}

/// Build the bindings an expression sees for one print.
#[must_use]
pub fn bindings_for(print: &TradePrint, instrument: &Instrument) -> Bindings {
    Bindings::new()
        .with("trade.price", print.price.to_f64().unwrap_or(f64::NAN))
        .with("trade.volume", print.volume.to_f64().unwrap_or(f64::NAN))
        .with("trade.timestamp", print.timestamp.timestamp_millis() as f64)
        .with_flag("trade.buy", print.side.is_buy())
        .with("instrument.lot", instrument.lot.to_f64().unwrap_or(1.0))
}

/// Test a print against a threshold.
///
/// Negative thresholds count as zero, so a print is never admitted with a
/// negative volume. An expression result that is NaN or infinite rejects the
/// print whatever evaluator produced it.
pub fn evaluate(
    print: &TradePrint,
    instrument: &Instrument,
    spec: &ThresholdSpec,
    evaluator: &dyn ExpressionEvaluator,
) -> Admission {
    let threshold = match spec {
        ThresholdSpec::Literal(value) => (*value).max(Decimal::ZERO),
        ThresholdSpec::Expression(source) => {
            match evaluator.evaluate(source, &bindings_for(print, instrument)) {
                Ok(value) if !value.is_finite() => {
                    tracing::debug!(
                        symbol = %print.symbol,
                        result = value,
                        "Threshold expression produced a non-finite value, print rejected"
                    );
                    return Admission::EvaluationFailed;
                }
                Ok(value) if value <= 0.0 => Decimal::ZERO,
                Ok(value) => match Decimal::try_from(value) {
                    Ok(threshold) => threshold,
                    // Larger than any representable volume.
                    Err(_) => return Admission::BelowThreshold,
                },
                Err(e) => {
                    tracing::debug!(
                        symbol = %print.symbol,
                        error = %e,
                        "Threshold expression failed, print rejected"
                    );
                    return Admission::EvaluationFailed;
                }
            }
        }
    };

    if print.volume >= threshold {
        Admission::Admitted
    } else {
        Admission::BelowThreshold
    }
}

/// `admits(print, threshold)` bound to an evaluator.
///
/// Cheap to clone; clones share the evaluator.
#[derive(Clone)]
pub struct Predicate {
    spec: ThresholdSpec,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl Predicate {
    /// Bind a threshold to an evaluator.
    #[must_use]
    pub fn new(spec: ThresholdSpec, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { spec, evaluator }
    }

    /// Get the threshold specification.
    #[must_use]
    pub const fn spec(&self) -> &ThresholdSpec {
        &self.spec
    }

    /// Test a print, reporting why it was rejected.
    #[must_use]
    pub fn evaluate(&self, print: &TradePrint, instrument: &Instrument) -> Admission {
        evaluate(print, instrument, &self.spec, self.evaluator.as_ref())
    }

    /// Check if a print is admitted.
    #[must_use]
    pub fn admits(&self, print: &TradePrint, instrument: &Instrument) -> bool {
        self.evaluate(print, instrument).is_admitted()
    }
}

// =============================================================================
// Tests
// =============================================================================
