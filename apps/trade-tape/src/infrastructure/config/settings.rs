//! Tape Configuration Settings
//!
//! Per-tape settings (depth, threshold, currency display) and the binary's
//! environment configuration.

use std::path::PathBuf;

use crate::domain::buffer::{Depth, InvalidDepth};
use crate::domain::expression::ExpressionEvaluator;
use crate::domain::threshold::{ThresholdError, ThresholdSpec};
use crate::domain::trade::Instrument;

/// Default tape depth.
pub const DEFAULT_DEPTH: usize = 100;

/// Default threshold source.
pub const DEFAULT_THRESHOLD: &str = "0";

/// Raw tape settings, as entered by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeConfig {
    /// Number of prints kept on the tape.
    pub depth: usize,
    /// Volume threshold: a number or an expression.
    pub threshold: String,
    /// Show the quote currency in the price column header.
    pub display_currency: bool,
}

impl Default for TapeConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            threshold: DEFAULT_THRESHOLD.to_string(),
            display_currency: false,
        }
    }
}

impl TapeConfig {
    /// Set the depth.
    #[must_use]
    pub const fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Set the threshold source.
    #[must_use]
    pub fn with_threshold(mut self, threshold: impl Into<String>) -> Self {
        self.threshold = threshold.into();
        self
    }

    /// Set currency display.
    #[must_use]
    pub const fn with_display_currency(mut self, display_currency: bool) -> Self {
        self.display_currency = display_currency;
        self
    }

    /// Validate against the expression sandbox that will evaluate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDepth`] for a depth outside `[1, 500]`
    /// and [`ConfigError::InvalidThreshold`] for an out-of-range literal or an
    /// expression that does not parse.
    pub fn validate(
        &self,
        evaluator: &dyn ExpressionEvaluator,
    ) -> Result<ValidatedTapeConfig, ConfigError> {
        let depth = Depth::new(self.depth)?;
        let threshold = ThresholdSpec::parse(&self.threshold);
        threshold.validate(evaluator)?;

        Ok(ValidatedTapeConfig {
            depth,
            threshold,
            display_currency: self.display_currency,
        })
    }
}

/// Tape settings that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTapeConfig {
    /// Buffer depth.
    pub depth: Depth,
    /// Parsed threshold.
    pub threshold: ThresholdSpec,
    /// Show the quote currency in the price column header.
    pub display_currency: bool,
}

impl ValidatedTapeConfig {
    /// Header for the price column of `instrument`.
    #[must_use]
    pub fn price_label(&self, instrument: &Instrument) -> String {
        match (&instrument.currency, self.display_currency) {
            (Some(currency), true) => format!("Price, {currency}"),
            _ => "Price".to_string(),
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSettings {
    /// Install the exporter.
    pub enabled: bool,
    /// Listen port for the scrape endpoint.
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Complete configuration for the `trade-tape` binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Symbol the tape is bound to at startup.
    pub symbol: String,
    /// Tape settings.
    pub tape: TapeConfig,
    /// Replay scenario to play.
    pub scenario: Option<PathBuf>,
    /// Metrics exporter settings.
    pub metrics: MetricsSettings,
}

impl AppConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `TAPE_SYMBOL` is missing or empty, or a numeric
    /// variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`AppConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let symbol = lookup("TAPE_SYMBOL")
            .ok_or_else(|| ConfigError::MissingEnvVar("TAPE_SYMBOL".to_string()))?;
        if symbol.trim().is_empty() {
            return Err(ConfigError::EmptyValue("TAPE_SYMBOL".to_string()));
        }

        let tape = TapeConfig {
            depth: parse_var(&lookup, "TAPE_DEPTH", DEFAULT_DEPTH)?,
            threshold: lookup("TAPE_THRESHOLD").unwrap_or_else(|| DEFAULT_THRESHOLD.to_string()),
            display_currency: parse_bool(&lookup, "TAPE_DISPLAY_CURRENCY", false),
        };

        let metrics = MetricsSettings {
            enabled: parse_bool(&lookup, "TAPE_METRICS_ENABLED", false),
            port: parse_var(&lookup, "TAPE_METRICS_PORT", MetricsSettings::default().port)?,
        };

        Ok(Self {
            symbol: symbol.trim().to_uppercase(),
            tape,
            scenario: lookup("TAPE_SCENARIO")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            metrics,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),

    /// Environment variable does not parse.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },

    /// Depth outside the accepted range.
    #[error(transparent)]
    InvalidDepth(#[from] InvalidDepth),

    /// Threshold out of range or not a valid expression.
    #[error(transparent)]
    InvalidThreshold(#[from] ThresholdError),
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).map_or(default, |v| {
        matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}
