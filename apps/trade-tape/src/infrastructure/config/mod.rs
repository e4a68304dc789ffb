//! Configuration Module
//!
//! Tape settings validation and environment loading for the binary.

mod settings;

pub use settings::{
    AppConfig, ConfigError, DEFAULT_DEPTH, DEFAULT_THRESHOLD, MetricsSettings, TapeConfig,
    ValidatedTapeConfig,
};
