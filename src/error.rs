//! Custom error types for the driver.
//!
//! This module defines the primary error type, `SmuError`, for the whole crate.
//! Using the `thiserror` crate, it provides one consistent way to report what can
//! go wrong while talking to a Keysight B2900 SMU, from configuration problems to
//! transport failures and errors reported by the instrument itself.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically a malformed TOML file or an
//!   environment variable that cannot be deserialized into the expected type.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine
//!   (e.g. a zero timeout or an unknown log level). Caught by `SmuConfig::validate`.
//! - **`Io`** / **`Transport`** / **`Timeout`**: Transport-level failures. These are
//!   surfaced as-is; the driver never retries or tries to repair a session.
//! - **`NotConnected`**: The session (or transport) has been closed.
//! - **`UnexpectedDevice`**: `*IDN?` answered with a model other than the expected one.
//! - **`Parse`**: A reply that does not have the shape the command promises.
//! - **`LimitOutOfRange`** / **`InvalidArgument`**: Rejected locally, before any I/O.
//! - **`Instrument`**: An entry popped from the instrument's error queue (`:SYST:ERR?`).
//! - **`FeatureNotEnabled`**: The requested transport was compiled out.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type SmuResult<T> = std::result::Result<T, SmuError>;

/// One entry of the instrument error queue, e.g. `-222,"Data out of range"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentError {
    /// SCPI error code. `0` means "No error".
    pub code: i32,
    /// Human readable message as reported by the instrument.
    pub message: String,
}

impl InstrumentError {
    /// Whether this entry is the `0,"No error"` terminator of the queue.
    pub fn is_no_error(&self) -> bool {
        self.code == 0
    }
}

impl fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},\"{}\"", self.code, self.message)
    }
}

#[derive(Error, Debug)]
pub enum SmuError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {timeout:?} waiting for reply to '{command}'")]
    Timeout { command: String, timeout: Duration },

    #[error("Device not connected.")]
    NotConnected,

    #[error("Unexpected device found: expected model '{expected}', got '{found}'")]
    UnexpectedDevice { expected: String, found: String },

    #[error("Malformed response to '{context}': '{response}'")]
    Parse { context: String, response: String },

    #[error("The limit {limit} {unit} is not within the range {range} {unit}. Please set the range first")]
    LimitOutOfRange {
        limit: f64,
        range: f64,
        unit: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Instrument reported error {0}")]
    Instrument(InstrumentError),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[cfg(feature = "storage_csv")]
    #[error("CSV export error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<figment::Error> for SmuError {
    fn from(value: figment::Error) -> Self {
        SmuError::Config(Box::new(value))
    }
}

impl SmuError {
    /// Build a `Parse` error for a reply to `context`.
    pub fn parse(context: impl Into<String>, response: impl Into<String>) -> Self {
        SmuError::Parse {
            context: context.into(),
            response: response.into(),
        }
    }

    /// Whether the error came from the transport rather than from local validation
    /// or the instrument's own error queue.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SmuError::Io(_) | SmuError::Transport(_) | SmuError::Timeout { .. }
        )
    }
}
