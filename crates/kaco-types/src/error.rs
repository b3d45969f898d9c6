//! Error types for parsing inverter responses in kaco-types.

use thiserror::Error;

/// Errors that can occur when parsing data served by a KACO inverter.
///
/// This error type is transport-agnostic; timeouts and connection failures
/// belong in kaco-core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The response had the wrong number of `;`-separated fields.
    #[error("Expected {expected} fields, got {actual}")]
    FieldCount {
        /// Number of fields the format requires.
        expected: usize,
        /// Number of fields actually present.
        actual: usize,
    },

    /// A field could not be parsed as a number.
    #[error("Invalid value '{value}' in field {field}")]
    InvalidNumber {
        /// Name of the offending field.
        field: &'static str,
        /// The raw text that failed to parse.
        value: String,
    },

    /// The daily log contained no usable data rows.
    #[error("Daily log contains no data rows")]
    EmptyLog,

    /// A channel key did not name a known channel.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// The CSV reader rejected the input.
    #[error("Malformed CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type alias using kaco-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
