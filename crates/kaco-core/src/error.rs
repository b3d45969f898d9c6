//! Error types for kaco-core.
//!
//! This module defines the errors that can occur when talking to a KACO
//! inverter's embedded web server.
//!
//! # Error Recovery Strategies
//!
//! The inverter shuts down every night and reboots without warning, so most
//! errors are expected and absorbed by the poller's backoff and the
//! last-known cache. Only configuration errors reach the operator.
//!
//! | Error Type | Fetch kind | Strategy |
//! |------------|------------|----------|
//! | [`Error::Timeout`] | `Timeout` | Back off, serve cached values |
//! | [`Error::Unreachable`] | `Unreachable` | Back off, serve cached values |
//! | [`Error::HttpStatus`] | `Unreachable` | Back off, serve cached values |
//! | [`Error::MalformedResponse`] | `MalformedResponse` | Back off; a rebooting device often serves partial files |
//! | [`Error::InvalidConfig`] | - | Do not retry, fix configuration |
//! | [`Error::Cancelled`] | - | Do not retry, the device is being torn down |
//!
//! ## Recommended Timeouts
//!
//! | Request | Timeout | Notes |
//! |---------|---------|-------|
//! | `realtime.csv` | 10 seconds | Usually answers within 1s |
//! | `YYYYMMDD.csv` | 15 seconds | Day logs grow to ~100 KB by evening |
//!
//! ## Using RetryConfig
//!
//! One-shot requests outside the poller (history download) wrap their calls
//! in [`crate::with_retry`]:
//!
//! ```ignore
//! use kaco_core::{RetryConfig, with_retry};
//!
//! let log = with_retry(&RetryConfig::for_history(), "fetch_day", || async {
//!     fetcher.fetch_day(date).await
//! }).await?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when communicating with an inverter.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request did not complete within its timeout.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The device could not be reached.
    #[error("Device at {address} unreachable: {reason}")]
    Unreachable {
        /// Address that was contacted.
        address: String,
        /// Transport-level reason.
        reason: String,
    },

    /// The device answered with an unexpected HTTP status.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Status code returned.
        status: u16,
        /// URL that was requested.
        url: String,
    },

    /// The device answered, but the body could not be parsed.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Classification of fetch failures seen by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Timeout,
    Unreachable,
    MalformedResponse,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::MalformedResponse => write!(f, "malformed response"),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create an unreachable error for `address`.
    pub fn unreachable(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// How the poller classifies this error, or `None` if it is not a
    /// fetch failure.
    #[must_use]
    pub fn fetch_kind(&self) -> Option<FetchErrorKind> {
        match self {
            Error::Timeout { .. } => Some(FetchErrorKind::Timeout),
            Error::Unreachable { .. } | Error::HttpStatus { .. } => {
                Some(FetchErrorKind::Unreachable)
            }
            Error::MalformedResponse(_) => Some(FetchErrorKind::MalformedResponse),
            Error::InvalidConfig(_) | Error::Cancelled => None,
        }
    }
}

impl From<kaco_types::ParseError> for Error {
    fn from(err: kaco_types::ParseError) -> Self {
        Error::MalformedResponse(err.to_string())
    }
}

/// Result type alias using kaco-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::timeout("fetch_realtime", Duration::from_secs(10));
        assert!(err.to_string().contains("fetch_realtime"));
        assert!(err.to_string().contains("10s"));

        let err = Error::unreachable("192.168.1.50", "connection refused");
        assert_eq!(
            err.to_string(),
            "Device at 192.168.1.50 unreachable: connection refused"
        );

        let err = Error::Cancelled;
        assert_eq!(err.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_fetch_kind() {
        assert_eq!(
            Error::timeout("x", Duration::from_secs(1)).fetch_kind(),
            Some(FetchErrorKind::Timeout)
        );
        assert_eq!(
            Error::HttpStatus {
                status: 503,
                url: "http://inverter/realtime.csv".into()
            }
            .fetch_kind(),
            Some(FetchErrorKind::Unreachable)
        );
        assert_eq!(Error::invalid_config("bad").fetch_kind(), None);
        assert_eq!(Error::Cancelled.fetch_kind(), None);
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse = kaco_types::ParseError::FieldCount {
            expected: 14,
            actual: 3,
        };
        let err: Error = parse.into();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::MalformedResponse));
        assert!(err.to_string().contains("Expected 14 fields, got 3"));
    }
}
