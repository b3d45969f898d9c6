//! Error types for kaco-store.

use std::path::PathBuf;

/// Result type for kaco-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kaco-store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Device not found in the registry.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The serial number already belongs to another registered device.
    #[error("Serial number {serial_number} is already bound to device {existing_entry_id}, not {entry_id}")]
    IdentityConflict {
        serial_number: String,
        entry_id: String,
        existing_entry_id: String,
    },

    /// A stored value could not be converted.
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}
