//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use kaco_types::{DeviceIdentity, EntryId};

/// A device stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Stable entry id assigned at configuration time.
    pub entry_id: EntryId,
    /// Display name.
    pub name: Option<String>,
    /// Network address the device is polled at.
    pub address: String,
    /// Serial number learned from the day log or configured.
    pub serial_number: Option<String>,
    /// MAC address from configuration.
    pub mac_address: Option<String>,
    /// Model reported by the day log.
    pub model: Option<String>,
    /// When the device was first registered.
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    /// Last registration or identity update.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl StoredDevice {
    /// Identity fields of this device.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            serial_number: self.serial_number.clone(),
            mac_address: self.mac_address.clone(),
            model: self.model.clone(),
        }
    }
}

/// Outcome of [`Store::record_identity`](crate::Store::record_identity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityChange {
    /// Nothing new.
    Unchanged,
    /// First serial number (or model/MAC) for this device.
    Learned,
    /// The device now reports a different serial number, e.g. after a
    /// hardware replacement.
    SerialChanged { previous: String },
}

impl IdentityChange {
    pub fn is_serial_change(&self) -> bool {
        matches!(self, IdentityChange::SerialChanged { .. })
    }
}

/// Summary of a stored statistic series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub statistic_id: String,
    /// Unit symbol, e.g. `"kWh"`.
    pub unit: String,
    pub point_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_start: Option<OffsetDateTime>,
}

/// Counts from one [`Store::write_points`](crate::Store::write_points) call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    /// Points at timestamps not present before.
    pub inserted: usize,
    /// Existing points replaced by live values.
    pub updated: usize,
    /// Imported points dropped because the timestamp was already taken.
    pub skipped: usize,
}

/// Reconciliation bookkeeping for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairState {
    pub entry_id: EntryId,
    /// When the automatic reconciliation last completed.
    #[serde(with = "time::serde::rfc3339::option")]
    pub migrated_at: Option<OffsetDateTime>,
    /// Last day whose energy has been imported from the device history.
    pub history_imported_until: Option<Date>,
    /// Cumulative energy at `history_imported_until`, in kWh.
    pub history_cumulative: f64,
}

impl RepairState {
    pub fn new(entry_id: EntryId) -> Self {
        Self {
            entry_id,
            migrated_at: None,
            history_imported_until: None,
            history_cumulative: 0.0,
        }
    }
}
