//! Stable device identifiers.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Opaque identifier assigned to a configured inverter.
///
/// Statistic identifiers are derived from it, so it must stay stable for the
/// lifetime of a device entry. Generated ids are 32 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for EntryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What is known about the physical device behind an entry.
///
/// The serial number is learned from the day log; the MAC address comes
/// from configuration only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceIdentity {
    pub serial_number: Option<String>,
    pub mac_address: Option<String>,
    pub model: Option<String>,
}

impl DeviceIdentity {
    /// Whether `serial` differs from an already known serial number.
    #[must_use]
    pub fn serial_changed(&self, serial: &str) -> bool {
        self.serial_number
            .as_deref()
            .is_some_and(|known| !known.is_empty() && known != serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique_hex() {
        let a = EntryId::generate();
        let b = EntryId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_serial_changed() {
        let mut identity = DeviceIdentity::default();
        assert!(!identity.serial_changed("BPI1"));

        identity.serial_number = Some("BPI1".into());
        assert!(!identity.serial_changed("BPI1"));
        assert!(identity.serial_changed("BPI2"));
    }
}
