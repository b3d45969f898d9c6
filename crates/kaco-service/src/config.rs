//! Server configuration.
//!
//! Read from `server.toml` with three sections: `[server]`, `[storage]`,
//! and one `[[devices]]` table per inverter. Every device gets a stable
//! `entry_id` the first time the configuration is loaded; it is written
//! back to the file so statistic identifiers survive restarts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::UtcOffset;

use kaco_core::{HistoryOptions, PollerConfig};
use kaco_core::statistics::DEFAULT_REGRESSION_TOLERANCE;
use kaco_types::{Channel, ChannelGroup, DeviceIdentity, EntryId};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Inverters to poll.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Assign a fresh entry id to every device that has none.
    ///
    /// Returns `true` if any id was generated and the file should be saved.
    pub fn ensure_entry_ids(&mut self) -> bool {
        let mut changed = false;
        for device in &mut self.devices {
            if device.entry_id.is_none() {
                device.entry_id = Some(EntryId::generate());
                changed = true;
            }
        }
        changed
    }

    /// Validate the configuration and return every error found.
    ///
    /// This checks:
    /// - Server bind address is valid (host:port format)
    /// - Storage path is not empty
    /// - Each device passes [`DeviceConfig::validate`]
    /// - No duplicate device addresses or entry ids
    ///
    /// # Example
    ///
    /// ```
    /// use kaco_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());

        let mut seen_addresses = HashSet::new();
        let mut seen_ids = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if !seen_addresses.insert(device.host().to_lowercase()) {
                errors.push(ValidationError {
                    field: format!("{}.address", prefix),
                    message: format!("duplicate device address '{}'", device.address),
                });
            }

            if let Some(id) = &device.entry_id
                && !seen_ids.insert(id.clone())
            {
                errors.push(ValidationError {
                    field: format!("{}.entry_id", prefix),
                    message: format!("duplicate entry id '{}'", id),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
    /// Capacity of each device's event channel.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            event_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError {
                field: "server.bind".to_string(),
                message: "bind address cannot be empty".to_string(),
            });
        } else {
            match self.bind.rsplit_once(':') {
                None => errors.push(ValidationError {
                    field: "server.bind".to_string(),
                    message: format!(
                        "invalid bind address '{}': expected format 'host:port'",
                        self.bind
                    ),
                }),
                Some((_, port)) => match port.parse::<u16>() {
                    Ok(0) => errors.push(ValidationError {
                        field: "server.bind".to_string(),
                        message: "port cannot be 0".to_string(),
                    }),
                    Err(_) => errors.push(ValidationError {
                        field: "server.bind".to_string(),
                        message: format!("invalid port '{}': must be a number 1-65535", port),
                    }),
                    Ok(_) => {}
                },
            }
        }

        if self.event_buffer == 0 {
            errors.push(ValidationError {
                field: "server.event_buffer".to_string(),
                message: "event buffer must hold at least one event".to_string(),
            });
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: kaco_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Minimum fast poll interval in seconds.
pub const MIN_FAST_INTERVAL: u64 = 5;
/// Minimum slow poll interval in seconds.
pub const MIN_SLOW_INTERVAL: u64 = 30;
/// Maximum poll interval in seconds (1 hour).
pub const MAX_POLL_INTERVAL: u64 = 3600;
/// Largest accepted clock offset in minutes.
pub const MAX_UTC_OFFSET_MINUTES: i16 = 14 * 60;

/// Configuration for one inverter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable id; generated on first load when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<EntryId>,
    /// Friendly name.
    #[serde(default)]
    pub name: Option<String>,
    /// Host name or IP address of the inverter's web server.
    pub address: String,
    /// Realtime poll interval in seconds.
    #[serde(default = "default_fast_interval")]
    pub fast_interval: u64,
    /// Day log poll interval in seconds.
    #[serde(default = "default_slow_interval")]
    pub slow_interval: u64,
    /// Offset of the inverter's clock from UTC in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i16,
    /// Consecutive realtime failures before the device is offline.
    #[serde(default = "default_debounce_threshold")]
    pub debounce_threshold: u32,
    /// Randomize retry delays.
    #[serde(default)]
    pub jitter: bool,
    #[serde(default)]
    pub generator_voltage: bool,
    #[serde(default)]
    pub generator_current: bool,
    #[serde(default)]
    pub grid_voltage: bool,
    #[serde(default)]
    pub grid_current: bool,
    /// Serial number known before the first day log is read.
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Pause between day log requests during a history import.
    #[serde(default = "default_history_pause")]
    pub history_request_pause_secs: u64,
    /// Drop in kWh treated as a counter reset during a history import.
    #[serde(default = "default_regression_tolerance")]
    pub regression_tolerance: f64,
}

fn default_fast_interval() -> u64 {
    20
}

fn default_slow_interval() -> u64 {
    120
}

fn default_debounce_threshold() -> u32 {
    3
}

fn default_history_pause() -> u64 {
    5
}

fn default_regression_tolerance() -> f64 {
    DEFAULT_REGRESSION_TOLERANCE
}

impl DeviceConfig {
    /// A device at `address` with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            entry_id: None,
            name: None,
            address: address.into(),
            fast_interval: default_fast_interval(),
            slow_interval: default_slow_interval(),
            utc_offset_minutes: 0,
            debounce_threshold: default_debounce_threshold(),
            jitter: false,
            generator_voltage: false,
            generator_current: false,
            grid_voltage: false,
            grid_current: false,
            serial_number: None,
            mac_address: None,
            history_request_pause_secs: default_history_pause(),
            regression_tolerance: default_regression_tolerance(),
        }
    }

    /// Address without scheme or trailing slash.
    pub fn host(&self) -> &str {
        let address = self.address.trim();
        let address = address
            .strip_prefix("http://")
            .or_else(|| address.strip_prefix("https://"))
            .unwrap_or(address);
        address.trim_end_matches('/')
    }

    /// Display name, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(i32::from(self.utc_offset_minutes) * 60)
            .unwrap_or(UtcOffset::UTC)
    }

    /// Optional channel groups switched on for this device.
    pub fn channel_groups(&self) -> Vec<ChannelGroup> {
        [
            (self.generator_voltage, ChannelGroup::GeneratorVoltage),
            (self.generator_current, ChannelGroup::GeneratorCurrent),
            (self.grid_voltage, ChannelGroup::GridVoltage),
            (self.grid_current, ChannelGroup::GridCurrent),
        ]
        .into_iter()
        .filter_map(|(enabled, group)| enabled.then_some(group))
        .collect()
    }

    /// Channels exposed for this device.
    pub fn channels(&self) -> Vec<Channel> {
        let groups = self.channel_groups();
        Channel::enabled(&groups).collect()
    }

    /// Identity fields known from configuration.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            serial_number: self.serial_number.clone().filter(|s| !s.is_empty()),
            mac_address: self.mac_address.as_deref().map(normalize_mac),
            model: None,
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            fast_interval: Duration::from_secs(self.fast_interval),
            slow_interval: Duration::from_secs(self.slow_interval),
            debounce_threshold: self.debounce_threshold,
            jitter: self.jitter,
            utc_offset: self.utc_offset(),
            ..PollerConfig::default()
        }
    }

    /// History download settings for reconciliation.
    pub fn history_options(&self) -> HistoryOptions {
        HistoryOptions::new()
            .utc_offset(self.utc_offset())
            .request_pause(Duration::from_secs(self.history_request_pause_secs))
    }

    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: format!("{}.{}", prefix, field),
                message,
            });
        };

        let host = self.host();
        if host.is_empty() {
            push("address", "device address cannot be empty".to_string());
        } else if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
        {
            push(
                "address",
                format!("device address '{}' is not a host name or IP address", self.address),
            );
        }

        if let Some(name) = &self.name
            && name.is_empty()
        {
            push("name", "name cannot be empty string (use null/omit instead)".to_string());
        }

        if let Some(id) = &self.entry_id
            && id.as_str().is_empty()
        {
            push("entry_id", "entry id cannot be empty".to_string());
        }

        for (field, value, min) in [
            ("fast_interval", self.fast_interval, MIN_FAST_INTERVAL),
            ("slow_interval", self.slow_interval, MIN_SLOW_INTERVAL),
        ] {
            if value < min {
                push(
                    field,
                    format!("interval {} is too short (minimum {} seconds)", value, min),
                );
            } else if value > MAX_POLL_INTERVAL {
                push(
                    field,
                    format!(
                        "interval {} is too long (maximum {} seconds / 1 hour)",
                        value, MAX_POLL_INTERVAL
                    ),
                );
            }
        }

        if self.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            push(
                "utc_offset_minutes",
                format!(
                    "offset {} is out of range (±{} minutes)",
                    self.utc_offset_minutes, MAX_UTC_OFFSET_MINUTES
                ),
            );
        }

        if self.debounce_threshold == 0 {
            push("debounce_threshold", "threshold must be at least 1".to_string());
        }

        if let Some(mac) = &self.mac_address
            && !is_valid_mac(mac)
        {
            push(
                "mac_address",
                format!("'{}' is not a MAC address (expected AA:BB:CC:DD:EE:FF)", mac),
            );
        }

        if !self.regression_tolerance.is_finite() || self.regression_tolerance < 0.0 {
            push(
                "regression_tolerance",
                "tolerance must be a non-negative number".to_string(),
            );
        }

        errors
    }
}

fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split([':', '-']).collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn normalize_mac(mac: &str) -> String {
    mac.replace('-', ":").to_uppercase()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `devices[0].address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kaco")
        .join("server.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation_errors(config: &Config) -> Vec<ValidationError> {
        match config.validate() {
            Err(ConfigError::Validation(errors)) => errors,
            Err(e) => panic!("unexpected error: {e}"),
            Ok(()) => Vec::new(),
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.storage.path, kaco_store::default_db_path());
        assert!(config.devices.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_device_config_defaults() {
        let config: DeviceConfig = toml::from_str(r#"address = "192.168.1.50""#).unwrap();
        assert_eq!(config.fast_interval, 20);
        assert_eq!(config.slow_interval, 120);
        assert_eq!(config.debounce_threshold, 3);
        assert_eq!(config.history_request_pause_secs, 5);
        assert!(config.entry_id.is_none());
        assert_eq!(
            config.channels(),
            vec![
                Channel::Power,
                Channel::EnergyToday,
                Channel::Temperature,
                Channel::Status
            ]
        );
        assert!(config.validate("devices[0]").is_empty());
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:8099"

            [storage]
            path = "/data/kaco.db"

            [[devices]]
            entry_id = "entry9f2"
            name = "Roof"
            address = "192.168.1.50"
            fast_interval = 10
            utc_offset_minutes = 60
            grid_voltage = true
            mac_address = "aa-bb-cc-dd-ee-ff"

            [[devices]]
            address = "inverter-garage.local"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.devices.len(), 2);

        let roof = &config.devices[0];
        assert_eq!(roof.entry_id, Some(EntryId::new("entry9f2")));
        assert_eq!(roof.utc_offset(), UtcOffset::from_hms(1, 0, 0).unwrap());
        assert!(roof.channels().contains(&Channel::GridVoltage3));
        assert!(!roof.channels().contains(&Channel::GridCurrent1));
        assert_eq!(roof.identity().mac_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));

        let poller = roof.poller_config();
        assert_eq!(poller.fast_interval, Duration::from_secs(10));
        assert!(poller.validate().is_ok());
    }

    #[test]
    fn test_ensure_entry_ids() {
        let mut config = Config::default();
        config.devices.push(DeviceConfig::new("192.168.1.50"));
        let mut known = DeviceConfig::new("192.168.1.51");
        known.entry_id = Some(EntryId::new("entry9f2"));
        config.devices.push(known);

        assert!(config.ensure_entry_ids());
        assert!(config.devices[0].entry_id.is_some());
        assert_eq!(config.devices[1].entry_id, Some(EntryId::new("entry9f2")));
        assert!(!config.ensure_entry_ids());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("kaco").join("server.toml");

        let mut config = Config::default();
        config.storage.path = PathBuf::from("/tmp/kaco.db");
        config.devices.push(DeviceConfig::new("192.168.1.50"));
        config.ensure_entry_ids();

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();

        assert_eq!(loaded.storage.path, PathBuf::from("/tmp/kaco.db"));
        assert_eq!(loaded.devices[0].entry_id, config.devices[0].entry_id);
        assert_eq!(loaded.devices[0].address, "192.168.1.50");
    }

    #[test]
    fn test_config_load_errors() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));

        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();
        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_server_bind_validation() {
        for bind in ["127.0.0.1:8080", "[::1]:8080", "localhost:8080"] {
            let config = ServerConfig {
                bind: bind.to_string(),
                ..Default::default()
            };
            assert!(config.validate().is_empty(), "{bind}");
        }

        for (bind, message) in [
            ("", "cannot be empty"),
            ("127.0.0.1", "host:port"),
            ("127.0.0.1:0", "cannot be 0"),
            ("127.0.0.1:abc", "must be a number"),
        ] {
            let config = ServerConfig {
                bind: bind.to_string(),
                ..Default::default()
            };
            let errors = config.validate();
            assert_eq!(errors.len(), 1, "{bind}");
            assert!(errors[0].message.contains(message), "{bind}");
        }
    }

    #[test]
    fn test_device_validation_collects_all_errors() {
        let device = DeviceConfig {
            address: "not an address".to_string(),
            fast_interval: 4,
            slow_interval: 7200,
            utc_offset_minutes: 900,
            debounce_threshold: 0,
            mac_address: Some("AA:BB:CC".to_string()),
            name: Some(String::new()),
            ..DeviceConfig::new("")
        };

        let errors = device.validate("devices[0]");
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "devices[0].address",
                "devices[0].name",
                "devices[0].fast_interval",
                "devices[0].slow_interval",
                "devices[0].utc_offset_minutes",
                "devices[0].debounce_threshold",
                "devices[0].mac_address",
            ]
        );
    }

    #[test]
    fn test_interval_floors() {
        let mut device = DeviceConfig::new("192.168.1.50");
        device.fast_interval = MIN_FAST_INTERVAL;
        device.slow_interval = MIN_SLOW_INTERVAL;
        assert!(device.validate("d").is_empty());

        device.slow_interval = MIN_SLOW_INTERVAL - 1;
        let errors = device.validate("d");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("too short"));
    }

    #[test]
    fn test_empty_address() {
        let errors = DeviceConfig::new("").validate("devices[0]");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("cannot be empty"));
    }

    #[test]
    fn test_duplicate_addresses_and_ids() {
        let mut config = Config::default();
        let mut a = DeviceConfig::new("192.168.1.50");
        a.entry_id = Some(EntryId::new("e1"));
        let mut b = DeviceConfig::new("http://192.168.1.50/");
        b.entry_id = Some(EntryId::new("e1"));
        config.devices = vec![a, b];

        let errors = validation_errors(&config);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.message.contains("duplicate device address")));
        assert!(errors.iter().any(|e| e.message.contains("duplicate entry id")));
    }

    #[test]
    fn test_mac_validation() {
        assert!(is_valid_mac("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac("aa-bb-cc-dd-ee-ff"));
        assert!(!is_valid_mac("AA:BB:CC:DD:EE"));
        assert!(!is_valid_mac("GG:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("kaco/server.toml"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let error = ConfigError::Validation(vec![
            ValidationError {
                field: "server.bind".to_string(),
                message: "port cannot be 0".to_string(),
            },
            ValidationError {
                field: "devices[0].address".to_string(),
                message: "cannot be empty".to_string(),
            },
        ]);
        let display = format!("{}", error);
        assert!(display.contains("server.bind: port cannot be 0"));
        assert!(display.contains("devices[0].address"));
    }
}
