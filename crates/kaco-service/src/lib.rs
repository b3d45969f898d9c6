//! Background collector and HTTP REST API for KACO solar inverters.
//!
//! This crate provides a service that:
//! - Polls every configured inverter on two cadences (realtime and day log)
//! - Keeps the last known value of each channel through nightly outages
//! - Records hourly statistics and a cumulative energy series
//! - Reconciles statistics left behind under older identifiers
//! - Exposes a REST API for live values, connectivity, and statistics
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check
//! - `GET /api/status` - Poll statistics and connectivity of every device
//! - `GET /api/devices` - Registered devices
//! - `GET /api/devices/{id}` - One registered device
//! - `GET /api/devices/{id}/sensors` - Current value, quality, unit, and age per channel
//! - `GET /api/devices/{id}/connectivity` - Online/Offline
//! - `GET /api/devices/{id}/statistics/{channel}` - Stored statistic points
//! - `POST /api/devices/{id}/repair` - Start a reconciliation (202, 409 if running)
//! - `GET /api/devices/{id}/repair` - Reconciliation status and report
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/kaco/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [storage]
//! path = "~/.local/share/kaco/data.db"
//!
//! [[devices]]
//! name = "Roof"
//! address = "192.168.1.50"
//! fast_interval = 20
//! slow_interval = 120
//! grid_voltage = true
//! ```
//!
//! Devices without an `entry_id` get one on first start; it is written back
//! to the file.

pub mod api;
pub mod collector;
pub mod config;
pub mod recorder;
pub mod repair;
pub mod state;

pub use collector::{Collector, SetupError};
pub use config::{Config, ConfigError, DeviceConfig, ServerConfig, StorageConfig, ValidationError};
pub use recorder::StatisticsRecorder;
pub use repair::{Reconciler, RepairError, RepairReport, RepairStatus, RepairTracker};
pub use state::{AppState, DeviceRuntime};
