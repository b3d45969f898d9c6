//! Local persistence for KACO inverter statistics and device registry.
//!
//! This crate provides SQLite-based storage for the long-term statistics
//! recorded by the service and for the identity learned from each device.
//!
//! # Features
//!
//! - Device registry keyed by stable entry id, never by serial number
//! - Statistic series with one point per timestamp
//! - Live points overwrite, imported points never do
//! - Reconciliation bookkeeping per device (migration, history import)
//!
//! # Example
//!
//! ```no_run
//! use kaco_store::{PointQuery, Store};
//!
//! let store = Store::open_default()?;
//!
//! let query = PointQuery::new("sensor.kaco_entry9f2_energy_today")
//!     .newest_first()
//!     .limit(24);
//! let points = store.query_points(&query)?;
//! # Ok::<(), kaco_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;
mod traits;

pub use error::{Error, Result};
pub use models::{IdentityChange, RepairState, SeriesInfo, StoredDevice, WriteSummary};
pub use queries::PointQuery;
pub use store::Store;
pub use traits::{DeviceRegistry, StatisticsStore};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/kaco/data.db`
/// - macOS: `~/Library/Application Support/kaco/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\kaco\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("kaco")
        .join("data.db")
}
