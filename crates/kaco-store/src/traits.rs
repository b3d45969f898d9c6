//! Storage interfaces consumed by reconciliation and the collector.
//!
//! [`Store`](crate::Store) implements both traits; tests and alternative
//! backends can provide their own.

use time::{Date, OffsetDateTime};

use kaco_types::{DeviceIdentity, EntryId, StatisticPoint, Unit};

use crate::error::Result;
use crate::models::{IdentityChange, RepairState, SeriesInfo, StoredDevice, WriteSummary};
use crate::queries::PointQuery;
use crate::store::Store;

/// Long-term statistics storage.
pub trait StatisticsStore: Send {
    // --- Series ---

    /// Series whose identifier starts with `prefix`.
    fn list_series(&self, prefix: &str) -> Result<Vec<SeriesInfo>>;

    /// Delete a series; returns the number of points removed.
    fn delete_series(&self, statistic_id: &str) -> Result<usize>;

    // --- Points ---

    fn query_points(&self, query: &PointQuery) -> Result<Vec<StatisticPoint>>;

    /// Latest point strictly before `start`.
    fn point_before(&self, statistic_id: &str, start: OffsetDateTime) -> Result<Option<StatisticPoint>>;

    /// Write points keyed by timestamp. Live points win over imported ones.
    fn write_points(&self, statistic_id: &str, unit: Unit, points: &[StatisticPoint]) -> Result<WriteSummary>;
}

/// Device registry keyed by stable entry id.
pub trait DeviceRegistry: Send {
    // --- Identity ---

    fn resolve(&self, entry_id: &EntryId) -> Result<Option<StoredDevice>>;

    /// Entry ids of every registered device.
    fn entry_ids(&self) -> Result<Vec<EntryId>>;

    /// Persist learned identity fields.
    fn record_identity(&self, entry_id: &EntryId, identity: &DeviceIdentity) -> Result<IdentityChange>;

    // --- Reconciliation bookkeeping ---

    fn repair_state(&self, entry_id: &EntryId) -> Result<RepairState>;

    fn set_migrated(&self, entry_id: &EntryId, at: OffsetDateTime) -> Result<()>;

    fn set_history_progress(&self, entry_id: &EntryId, until: Date, cumulative: f64) -> Result<()>;
}

impl StatisticsStore for Store {
    fn list_series(&self, prefix: &str) -> Result<Vec<SeriesInfo>> {
        Store::list_series(self, prefix)
    }

    fn delete_series(&self, statistic_id: &str) -> Result<usize> {
        Store::delete_series(self, statistic_id)
    }

    fn query_points(&self, query: &PointQuery) -> Result<Vec<StatisticPoint>> {
        Store::query_points(self, query)
    }

    fn point_before(&self, statistic_id: &str, start: OffsetDateTime) -> Result<Option<StatisticPoint>> {
        Store::point_before(self, statistic_id, start)
    }

    fn write_points(&self, statistic_id: &str, unit: Unit, points: &[StatisticPoint]) -> Result<WriteSummary> {
        Store::write_points(self, statistic_id, unit, points)
    }
}

impl DeviceRegistry for Store {
    fn resolve(&self, entry_id: &EntryId) -> Result<Option<StoredDevice>> {
        self.get_device(entry_id)
    }

    fn entry_ids(&self) -> Result<Vec<EntryId>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .map(|d| d.entry_id)
            .collect())
    }

    fn record_identity(&self, entry_id: &EntryId, identity: &DeviceIdentity) -> Result<IdentityChange> {
        Store::record_identity(self, entry_id, identity)
    }

    fn repair_state(&self, entry_id: &EntryId) -> Result<RepairState> {
        self.get_repair_state(entry_id)
    }

    fn set_migrated(&self, entry_id: &EntryId, at: OffsetDateTime) -> Result<()> {
        Store::set_migrated(self, entry_id, at)
    }

    fn set_history_progress(&self, entry_id: &EntryId, until: Date, cumulative: f64) -> Result<()> {
        Store::set_history_progress(self, entry_id, until, cumulative)
    }
}
