//! Main store implementation.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::{debug, info};

use kaco_types::{DeviceIdentity, EntryId, PointOrigin, StatisticPoint, Unit};

use crate::error::{Error, Result};
use crate::models::{IdentityChange, RepairState, SeriesInfo, StoredDevice, WriteSummary};
use crate::queries::PointQuery;
use crate::schema;

const DEVICE_COLUMNS: &str =
    "entry_id, name, address, serial_number, mac_address, model, first_seen, last_seen";

/// SQLite-based store for inverter statistics and the device registry.
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

// Device registry
impl Store {
    /// Register a configured device, or refresh its name and address.
    pub fn register_device(
        &self,
        entry_id: &EntryId,
        name: Option<&str>,
        address: &str,
    ) -> Result<StoredDevice> {
        let now = OffsetDateTime::now_utc().unix_timestamp();

        self.conn.execute(
            "INSERT INTO devices (entry_id, name, address, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(entry_id) DO UPDATE SET
                name = COALESCE(?2, name),
                address = ?3,
                last_seen = ?4",
            params![entry_id.as_str(), name, address, now],
        )?;

        self.get_device(entry_id)?
            .ok_or_else(|| Error::DeviceNotFound(entry_id.to_string()))
    }

    /// Get a device by entry id.
    pub fn get_device(&self, entry_id: &EntryId) -> Result<Option<StoredDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE entry_id = ?");
        let device = self
            .conn
            .query_row(&sql, [entry_id.as_str()], device_from_row)
            .optional()?;
        Ok(device)
    }

    /// The device currently bound to `serial_number`, if any.
    pub fn find_by_serial(&self, serial_number: &str) -> Result<Option<StoredDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE serial_number = ?");
        let device = self
            .conn
            .query_row(&sql, [serial_number], device_from_row)
            .optional()?;
        Ok(device)
    }

    /// Fail with [`Error::IdentityConflict`] if `serial_number` is bound to
    /// a device other than `entry_id`. Unregistered entries may be checked.
    pub fn ensure_serial_available(&self, entry_id: &EntryId, serial_number: &str) -> Result<()> {
        match self.find_by_serial(serial_number)? {
            Some(owner) if owner.entry_id != *entry_id => Err(Error::IdentityConflict {
                serial_number: serial_number.to_string(),
                entry_id: entry_id.to_string(),
                existing_entry_id: owner.entry_id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// List all devices.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY first_seen, entry_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// Remove a device and its reconciliation bookkeeping.
    ///
    /// Statistic series are left in place; they are keyed by statistic id.
    pub fn remove_device(&self, entry_id: &EntryId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM devices WHERE entry_id = ?", [entry_id.as_str()])?;
        if removed > 0 {
            info!("Removed device {}", entry_id);
        }
        Ok(removed > 0)
    }

    /// Persist identity fields learned for `entry_id`.
    ///
    /// Empty or absent fields never erase known values. A serial number
    /// already bound to another device is rejected with
    /// [`Error::IdentityConflict`] and nothing is written.
    pub fn record_identity(
        &self,
        entry_id: &EntryId,
        identity: &DeviceIdentity,
    ) -> Result<IdentityChange> {
        let device = self
            .get_device(entry_id)?
            .ok_or_else(|| Error::DeviceNotFound(entry_id.to_string()))?;

        let serial = non_empty(identity.serial_number.as_deref());
        let mac = non_empty(identity.mac_address.as_deref());
        let model = non_empty(identity.model.as_deref());

        if let Some(serial) = serial {
            self.ensure_serial_available(entry_id, serial)?;
        }

        let change = match (device.serial_number.as_deref(), serial) {
            (Some(previous), Some(serial)) if previous != serial => IdentityChange::SerialChanged {
                previous: previous.to_string(),
            },
            _ => {
                let learned = (serial.is_some() && device.serial_number.is_none())
                    || (mac.is_some() && device.mac_address.as_deref() != mac)
                    || (model.is_some() && device.model.as_deref() != model);
                if learned {
                    IdentityChange::Learned
                } else {
                    IdentityChange::Unchanged
                }
            }
        };

        if change != IdentityChange::Unchanged {
            self.conn.execute(
                "UPDATE devices SET
                    serial_number = COALESCE(?2, serial_number),
                    mac_address = COALESCE(?3, mac_address),
                    model = COALESCE(?4, model),
                    last_seen = ?5
                 WHERE entry_id = ?1",
                params![
                    entry_id.as_str(),
                    serial,
                    mac,
                    model,
                    OffsetDateTime::now_utc().unix_timestamp()
                ],
            )?;
            debug!("Identity of {} updated: {:?}", entry_id, change);
        }

        Ok(change)
    }
}

// Statistics
impl Store {
    /// Series whose identifier starts with `prefix`, with point counts.
    pub fn list_series(&self, prefix: &str) -> Result<Vec<SeriesInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.statistic_id, m.unit, COUNT(s.id), MIN(s.start), MAX(s.start)
             FROM statistics_meta m
             LEFT JOIN statistics s ON s.statistic_id = m.statistic_id
             WHERE substr(m.statistic_id, 1, length(?1)) = ?1
             GROUP BY m.statistic_id
             ORDER BY m.statistic_id",
        )?;

        let series = stmt
            .query_map([prefix], |row| {
                Ok(SeriesInfo {
                    statistic_id: row.get(0)?,
                    unit: row.get(1)?,
                    point_count: row.get::<_, i64>(2)?.max(0) as u64,
                    first_start: row.get::<_, Option<i64>>(3)?.map(to_datetime).transpose()?,
                    last_start: row.get::<_, Option<i64>>(4)?.map(to_datetime).transpose()?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(series)
    }

    /// Write points to a series, creating it if needed.
    ///
    /// Live points replace whatever is stored at their timestamp. Imported
    /// points are only inserted where the timestamp is free, so re-running
    /// an import is a no-op and never overwrites live data.
    pub fn write_points(
        &self,
        statistic_id: &str,
        unit: Unit,
        points: &[StatisticPoint],
    ) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO statistics_meta (statistic_id, unit, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                statistic_id,
                unit.symbol(),
                OffsetDateTime::now_utc().unix_timestamp()
            ],
        )?;

        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO statistics (statistic_id, start, value, imported, segment_start)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut update = tx.prepare_cached(
                "UPDATE statistics SET value = ?3, imported = 0, segment_start = ?4
                 WHERE statistic_id = ?1 AND start = ?2",
            )?;

            for point in points {
                let start = point.start.unix_timestamp();
                match point.origin {
                    PointOrigin::Imported => {
                        let n = insert.execute(params![
                            statistic_id,
                            start,
                            point.value,
                            true,
                            point.segment_start
                        ])?;
                        if n == 1 {
                            summary.inserted += 1;
                        } else {
                            summary.skipped += 1;
                        }
                    }
                    PointOrigin::Live => {
                        let n = update.execute(params![
                            statistic_id,
                            start,
                            point.value,
                            point.segment_start
                        ])?;
                        if n == 1 {
                            summary.updated += 1;
                        } else {
                            insert.execute(params![
                                statistic_id,
                                start,
                                point.value,
                                false,
                                point.segment_start
                            ])?;
                            summary.inserted += 1;
                        }
                    }
                }
            }
        }

        tx.commit()?;
        debug!(
            "Wrote {} points to {}: {} new, {} replaced, {} skipped",
            points.len(),
            statistic_id,
            summary.inserted,
            summary.updated,
            summary.skipped
        );
        Ok(summary)
    }

    /// Delete a series and all its points. Returns the number of points removed.
    pub fn delete_series(&self, statistic_id: &str) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let points = tx.execute("DELETE FROM statistics WHERE statistic_id = ?", [statistic_id])?;
        let series = tx.execute(
            "DELETE FROM statistics_meta WHERE statistic_id = ?",
            [statistic_id],
        )?;
        tx.commit()?;

        if series > 0 {
            info!("Deleted series {} ({} points)", statistic_id, points);
        }
        Ok(points)
    }

    /// Query points of one series.
    pub fn query_points(&self, query: &PointQuery) -> Result<Vec<StatisticPoint>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let points = stmt
            .query_map(params_ref.as_slice(), point_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(points)
    }

    /// Most recent point of a series.
    pub fn last_point(&self, statistic_id: &str) -> Result<Option<StatisticPoint>> {
        let mut points = self.query_points(&PointQuery::new(statistic_id).newest_first().limit(1))?;
        Ok(points.pop())
    }

    /// Latest point strictly before `start`.
    pub fn point_before(
        &self,
        statistic_id: &str,
        start: OffsetDateTime,
    ) -> Result<Option<StatisticPoint>> {
        let point = self
            .conn
            .query_row(
                "SELECT start, value, imported, segment_start FROM statistics
                 WHERE statistic_id = ?1 AND start < ?2
                 ORDER BY start DESC LIMIT 1",
                params![statistic_id, start.unix_timestamp()],
                point_from_row,
            )
            .optional()?;
        Ok(point)
    }

    /// Count points of a series.
    pub fn count_points(&self, statistic_id: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM statistics WHERE statistic_id = ?",
            [statistic_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

// Reconciliation bookkeeping
impl Store {
    /// Bookkeeping for `entry_id`; a fresh state if none is stored.
    pub fn get_repair_state(&self, entry_id: &EntryId) -> Result<RepairState> {
        let state = self
            .conn
            .query_row(
                "SELECT migrated_at, history_imported_until, history_cumulative
                 FROM repair_state WHERE entry_id = ?",
                [entry_id.as_str()],
                |row| {
                    Ok(RepairState {
                        entry_id: entry_id.clone(),
                        migrated_at: row.get::<_, Option<i64>>(0)?.map(to_datetime).transpose()?,
                        history_imported_until: row
                            .get::<_, Option<String>>(1)?
                            .map(|s| to_date(&s))
                            .transpose()?,
                        history_cumulative: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(state.unwrap_or_else(|| RepairState::new(entry_id.clone())))
    }

    /// Record that reconciliation completed at `at`.
    pub fn set_migrated(&self, entry_id: &EntryId, at: OffsetDateTime) -> Result<()> {
        self.conn.execute(
            "INSERT INTO repair_state (entry_id, migrated_at) VALUES (?1, ?2)
             ON CONFLICT(entry_id) DO UPDATE SET migrated_at = ?2",
            params![entry_id.as_str(), at.unix_timestamp()],
        )?;
        Ok(())
    }

    /// Forget the completed reconciliation so it runs again, e.g. after a
    /// serial number change.
    pub fn reset_migrated(&self, entry_id: &EntryId) -> Result<()> {
        self.conn.execute(
            "UPDATE repair_state SET migrated_at = NULL WHERE entry_id = ?",
            [entry_id.as_str()],
        )?;
        Ok(())
    }

    /// Record the last imported history day and the cumulative energy there.
    pub fn set_history_progress(
        &self,
        entry_id: &EntryId,
        until: Date,
        cumulative: f64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO repair_state (entry_id, history_imported_until, history_cumulative)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(entry_id) DO UPDATE SET
                history_imported_until = ?2,
                history_cumulative = ?3",
            params![entry_id.as_str(), until.to_string(), cumulative],
        )?;
        debug!(
            "History of {} imported until {} ({:.3} kWh)",
            entry_id, until, cumulative
        );
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

fn to_datetime(ts: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(e)))
}

fn to_date(s: &str) -> rusqlite::Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredDevice> {
    Ok(StoredDevice {
        entry_id: EntryId::new(row.get::<_, String>(0)?),
        name: row.get(1)?,
        address: row.get(2)?,
        serial_number: row.get(3)?,
        mac_address: row.get(4)?,
        model: row.get(5)?,
        first_seen: to_datetime(row.get(6)?)?,
        last_seen: to_datetime(row.get(7)?)?,
    })
}

fn point_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StatisticPoint> {
    let imported: bool = row.get(2)?;
    Ok(StatisticPoint {
        start: to_datetime(row.get(0)?)?,
        value: row.get(1)?,
        origin: if imported {
            PointOrigin::Imported
        } else {
            PointOrigin::Live
        },
        segment_start: row.get(3)?,
    })
}
