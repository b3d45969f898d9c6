//! Database schema and migrations.

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if version < SCHEMA_VERSION {
        migrate(conn, version)?;
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Create the initial schema (version 1).
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- Device registry, keyed by the stable entry id
        CREATE TABLE IF NOT EXISTS devices (
            entry_id TEXT PRIMARY KEY,
            name TEXT,
            address TEXT NOT NULL,
            serial_number TEXT,
            mac_address TEXT,
            model TEXT,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_serial
            ON devices(serial_number) WHERE serial_number IS NOT NULL;

        -- One row per statistic series
        CREATE TABLE IF NOT EXISTS statistics_meta (
            statistic_id TEXT PRIMARY KEY,
            unit TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        -- Statistic points, at most one per series and start time
        CREATE TABLE IF NOT EXISTS statistics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            statistic_id TEXT NOT NULL
                REFERENCES statistics_meta(statistic_id) ON DELETE CASCADE,
            start INTEGER NOT NULL,
            value REAL NOT NULL,
            imported INTEGER NOT NULL DEFAULT 0,
            segment_start INTEGER NOT NULL DEFAULT 0,
            UNIQUE(statistic_id, start)
        );
        CREATE INDEX IF NOT EXISTS idx_statistics_series_time
            ON statistics(statistic_id, start);

        -- Reconciliation bookkeeping
        CREATE TABLE IF NOT EXISTS repair_state (
            entry_id TEXT PRIMARY KEY REFERENCES devices(entry_id) ON DELETE CASCADE,
            migrated_at INTEGER,
            history_imported_until TEXT,
            history_cumulative REAL NOT NULL DEFAULT 0
        );
        "#,
    )?;

    Ok(())
}

/// Run migrations from `old_version` to current.
fn migrate(conn: &Connection, old_version: i32) -> Result<()> {
    tracing::info!(
        "Migrating database schema from v{} to v{}",
        old_version,
        SCHEMA_VERSION
    );
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["devices", "statistics_meta", "statistics", "repair_state", "schema_version"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_schema_version_tracking() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        // Re-initializing an up-to-date database is a no-op.
        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }
}
