// src/db/schema.rs

//! Database schema versioning for the package store
//!
//! Tracks the schema version and applies pending migrations in ascending
//! order. Each migration step runs inside its own transaction; a failing
//! step is rolled back and reported as `Error::Migration`, so `open()` fails
//! instead of continuing against a stale schema.

use crate::db::migrations;
use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Record a newly applied schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        debug!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_versioned(conn, version).map_err(|err| Error::Migration {
            version,
            source: Box::new(err),
        })?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Run one migration step and its version bump inside a single transaction
fn apply_versioned(conn: &mut Connection, version: i32) -> Result<()> {
    let tx = conn.transaction()?;
    migrations::apply(&tx, version)?;
    set_schema_version(&tx, version)?;
    tx.commit()?;
    Ok(())
}

/// Drop all tables and recreate the schema from scratch.
///
/// Fatal-error recovery path: every package, flag and version record is lost.
pub fn reset(conn: &mut Connection) -> Result<()> {
    info!("Resetting package store schema");
    conn.execute_batch(
        "
        DROP TABLE IF EXISTS key_packages;
        DROP TABLE IF EXISTS store_flags;
        DROP TABLE IF EXISTS schema_version;
        ",
    )?;
    migrate(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, mut conn) = create_test_db();

        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"key_packages".to_string()));
        assert!(tables.contains(&"store_flags".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, mut conn) = create_test_db();

        migrate(&mut conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&mut conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_reset_recreates_empty_schema() {
        let (_temp, mut conn) = create_test_db();
        migrate(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO key_packages (country, day, hour, bin, signature) VALUES ('DE', '2021-01-01', NULL, X'01', X'02')",
            [],
        )
        .unwrap();

        reset(&mut conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM key_packages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }
}
