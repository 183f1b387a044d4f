// src/db/migrations.rs

//! Database migration implementations
//!
//! Individual migration functions for evolving the package-store schema.
//! Migrations apply forward-only in ascending order; the caller wraps each
//! step in its own transaction, so a step either lands completely or not at
//! all.

use crate::error::Result;
use rusqlite::Connection;
use tracing::debug;

/// Apply a specific migration version
pub fn apply(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => panic!("Unknown migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// Creates the key_packages table: signed binary packages keyed by
/// `(country, day, hour)`. Day-level rows carry a NULL hour; because NULL is
/// outside primary-key uniqueness in SQLite, a partial unique index enforces
/// at most one day row per `(country, day)`.
pub fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        -- Key packages: one signed binary package per country/day or country/day/hour
        CREATE TABLE key_packages (
            country TEXT NOT NULL,
            day TEXT NOT NULL,
            hour INTEGER CHECK(hour BETWEEN 0 AND 23),
            bin BLOB NOT NULL,
            signature BLOB NOT NULL,
            PRIMARY KEY (country, day, hour)
        );

        -- NULL hour escapes primary-key uniqueness; enforce one day row per (country, day)
        CREATE UNIQUE INDEX idx_key_packages_day_level ON key_packages(country, day) WHERE hour IS NULL;

        CREATE INDEX idx_key_packages_day ON key_packages(day);
        ",
    )?;

    Ok(())
}

/// Schema Version 2: Add revocation bookkeeping
///
/// Adds the distribution-server ETag and the content fingerprint, the two
/// tokens consulted by the revocation list and used for batch deletion.
pub fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        ALTER TABLE key_packages ADD COLUMN etag TEXT;
        ALTER TABLE key_packages ADD COLUMN fingerprint TEXT;

        CREATE INDEX idx_key_packages_etag ON key_packages(etag);
        CREATE INDEX idx_key_packages_fingerprint ON key_packages(fingerprint);
        ",
    )?;

    Ok(())
}

/// Schema Version 3: Add exposure bookkeeping
///
/// Adds the checked_for_exposure flag (set only by the batch mark-checked
/// operation) and the store_flags table for persisted markers such as the
/// device-time condition.
pub fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    conn.execute_batch(
        "
        ALTER TABLE key_packages ADD COLUMN checked_for_exposure INTEGER NOT NULL DEFAULT 0;

        CREATE INDEX idx_key_packages_checked ON key_packages(checked_for_exposure);

        -- Persisted bookkeeping markers
        CREATE TABLE store_flags (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        ",
    )?;

    Ok(())
}
