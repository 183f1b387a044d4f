// src/db/models/flag.rs

//! Persisted store flags
//!
//! A small key/value table for bookkeeping that must survive restarts, such
//! as the device-time marker that keeps the "clock untrustworthy" condition
//! from being surfaced more than once per occurrence.

use crate::error::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

/// A persisted flag row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFlag {
    pub key: String,
    pub value: String,
    /// RFC 3339 timestamp of the last write
    pub updated_at: String,
}

impl StoreFlag {
    /// Set (or overwrite) a flag.
    pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO store_flags (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Read a flag; absence yields `None`.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Self>> {
        let mut stmt =
            conn.prepare("SELECT key, value, updated_at FROM store_flags WHERE key = ?1")?;
        let flag = stmt
            .query_row([key], |row| {
                Ok(Self {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })
            .optional()?;
        Ok(flag)
    }

    /// Remove a flag; removing an absent flag is a no-op.
    pub fn clear(conn: &Connection, key: &str) -> Result<()> {
        conn.execute("DELETE FROM store_flags WHERE key = ?1", [key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;

    fn create_test_db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        schema::migrate(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_flag_set_get_clear() {
        let conn = create_test_db();
        assert!(StoreFlag::get(&conn, "device_time_incorrect").unwrap().is_none());

        StoreFlag::set(&conn, "device_time_incorrect", "1").unwrap();
        let flag = StoreFlag::get(&conn, "device_time_incorrect").unwrap().unwrap();
        assert_eq!(flag.value, "1");

        StoreFlag::clear(&conn, "device_time_incorrect").unwrap();
        assert!(StoreFlag::get(&conn, "device_time_incorrect").unwrap().is_none());
        // Clearing twice stays a no-op
        StoreFlag::clear(&conn, "device_time_incorrect").unwrap();
    }

    #[test]
    fn test_flag_overwrite_updates_value() {
        let conn = create_test_db();
        StoreFlag::set(&conn, "marker", "a").unwrap();
        StoreFlag::set(&conn, "marker", "b").unwrap();
        assert_eq!(StoreFlag::get(&conn, "marker").unwrap().unwrap().value, "b");
    }
}
