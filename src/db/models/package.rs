// src/db/models/package.rs

//! Diagnosis-key package model
//!
//! The persisted unit of the store: a signed binary package identified by
//! `(country, day, optional hour)`. Day-level records carry a NULL hour;
//! hour-level records carry 0..=23. For a given `(country, day)` either one
//! day record or up to 24 hour records are current, never both — the store
//! enforces this transactionally on every day write.

use crate::error::Result;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use std::fmt;

/// A signed binary diagnosis-key package.
///
/// Immutable once stored; externally identified by the SHA-256 fingerprint
/// of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisPackage {
    /// Raw key export payload
    pub bin: Vec<u8>,
    /// Detached signature over the payload
    pub signature: Vec<u8>,
}

impl DiagnosisPackage {
    pub fn new(bin: Vec<u8>, signature: Vec<u8>) -> Self {
        Self { bin, signature }
    }

    /// Minimal placeholder that keeps a row's identity after space reclamation.
    pub fn tombstone() -> Self {
        Self {
            bin: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// Content fingerprint: hex SHA-256 of the payload.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bin);
        hex::encode(hasher.finalize())
    }

    /// Whether this package has been reduced to a placeholder.
    pub fn is_tombstone(&self) -> bool {
        self.bin.is_empty() && self.signature.is_empty()
    }
}

/// Primary identity of a stored package: `(country, day, hour)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageKey {
    pub country: String,
    pub day: NaiveDate,
    /// None for day-level packages, 0..=23 for hour-level packages
    pub hour: Option<u8>,
}

impl PackageKey {
    pub fn day_level(country: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            country: country.into(),
            day,
            hour: None,
        }
    }

    pub fn hour_level(country: impl Into<String>, day: NaiveDate, hour: u8) -> Self {
        Self {
            country: country.into(),
            day,
            hour: Some(hour),
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hour {
            Some(hour) => write!(f, "{}/{}/{:02}", self.country, self.day, hour),
            None => write!(f, "{}/{}", self.country, self.day),
        }
    }
}

/// A package row as persisted in `key_packages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPackage {
    pub key: PackageKey,
    pub package: DiagnosisPackage,
    /// Version token from the distribution server, used for revocation
    pub etag: Option<String>,
    /// Content fingerprint recorded at write time
    pub fingerprint: Option<String>,
    /// Set only by the batch mark-checked operation
    pub checked_for_exposure: bool,
}

impl StoredPackage {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            key: PackageKey {
                country: row.get(0)?,
                day: row.get(1)?,
                hour: row.get(2)?,
            },
            package: DiagnosisPackage {
                bin: row.get(3)?,
                signature: row.get(4)?,
            },
            etag: row.get(5)?,
            fingerprint: row.get(6)?,
            checked_for_exposure: row.get::<_, i64>(7)? != 0,
        })
    }

    /// Insert a day-level row. The caller has already removed any previous
    /// day row and all hour siblings inside the same transaction.
    pub fn insert_day(
        conn: &Connection,
        country: &str,
        day: NaiveDate,
        etag: Option<&str>,
        package: &DiagnosisPackage,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO key_packages (country, day, hour, bin, signature, etag, fingerprint, checked_for_exposure)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, 0)",
            params![
                country,
                day,
                &package.bin,
                &package.signature,
                etag,
                package.fingerprint(),
            ],
        )?;
        Ok(())
    }

    /// Upsert exactly one hour-level row, leaving siblings and the day row
    /// untouched. Re-writing an hour resets its checked flag.
    pub fn upsert_hour(
        conn: &Connection,
        country: &str,
        day: NaiveDate,
        hour: u8,
        etag: Option<&str>,
        package: &DiagnosisPackage,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO key_packages (country, day, hour, bin, signature, etag, fingerprint, checked_for_exposure)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
             ON CONFLICT(country, day, hour) DO UPDATE SET
                bin = excluded.bin,
                signature = excluded.signature,
                etag = excluded.etag,
                fingerprint = excluded.fingerprint,
                checked_for_exposure = 0",
            params![
                country,
                day,
                hour,
                &package.bin,
                &package.signature,
                etag,
                package.fingerprint(),
            ],
        )?;
        Ok(())
    }

    /// The day-level package for `(country, day)`, if one exists.
    pub fn find_day(conn: &Connection, country: &str, day: NaiveDate) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT country, day, hour, bin, signature, etag, fingerprint, checked_for_exposure
             FROM key_packages WHERE country = ?1 AND day = ?2 AND hour IS NULL",
        )?;
        let package = stmt
            .query_row(params![country, day], Self::from_row)
            .optional()?;
        Ok(package)
    }

    /// All hour-level packages for `(country, day)`, ascending by hour.
    pub fn find_hours(conn: &Connection, country: &str, day: NaiveDate) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT country, day, hour, bin, signature, etag, fingerprint, checked_for_exposure
             FROM key_packages WHERE country = ?1 AND day = ?2 AND hour IS NOT NULL
             ORDER BY hour",
        )?;
        let packages = stmt
            .query_map(params![country, day], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(packages)
    }

    /// Every row carrying the given ETag, across countries and granularities.
    pub fn find_by_etag(conn: &Connection, etag: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT country, day, hour, bin, signature, etag, fingerprint, checked_for_exposure
             FROM key_packages WHERE etag = ?1 ORDER BY country, day, hour",
        )?;
        let packages = stmt
            .query_map([etag], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(packages)
    }

    /// Distinct days with a day-level package for the country, ascending.
    pub fn all_days(conn: &Connection, country: &str) -> Result<Vec<NaiveDate>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT day FROM key_packages
             WHERE country = ?1 AND hour IS NULL ORDER BY day",
        )?;
        let days = stmt
            .query_map([country], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(days)
    }

    /// Days whose day-level package has not been checked for exposure yet.
    pub fn days_not_checked(conn: &Connection, country: &str) -> Result<Vec<NaiveDate>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT day FROM key_packages
             WHERE country = ?1 AND hour IS NULL AND checked_for_exposure = 0
             ORDER BY day",
        )?;
        let days = stmt
            .query_map([country], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(days)
    }

    /// Hours with an hour-level package on `(country, day)`, ascending.
    pub fn hours_on(conn: &Connection, country: &str, day: NaiveDate) -> Result<Vec<u8>> {
        let mut stmt = conn.prepare(
            "SELECT hour FROM key_packages
             WHERE country = ?1 AND day = ?2 AND hour IS NOT NULL ORDER BY hour",
        )?;
        let hours = stmt
            .query_map(params![country, day], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hours)
    }

    /// Batch mark-checked: set the flag and replace the payload with an empty
    /// placeholder for every row matching one of the fingerprints. Identity
    /// columns (key, etag, fingerprint) survive, so delta computation still
    /// sees the row. One parameterized statement per fingerprint — no SQL
    /// text interpolation for variable-length batches.
    pub fn mark_checked(conn: &Connection, fingerprints: &[String]) -> Result<usize> {
        let mut stmt = conn.prepare(
            "UPDATE key_packages
             SET checked_for_exposure = 1, bin = X'', signature = X''
             WHERE fingerprint = ?1",
        )?;
        let mut updated = 0;
        for fingerprint in fingerprints {
            updated += stmt.execute([fingerprint])?;
        }
        Ok(updated)
    }

    /// Delete one row by its full key.
    pub fn delete_by_key(conn: &Connection, key: &PackageKey) -> Result<usize> {
        let deleted = match key.hour {
            Some(hour) => conn.execute(
                "DELETE FROM key_packages WHERE country = ?1 AND day = ?2 AND hour = ?3",
                params![key.country, key.day, hour],
            )?,
            None => conn.execute(
                "DELETE FROM key_packages WHERE country = ?1 AND day = ?2 AND hour IS NULL",
                params![key.country, key.day],
            )?,
        };
        Ok(deleted)
    }

    /// Delete every row with the given fingerprint, across countries, days
    /// and hours. Fingerprint equality is the batch-deletion basis.
    pub fn delete_by_fingerprint(conn: &Connection, fingerprint: &str) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM key_packages WHERE fingerprint = ?1",
            [fingerprint],
        )?;
        Ok(deleted)
    }

    /// Delete all hour rows for `(country, day)`.
    pub fn delete_hours_for_day(conn: &Connection, country: &str, day: NaiveDate) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM key_packages WHERE country = ?1 AND day = ?2 AND hour IS NOT NULL",
            params![country, day],
        )?;
        Ok(deleted)
    }

    /// Delete the day row for `(country, day)`, if present.
    pub fn delete_day_row(conn: &Connection, country: &str, day: NaiveDate) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM key_packages WHERE country = ?1 AND day = ?2 AND hour IS NULL",
            params![country, day],
        )?;
        Ok(deleted)
    }

    /// Delete every row for a country, both granularities. Purge scope for
    /// corruption recovery.
    pub fn delete_country(conn: &Connection, country: &str) -> Result<usize> {
        let deleted = conn.execute("DELETE FROM key_packages WHERE country = ?1", [country])?;
        Ok(deleted)
    }

    /// Delete every row older than the cutoff day, all countries.
    pub fn delete_older_than(conn: &Connection, cutoff: NaiveDate) -> Result<usize> {
        let deleted = conn.execute("DELETE FROM key_packages WHERE day < ?1", params![cutoff])?;
        Ok(deleted)
    }
}
