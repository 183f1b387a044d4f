// src/db/mod.rs

//! SQL-backed diagnosis-key package store
//!
//! Durable, queryable, migration-aware storage of signed key packages, safe
//! under single-writer access. Every operation funnels through one serialized
//! execution context (a mutex around the sole connection); different threads
//! may call concurrently, but statements execute mutually exclusively and
//! block the calling thread until complete.
//!
//! Hard contract: store operations must NOT be invoked re-entrantly from
//! within another operation's callback — the serialization mutex is not
//! re-entrant and the nested call deadlocks.

pub mod migrations;
pub mod models;
pub mod schema;

use crate::context::SyncContext;
use crate::error::{Error, Result, StorageError};
use chrono::NaiveDate;
use models::{DiagnosisPackage, PackageKey, StoreFlag, StoredPackage};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// SQL-backed store for diagnosis-key packages.
///
/// Writes consult the revocation list in the injected [`SyncContext`] before
/// touching the database; a revoked write fails with
/// [`Error::RevokedPackage`] and leaves no observable change.
pub struct PackageStore {
    /// The serialized execution context: sole connection, sole mutex.
    conn: Mutex<Option<Connection>>,
    context: SyncContext,
}

impl PackageStore {
    /// Open (or create) the store at `path` and bring its schema up to date.
    ///
    /// Failure to open the underlying file is fatal. A failed migration step
    /// is rolled back and surfaces as [`Error::Migration`]; the store is not
    /// usable against a partially migrated schema.
    pub fn open<P: AsRef<Path>>(path: P, context: SyncContext) -> Result<Self> {
        let mut conn = Connection::open(path.as_ref())?;
        schema::migrate(&mut conn)?;
        info!("Opened package store at {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            context,
        })
    }

    /// Open an in-memory store. Test and tooling convenience.
    pub fn in_memory(context: SyncContext) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            context,
        })
    }

    /// Close the store. Idempotent; operations after close fail with
    /// [`StorageError::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = guard.take() {
            if let Err((conn, err)) = conn.close() {
                // Keep the connection so a retry remains possible
                *guard = Some(conn);
                return Err(err.into());
            }
            debug!("Closed package store");
        }
        Ok(())
    }

    /// The context this store consults for revocation decisions.
    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StorageError::Closed.into()),
        }
    }

    fn with_conn_mut<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StorageError::Closed.into()),
        }
    }

    /// Revocation gate for every write path. Absent packages and denylisted
    /// ETags/fingerprints are rejected before any SQL runs.
    fn admit(
        &self,
        etag: Option<&str>,
        package: Option<DiagnosisPackage>,
    ) -> Result<DiagnosisPackage> {
        let revoked_err = || Error::RevokedPackage {
            etag: etag.map(str::to_owned),
        };

        let Some(package) = package else {
            return Err(revoked_err());
        };
        if etag.is_some_and(|e| self.context.is_revoked(e)) {
            return Err(revoked_err());
        }
        if self.context.is_revoked(&package.fingerprint()) {
            return Err(revoked_err());
        }
        Ok(package)
    }

    /// Store a day-level package for `(country, day)`.
    ///
    /// In one transaction: all hour rows for the pair are deleted, then the
    /// day row is written with a fresh fingerprint and an unchecked flag.
    /// Any failure rolls the whole transaction back.
    pub fn set_day_package(
        &self,
        country: &str,
        day: NaiveDate,
        etag: Option<&str>,
        package: Option<DiagnosisPackage>,
    ) -> Result<()> {
        let package = self.admit(etag, package)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            StoredPackage::delete_hours_for_day(&tx, country, day)?;
            StoredPackage::delete_day_row(&tx, country, day)?;
            StoredPackage::insert_day(&tx, country, day, etag, &package)?;
            tx.commit()?;
            Ok(())
        })?;
        debug!("Stored day package for {}/{}", country, day);
        Ok(())
    }

    /// Store an hour-level package for `(country, day, hour)`.
    ///
    /// Upserts exactly one hour row; siblings and any day row stay untouched.
    pub fn set_hour_package(
        &self,
        country: &str,
        day: NaiveDate,
        hour: u8,
        etag: Option<&str>,
        package: Option<DiagnosisPackage>,
    ) -> Result<()> {
        let package = self.admit(etag, package)?;
        self.with_conn(|conn| StoredPackage::upsert_hour(conn, country, day, hour, etag, &package))?;
        debug!("Stored hour package for {}/{}/{:02}", country, day, hour);
        Ok(())
    }

    /// The day-level package for `(country, day)`, if present.
    pub fn day_package(&self, country: &str, day: NaiveDate) -> Result<Option<StoredPackage>> {
        self.with_conn(|conn| StoredPackage::find_day(conn, country, day))
    }

    /// All hour-level packages for `(country, day)`, ascending by hour.
    pub fn hour_packages(&self, country: &str, day: NaiveDate) -> Result<Vec<StoredPackage>> {
        self.with_conn(|conn| StoredPackage::find_hours(conn, country, day))
    }

    /// Every stored package carrying the given ETag.
    pub fn packages_with_etag(&self, etag: &str) -> Result<Vec<StoredPackage>> {
        self.with_conn(|conn| StoredPackage::find_by_etag(conn, etag))
    }

    /// Every stored package carrying any of the given ETags.
    pub fn packages_with_etags<'a>(
        &self,
        etags: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<StoredPackage>> {
        self.with_conn(|conn| {
            let mut packages = Vec::new();
            for etag in etags {
                packages.extend(StoredPackage::find_by_etag(conn, etag)?);
            }
            Ok(packages)
        })
    }

    /// Distinct days with a day-level package for the country.
    pub fn all_days(&self, country: &str) -> Result<Vec<NaiveDate>> {
        self.with_conn(|conn| StoredPackage::all_days(conn, country))
    }

    /// Days whose day-level package has not yet been checked for exposure.
    pub fn days_not_checked(&self, country: &str) -> Result<Vec<NaiveDate>> {
        self.with_conn(|conn| StoredPackage::days_not_checked(conn, country))
    }

    /// Hours with an hour-level package on `(country, day)`.
    pub fn hours(&self, country: &str, day: NaiveDate) -> Result<Vec<u8>> {
        self.with_conn(|conn| StoredPackage::hours_on(conn, country, day))
    }

    /// Batch mark-checked: flips the flag and tombstones the payload for all
    /// rows matching the fingerprints. Returns the number of rows updated.
    pub fn mark_checked(&self, fingerprints: &[String]) -> Result<usize> {
        let updated = self.with_conn(|conn| StoredPackage::mark_checked(conn, fingerprints))?;
        debug!("Marked {} package(s) as checked for exposure", updated);
        Ok(updated)
    }

    /// Delete one package by its full key.
    pub fn delete_package(&self, key: &PackageKey) -> Result<()> {
        self.with_conn(|conn| StoredPackage::delete_by_key(conn, key))?;
        Ok(())
    }

    /// Delete a batch of packages. Rows with a fingerprint are deleted by
    /// fingerprint equality (which may span countries and granularities);
    /// fingerprint-less rows fall back to their key.
    pub fn delete_packages(&self, packages: &[StoredPackage]) -> Result<usize> {
        self.with_conn(|conn| {
            let mut deleted = 0;
            for package in packages {
                deleted += match &package.fingerprint {
                    Some(fingerprint) => {
                        StoredPackage::delete_by_fingerprint(conn, fingerprint)?
                    }
                    None => StoredPackage::delete_by_key(conn, &package.key)?,
                };
            }
            Ok(deleted)
        })
    }

    /// Delete every row whose fingerprint matches one of the given tokens.
    pub fn delete_packages_with_fingerprints(&self, fingerprints: &[String]) -> Result<usize> {
        self.with_conn(|conn| {
            let mut deleted = 0;
            for fingerprint in fingerprints {
                deleted += StoredPackage::delete_by_fingerprint(conn, fingerprint)?;
            }
            Ok(deleted)
        })
    }

    /// Delete the day-level package for `(country, day)`.
    pub fn delete_day_package(&self, country: &str, day: NaiveDate) -> Result<()> {
        self.with_conn(|conn| StoredPackage::delete_day_row(conn, country, day))?;
        Ok(())
    }

    /// Delete the hour-level package for `(country, day, hour)`.
    pub fn delete_hour_package(&self, country: &str, day: NaiveDate, hour: u8) -> Result<()> {
        self.with_conn(|conn| {
            StoredPackage::delete_by_key(conn, &PackageKey::hour_level(country, day, hour))
        })?;
        Ok(())
    }

    /// Delete every package for a country, both granularities.
    ///
    /// Purge scope for corruption-class detection failures; a full resync
    /// repopulates the country on the next cycle.
    pub fn delete_country_packages(&self, country: &str) -> Result<usize> {
        let deleted = self.with_conn(|conn| StoredPackage::delete_country(conn, country))?;
        if deleted > 0 {
            warn!("Purged {} package(s) for country {}", deleted, country);
        }
        Ok(deleted)
    }

    /// Age-based retention purge: delete every package older than `cutoff`.
    pub fn delete_older_than(&self, cutoff: NaiveDate) -> Result<usize> {
        let deleted = self.with_conn(|conn| StoredPackage::delete_older_than(conn, cutoff))?;
        if deleted > 0 {
            debug!("Purged {} package(s) older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    /// Drop and recreate the whole schema. Fatal-error recovery.
    pub fn reset(&self) -> Result<()> {
        self.with_conn_mut(schema::reset)
    }

    /// Set a persisted bookkeeping flag.
    pub fn set_flag(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| StoreFlag::set(conn, key, value))
    }

    /// Read a persisted bookkeeping flag.
    pub fn flag(&self, key: &str) -> Result<Option<StoreFlag>> {
        self.with_conn(|conn| StoreFlag::get(conn, key))
    }

    /// Clear a persisted bookkeeping flag.
    pub fn clear_flag(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| StoreFlag::clear(conn, key))
    }
}
