// src/sync/mod.rs

//! Delta-driven package synchronization
//!
//! Drives one sync cycle for one country: purge rows the revocation list has
//! caught up with, apply the age-based retention cutoff, diff the remote
//! manifest against the local store, then fetch and persist what is missing.
//! The network itself stays behind the [`PackageFetcher`] seam; persisting
//! goes through the store, which re-checks revocation on every write.
//!
//! Per-identifier fetch failures are logged and skipped — the next cycle
//! simply sees the identifier as still missing. Storage failures abort the
//! cycle.

use crate::db::PackageStore;
use crate::db::models::DiagnosisPackage;
use crate::delta::DeltaCalculator;
use crate::error::{Error, Result};
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// One advertised identifier with its version token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry<T> {
    pub id: T,
    pub etag: Option<String>,
}

/// Per-country manifest from the distribution server: day identifiers for
/// the history window plus hour identifiers for one day (typically today).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryManifest {
    pub country: String,
    pub days: Vec<ManifestEntry<NaiveDate>>,
    /// The day the hour entries refer to
    pub hour_day: NaiveDate,
    pub hours: Vec<ManifestEntry<u8>>,
}

/// Raw fetch result for one identifier. A `None` package is treated as
/// revoked by the store's write gate.
#[derive(Debug, Clone)]
pub struct FetchedPackage {
    pub package: Option<DiagnosisPackage>,
    pub etag: Option<String>,
}

/// External collaborator performing the actual downloads.
pub trait PackageFetcher {
    fn fetch_day(&self, country: &str, day: NaiveDate) -> Result<FetchedPackage>;
    fn fetch_hour(&self, country: &str, day: NaiveDate, hour: u8) -> Result<FetchedPackage>;
}

/// Sync tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Packages older than this many days are purged before each cycle
    pub retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { retention_days: 14 }
    }
}

/// Outcome counters for one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub days_fetched: usize,
    pub hours_fetched: usize,
    pub fetch_failures: usize,
    pub revoked_skipped: usize,
    pub revoked_purged: usize,
    pub expired_purged: usize,
}

/// One-country sync driver over a store and a fetcher.
pub struct PackageSync<'a, F> {
    store: &'a PackageStore,
    fetcher: &'a F,
    config: SyncConfig,
}

impl<'a, F: PackageFetcher> PackageSync<'a, F> {
    pub fn new(store: &'a PackageStore, fetcher: &'a F) -> Self {
        Self::with_config(store, fetcher, SyncConfig::default())
    }

    pub fn with_config(store: &'a PackageStore, fetcher: &'a F, config: SyncConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    /// Run one full cycle against the given manifest.
    pub fn run(&self, manifest: &CountryManifest) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let country = manifest.country.as_str();

        self.purge_revoked(&mut report)?;

        let cutoff = Utc::now().date_naive() - Days::new(u64::from(self.config.retention_days));
        report.expired_purged = self.store.delete_older_than(cutoff)?;

        self.sync_days(manifest, &mut report)?;
        self.sync_hours(manifest, &mut report)?;

        info!(
            "Sync cycle for {} complete: {} day(s), {} hour(s) fetched, {} failure(s)",
            country, report.days_fetched, report.hours_fetched, report.fetch_failures
        );
        Ok(report)
    }

    /// Remove rows the revocation list has caught up with since they were
    /// stored. Matches both version tokens and content fingerprints.
    fn purge_revoked(&self, report: &mut SyncReport) -> Result<()> {
        let tokens = self.store.context().revocation_list();
        if tokens.is_empty() {
            return Ok(());
        }

        let matched = self
            .store
            .packages_with_etags(tokens.iter().map(String::as_str))?;
        report.revoked_purged += self.store.delete_packages(&matched)?;

        let fingerprints: Vec<String> = tokens.into_iter().collect();
        report.revoked_purged += self.store.delete_packages_with_fingerprints(&fingerprints)?;

        if report.revoked_purged > 0 {
            warn!("Purged {} revoked package(s)", report.revoked_purged);
        }
        Ok(())
    }

    fn sync_days(&self, manifest: &CountryManifest, report: &mut SyncReport) -> Result<()> {
        let country = manifest.country.as_str();
        let local: BTreeSet<NaiveDate> = self.store.all_days(country)?.into_iter().collect();
        let remote: BTreeSet<NaiveDate> = manifest.days.iter().map(|e| e.id).collect();
        let missing = DeltaCalculator::missing_days(&remote, &local);
        debug!("{}: {} of {} day(s) missing", country, missing.len(), remote.len());

        for entry in manifest.days.iter().filter(|e| missing.contains(&e.id)) {
            if self.is_advertised_revoked(entry.etag.as_deref()) {
                report.revoked_skipped += 1;
                continue;
            }
            let fetched = match self.fetcher.fetch_day(country, entry.id) {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!("Failed to fetch day package {}/{}: {}", country, entry.id, err);
                    report.fetch_failures += 1;
                    continue;
                }
            };
            let etag = fetched.etag.or_else(|| entry.etag.clone());
            match self
                .store
                .set_day_package(country, entry.id, etag.as_deref(), fetched.package)
            {
                Ok(()) => report.days_fetched += 1,
                Err(Error::RevokedPackage { .. }) => {
                    debug!("Day package {}/{} refused as revoked", country, entry.id);
                    report.revoked_skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn sync_hours(&self, manifest: &CountryManifest, report: &mut SyncReport) -> Result<()> {
        let country = manifest.country.as_str();
        let day = manifest.hour_day;
        let local: BTreeSet<u8> = self.store.hours(country, day)?.into_iter().collect();
        let remote: BTreeSet<u8> = manifest.hours.iter().map(|e| e.id).collect();
        let missing = DeltaCalculator::missing_hours(&remote, &local);

        for entry in manifest.hours.iter().filter(|e| missing.contains(&e.id)) {
            if self.is_advertised_revoked(entry.etag.as_deref()) {
                report.revoked_skipped += 1;
                continue;
            }
            let fetched = match self.fetcher.fetch_hour(country, day, entry.id) {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(
                        "Failed to fetch hour package {}/{}/{:02}: {}",
                        country, day, entry.id, err
                    );
                    report.fetch_failures += 1;
                    continue;
                }
            };
            let etag = fetched.etag.or_else(|| entry.etag.clone());
            match self
                .store
                .set_hour_package(country, day, entry.id, etag.as_deref(), fetched.package)
            {
                Ok(()) => report.hours_fetched += 1,
                Err(Error::RevokedPackage { .. }) => {
                    report.revoked_skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Skip downloads whose advertised version token is already denylisted;
    /// the store would refuse the write anyway.
    fn is_advertised_revoked(&self, etag: Option<&str>) -> bool {
        etag.is_some_and(|e| self.store.context().is_revoked(e))
    }
}
