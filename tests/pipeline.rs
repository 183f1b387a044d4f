// tests/pipeline.rs

//! End-to-end pipeline coverage: manifest sync into the store,
//! materialization, detection, and the corruption-recovery purge.

use chrono::{Days, NaiveDate, Utc};
use exposure_core::{
    CountryManifest, DetectionConfig, DetectionOrchestrator, DetectionOutcome, DetectorError,
    DetectorErrorKind, DeviceClock, DiagnosisPackage, ExposureDetector, ExposureWindow,
    FetchedPackage, ManifestEntry, PackageFetcher, PackageStore, PackageSync, RiskConfiguration,
    SelectionPolicy, SyncContext, WrittenPackage,
};
use std::collections::HashSet;
use std::sync::Arc;

fn recent_day(offset: u64) -> NaiveDate {
    Utc::now().date_naive() - Days::new(offset)
}

fn manifest(country: &str, offsets: &[u64]) -> CountryManifest {
    CountryManifest {
        country: country.to_string(),
        days: offsets
            .iter()
            .map(|o| ManifestEntry {
                id: recent_day(*o),
                etag: Some(format!("\"day-{o}\"")),
            })
            .collect(),
        hour_day: recent_day(0),
        hours: Vec::new(),
    }
}

/// Deterministic fetcher: payload derived from the identifier.
struct StaticFetcher;

impl PackageFetcher for StaticFetcher {
    fn fetch_day(&self, country: &str, day: NaiveDate) -> exposure_core::Result<FetchedPackage> {
        let bin = format!("{country}:{day}").into_bytes();
        Ok(FetchedPackage {
            package: Some(DiagnosisPackage::new(bin, vec![0xA5; 4])),
            etag: None,
        })
    }

    fn fetch_hour(
        &self,
        country: &str,
        day: NaiveDate,
        hour: u8,
    ) -> exposure_core::Result<FetchedPackage> {
        let bin = format!("{country}:{day}:{hour}").into_bytes();
        Ok(FetchedPackage {
            package: Some(DiagnosisPackage::new(bin, vec![0x5A; 4])),
            etag: None,
        })
    }
}

/// Reads every materialized pair back from disk and reports one window per
/// pair, which lets the tests assert both the pairing convention and the
/// payload round trip.
struct FileCheckingDetector;

impl ExposureDetector for FileCheckingDetector {
    fn detect(
        &self,
        packages: &[WrittenPackage],
        _configuration: &RiskConfiguration,
    ) -> Result<Vec<ExposureWindow>, DetectorError> {
        let mut windows = Vec::new();
        for pair in packages {
            let bin = std::fs::read(&pair.bin_path)
                .map_err(|e| DetectorError::new(DetectorErrorKind::Internal, -1, e.to_string()))?;
            let sig = std::fs::read(&pair.sig_path)
                .map_err(|e| DetectorError::new(DetectorErrorKind::Internal, -1, e.to_string()))?;
            if bin.is_empty() || sig.is_empty() {
                return Err(DetectorError::new(
                    DetectorErrorKind::BadParameter,
                    2,
                    "empty key file",
                ));
            }
            windows.push(ExposureWindow(serde_json::json!({
                "bytes": bin.len(),
            })));
        }
        Ok(windows)
    }
}

struct RejectingDetector;

impl ExposureDetector for RejectingDetector {
    fn detect(
        &self,
        _packages: &[WrittenPackage],
        _configuration: &RiskConfiguration,
    ) -> Result<Vec<ExposureWindow>, DetectorError> {
        Err(DetectorError::new(
            DetectorErrorKind::BadParameter,
            2,
            "unable to read key material",
        ))
    }
}

struct TrustedClock;

impl DeviceClock for TrustedClock {
    fn is_trustworthy(&self) -> bool {
        true
    }
}

fn orchestrator(
    store: &Arc<PackageStore>,
    context: &SyncContext,
    detector: Arc<dyn ExposureDetector>,
    root: &std::path::Path,
) -> DetectionOrchestrator {
    DetectionOrchestrator::new(
        Arc::clone(store),
        context.clone(),
        detector,
        Arc::new(TrustedClock),
        DetectionConfig {
            selection: SelectionPolicy::UncheckedDays,
            materialization_root: root.to_path_buf(),
            risk: RiskConfiguration::default(),
        },
    )
}

#[test]
fn test_sync_then_detect_happy_path() {
    let temp = tempfile::tempdir().unwrap();
    let context = SyncContext::new();
    let store = Arc::new(PackageStore::open(temp.path().join("packages.db"), context.clone()).unwrap());

    // Sync three days' worth of packages
    let report = PackageSync::new(&store, &StaticFetcher)
        .run(&manifest("DE", &[3, 2, 1]))
        .unwrap();
    assert_eq!(report.days_fetched, 3);
    assert_eq!(store.all_days("DE").unwrap().len(), 3);

    // A second cycle is a no-op thanks to the delta calculation
    let report = PackageSync::new(&store, &StaticFetcher)
        .run(&manifest("DE", &[3, 2, 1]))
        .unwrap();
    assert_eq!(report.days_fetched, 0);

    // Detection consumes the unchecked days and tombstones them
    let root = temp.path().join("materialize");
    std::fs::create_dir_all(&root).unwrap();
    let outcome = orchestrator(&store, &context, Arc::new(FileCheckingDetector), &root)
        .run("DE")
        .unwrap();
    match outcome {
        DetectionOutcome::Windows(windows) => assert_eq!(windows.len(), 3),
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert!(store.days_not_checked("DE").unwrap().is_empty());
    let tombstoned = store
        .day_package("DE", recent_day(1))
        .unwrap()
        .unwrap();
    assert!(tombstoned.package.is_tombstone());
    assert!(tombstoned.checked_for_exposure);

    // No materialization directory survives the attempt
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);

    // Tombstoned days still count as known, so the delta stays empty
    let report = PackageSync::new(&store, &StaticFetcher)
        .run(&manifest("DE", &[3, 2, 1]))
        .unwrap();
    assert_eq!(report.days_fetched, 0);

    // A subsequent attempt finds nothing left to check
    let outcome = orchestrator(&store, &context, Arc::new(FileCheckingDetector), &root)
        .run("DE")
        .unwrap();
    assert_eq!(outcome, DetectionOutcome::NoPackages);
}

#[test]
fn test_corruption_purge_forces_full_resync() {
    let temp = tempfile::tempdir().unwrap();
    let context = SyncContext::new();
    context.replace_config_metadata(Some(exposure_core::ConfigMetadata::new(Some(
        "\"cfg-1\"".into(),
    ))));
    let store = Arc::new(PackageStore::open(temp.path().join("packages.db"), context.clone()).unwrap());

    PackageSync::new(&store, &StaticFetcher)
        .run(&manifest("DE", &[2, 1]))
        .unwrap();
    assert_eq!(store.all_days("DE").unwrap().len(), 2);

    let root = temp.path().join("materialize");
    std::fs::create_dir_all(&root).unwrap();
    let err = orchestrator(&store, &context, Arc::new(RejectingDetector), &root)
        .run("DE")
        .unwrap_err();
    assert!(err.is_corruption());

    // Self-healing left nothing behind for the country, and the cached
    // configuration metadata is gone
    assert!(store.all_days("DE").unwrap().is_empty());
    assert!(context.config_metadata().is_none());
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);

    // The next sync cycle sees everything as missing and repopulates
    let report = PackageSync::new(&store, &StaticFetcher)
        .run(&manifest("DE", &[2, 1]))
        .unwrap();
    assert_eq!(report.days_fetched, 2);
    assert_eq!(store.all_days("DE").unwrap().len(), 2);
}

#[test]
fn test_revocation_purges_and_blocks_refetch() {
    let temp = tempfile::tempdir().unwrap();
    let context = SyncContext::new();
    let store = Arc::new(PackageStore::open(temp.path().join("packages.db"), context.clone()).unwrap());

    PackageSync::new(&store, &StaticFetcher)
        .run(&manifest("DE", &[1]))
        .unwrap();
    assert_eq!(store.all_days("DE").unwrap().len(), 1);

    // The stored row carries the manifest ETag (the fetcher returned none,
    // so the sync fell back to the advertised one). Revoke that ETag.
    let stored = store.day_package("DE", recent_day(1)).unwrap().unwrap();
    assert_eq!(stored.etag.as_deref(), Some("\"day-1\""));
    context.replace_revocation_list(HashSet::from(["\"day-1\"".to_string()]));

    let report = PackageSync::new(&store, &StaticFetcher)
        .run(&manifest("DE", &[1]))
        .unwrap();

    // Purged locally, and the advertised entry is skipped before download
    assert_eq!(report.revoked_purged, 1);
    assert_eq!(report.revoked_skipped, 1);
    assert!(store.all_days("DE").unwrap().is_empty());
}
