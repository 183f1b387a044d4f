// src/detection/mod.rs

//! Exposure-detection orchestration
//!
//! Sequences one detection attempt: select eligible packages, materialize
//! them as file pairs, invoke the external detector, map the result, clean
//! up. One orchestrator value represents one attempt — running it consumes
//! the value, so attempts cannot overlap or be re-entered.
//!
//! Error handling forks on the failure class: transient detector failures
//! (authorization, throttling) surface unchanged with the store untouched,
//! while corruption-class failures purge every stored package for the
//! affected country and invalidate the cached remote-configuration metadata,
//! forcing a full resync on the next cycle instead of a partial repair.

use crate::context::SyncContext;
use crate::db::PackageStore;
use crate::db::models::StoredPackage;
use crate::error::{DetectionFailure, Error, Result};
use crate::filesystem::{PackageFileWriter, WrittenPackage, WrittenPackageSet};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Persisted marker keeping the device-time condition from being surfaced
/// more than once per occurrence.
pub const DEVICE_TIME_FLAG: &str = "device_time_incorrect";

/// Opaque risk-scoring configuration, passed through to the detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskConfiguration(pub serde_json::Value);

/// One opaque platform-computed proximity event. Consumed downstream by
/// risk scoring; this crate never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureWindow(pub serde_json::Value);

/// Failure classes reported by the external detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorErrorKind {
    /// The app is not (or no longer) authorized for detection
    NotAuthorized,
    /// Detection quota exhausted; try again later
    RateLimited,
    /// Platform-side resource shortage
    InsufficientStorage,
    /// The detector rejected the submitted key material as malformed
    BadParameter,
    /// Anything else the platform reports
    Internal,
}

/// Error returned by an [`ExposureDetector`] implementation.
#[derive(Debug, Clone)]
pub struct DetectorError {
    pub kind: DetectorErrorKind,
    pub code: i64,
    pub message: String,
}

impl DetectorError {
    pub fn new(kind: DetectorErrorKind, code: i64, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }
}

/// External detection API: consumes materialized file pairs plus a
/// risk-scoring configuration.
pub trait ExposureDetector: Send + Sync {
    fn detect(
        &self,
        packages: &[WrittenPackage],
        configuration: &RiskConfiguration,
    ) -> std::result::Result<Vec<ExposureWindow>, DetectorError>;
}

/// External collaborator judging whether the device clock can be trusted.
pub trait DeviceClock: Send + Sync {
    fn is_trustworthy(&self) -> bool;
}

/// Which locally stored packages a detection attempt submits. A
/// configuration input, not hard-coded orchestrator behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Background mode: every day not yet checked for exposure
    UncheckedDays,
    /// Interactive mode: unchecked hour packages of `day`, from `start_hour`
    /// on. The caller derives `start_hour` from its lookback window.
    UncheckedHoursFrom { day: NaiveDate, start_hour: u8 },
}

/// Configuration for one detection attempt.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub selection: SelectionPolicy,
    /// Parent directory for the attempt-unique materialization directory
    pub materialization_root: PathBuf,
    pub risk: RiskConfiguration,
}

/// Attempt lifecycle, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    Idle,
    Materializing,
    AwaitingDetection,
    Completed,
    Failed,
}

/// Successful outcome of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    /// Detection ran; opaque exposure windows for downstream scoring
    Windows(Vec<ExposureWindow>),
    /// The selection was empty — a skip, not an error
    NoPackages,
    /// The device clock was judged untrustworthy and detection was skipped.
    /// `first_occurrence` is true only the first time per occurrence; the
    /// marker persists until the clock recovers.
    DeviceTimeIncorrect { first_occurrence: bool },
}

/// One detection attempt over a store, a detector and a clock.
pub struct DetectionOrchestrator {
    store: Arc<PackageStore>,
    context: SyncContext,
    detector: Arc<dyn ExposureDetector>,
    clock: Arc<dyn DeviceClock>,
    config: DetectionConfig,
    state: DetectionState,
}

impl DetectionOrchestrator {
    pub fn new(
        store: Arc<PackageStore>,
        context: SyncContext,
        detector: Arc<dyn ExposureDetector>,
        clock: Arc<dyn DeviceClock>,
        config: DetectionConfig,
    ) -> Self {
        Self {
            store,
            context,
            detector,
            clock,
            config,
            state: DetectionState::Idle,
        }
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    fn transition(&mut self, next: DetectionState) {
        debug!("Detection state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the attempt to completion on the calling thread.
    pub fn run(self, country: &str) -> Result<DetectionOutcome> {
        let never_cancelled = AtomicBool::new(false);
        // The flag is never set, so run_inner always yields an outcome
        let outcome = self.run_inner(country, &never_cancelled)?;
        Ok(outcome.unwrap_or(DetectionOutcome::NoPackages))
    }

    /// Run the attempt on a worker thread. The returned handle is the
    /// cancellation token: dropping it, or calling `cancel()`, discards the
    /// attempt's result. In-flight detector work may continue, but its
    /// outcome is ignored once cancelled.
    pub fn spawn(self, country: String) -> DetectionHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let (sender, receiver) = mpsc::channel();

        let thread = thread::spawn(move || {
            let message = match self.run_inner(&country, &flag) {
                Ok(Some(outcome)) => Some(Ok(outcome)),
                // Cancelled mid-flight: nothing to deliver
                Ok(None) => None,
                Err(err) => Some(Err(err)),
            };
            if let Some(message) = message {
                let _ = sender.send(message);
            }
        });

        DetectionHandle {
            cancelled,
            receiver,
            thread: Some(thread),
        }
    }

    /// `Ok(None)` means the attempt was cancelled and its result discarded.
    fn run_inner(
        mut self,
        country: &str,
        cancelled: &AtomicBool,
    ) -> Result<Option<DetectionOutcome>> {
        // Device-time sanity check gates every detection call
        if !self.clock.is_trustworthy() {
            let first_occurrence = self.store.flag(DEVICE_TIME_FLAG)?.is_none();
            if first_occurrence {
                self.store.set_flag(DEVICE_TIME_FLAG, "1")?;
                warn!("Device time judged untrustworthy; skipping detection");
            }
            self.transition(DetectionState::Completed);
            return Ok(Some(DetectionOutcome::DeviceTimeIncorrect { first_occurrence }));
        }
        // Clock recovered; the next untrustworthy reading is a new occurrence
        self.store.clear_flag(DEVICE_TIME_FLAG)?;

        self.transition(DetectionState::Materializing);
        let Some(mut written) = self.write_downloaded_packages(country)? else {
            debug!("No eligible packages for {}; skipping detection", country);
            self.transition(DetectionState::Completed);
            return Ok(Some(DetectionOutcome::NoPackages));
        };

        if cancelled.load(Ordering::SeqCst) {
            written.clean_up();
            return Ok(None);
        }

        self.transition(DetectionState::AwaitingDetection);
        let result = self.detect_exposure_windows(&written, country, cancelled);
        // Cleanup runs before returning on every branch; Drop is the backstop
        written.clean_up();

        match &result {
            Ok(Some(_)) | Ok(None) => self.transition(DetectionState::Completed),
            Err(_) => self.transition(DetectionState::Failed),
        }
        result.map(|windows| windows.map(DetectionOutcome::Windows))
    }

    /// Select eligible packages per the configured policy and materialize
    /// them. Returns `None` when the selection is empty (skip, not an
    /// error). Materialization completes entirely or fails outright —
    /// partial package sets are never submitted.
    pub fn write_downloaded_packages(&self, country: &str) -> Result<Option<WrittenPackageSet>> {
        let records = self.select_packages(country)?;
        if records.is_empty() {
            return Ok(None);
        }

        debug!("Materializing {} package(s) for {}", records.len(), country);
        let mut writer = PackageFileWriter::new(&self.config.materialization_root);
        for record in &records {
            if !writer.write_package(record) {
                // Writer drop removes whatever was already written
                return Err(Error::Io(std::io::Error::other(format!(
                    "failed to materialize package {}",
                    record.key
                ))));
            }
        }
        Ok(Some(writer.finish()))
    }

    fn select_packages(&self, country: &str) -> Result<Vec<StoredPackage>> {
        match &self.config.selection {
            SelectionPolicy::UncheckedDays => {
                let days = self.store.days_not_checked(country)?;
                let mut records = Vec::with_capacity(days.len());
                for day in days {
                    if let Some(record) = self.store.day_package(country, day)? {
                        if !record.package.is_tombstone() {
                            records.push(record);
                        }
                    }
                }
                Ok(records)
            }
            SelectionPolicy::UncheckedHoursFrom { day, start_hour } => {
                let records = self
                    .store
                    .hour_packages(country, *day)?
                    .into_iter()
                    .filter(|r| !r.checked_for_exposure)
                    .filter(|r| r.key.hour.is_some_and(|h| h >= *start_hour))
                    .filter(|r| !r.package.is_tombstone())
                    .collect();
                Ok(records)
            }
        }
    }

    /// Invoke the detector once and map its result into this crate's
    /// vocabulary. `Ok(None)` means the attempt was cancelled while the
    /// detector ran; no store side effects are applied in that case.
    fn detect_exposure_windows(
        &self,
        written: &WrittenPackageSet,
        country: &str,
        cancelled: &AtomicBool,
    ) -> Result<Option<Vec<ExposureWindow>>> {
        info!(
            "Invoking exposure detector with {} package file pair(s)",
            written.packages().len()
        );
        let result = self.detector.detect(written.packages(), &self.config.risk);

        if cancelled.load(Ordering::SeqCst) {
            debug!("Attempt cancelled; discarding detector result");
            return Ok(None);
        }

        match result {
            Ok(windows) => {
                self.store.mark_checked(&written.fingerprints())?;
                info!("Detection completed with {} exposure window(s)", windows.len());
                Ok(Some(windows))
            }
            Err(err) if err.kind == DetectorErrorKind::BadParameter => {
                warn!(
                    "Detector rejected local key material for {}: {}",
                    country, err.message
                );
                // Self-healing: purge the affected scope and force a clean
                // resync instead of attempting partial repair
                self.store.delete_country_packages(country)?;
                self.context.invalidate_config_metadata();
                Err(Error::DetectionCorruption(DetectionFailure::new(
                    err.code,
                    err.message,
                )))
            }
            Err(err) => Err(Error::DetectionTransient(DetectionFailure::new(
                err.code,
                err.message,
            ))),
        }
    }
}

/// Progress/cancellation token for a spawned attempt.
pub struct DetectionHandle {
    cancelled: Arc<AtomicBool>,
    receiver: mpsc::Receiver<Result<DetectionOutcome>>,
    thread: Option<JoinHandle<()>>,
}

impl DetectionHandle {
    /// Abandon the attempt. In-flight detector work may continue, but its
    /// result will be discarded.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block until the attempt finishes. Returns `None` if the attempt was
    /// cancelled, whether before or after the detector completed.
    pub fn wait(mut self) -> Option<Result<DetectionOutcome>> {
        let outcome = self.receiver.recv().ok();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if self.cancelled.load(Ordering::SeqCst) {
            None
        } else {
            outcome
        }
    }
}

impl Drop for DetectionHandle {
    fn drop(&mut self) {
        // Discarding the token discards the attempt
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
