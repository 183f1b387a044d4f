// src/lib.rs

//! Diagnosis-key package store and detection pipeline
//!
//! The local core of an exposure-notification client: an embedded,
//! schema-migrating SQLite store of signed key packages plus the
//! orchestration that feeds them to an external detection API.
//!
//! # Architecture
//!
//! - Store-first: signed packages keyed by `(country, day, hour)` in SQLite,
//!   behind one serialized connection
//! - Delta sync: pure set difference decides what to download
//! - Revocation: a denylist consulted synchronously on every write
//! - Materialization: ephemeral `.bin`/`.sig` file pairs per detection
//!   attempt, cleaned up on every exit path
//! - Detection: one attempt per orchestrator value, with transient vs.
//!   corruption-class error handling
//!
//! Everything that renders screens, issues HTTP requests, or wraps the
//! platform's proximity API is an external collaborator behind a trait seam.

pub mod context;
pub mod db;
pub mod delta;
pub mod detection;
mod error;
pub mod filesystem;
pub mod sync;

pub use context::{ConfigMetadata, SyncContext};
pub use db::PackageStore;
pub use db::models::{DiagnosisPackage, PackageKey, StoreFlag, StoredPackage};
pub use delta::{DeltaCalculationResult, DeltaCalculator};
pub use detection::{
    DetectionConfig, DetectionHandle, DetectionOrchestrator, DetectionOutcome, DetectionState,
    DetectorError, DetectorErrorKind, DeviceClock, ExposureDetector, ExposureWindow,
    RiskConfiguration, SelectionPolicy,
};
pub use error::{DetectionFailure, Error, Result, StorageError};
pub use filesystem::{PackageFileWriter, WrittenPackage, WrittenPackageSet};
pub use sync::{
    CountryManifest, FetchedPackage, ManifestEntry, PackageFetcher, PackageSync, SyncConfig,
    SyncReport,
};
