// src/error.rs

//! Error types for the diagnosis-key package store and detection pipeline
//!
//! Every error carries a structured kind plus enough underlying detail for a
//! caller to decide between retry and notify. Only two classes ever mutate
//! state on the way out: a corruption-class detection failure (which purges
//! the affected country before surfacing) and `reset()` itself.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an underlying SQLite failure.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A uniqueness or CHECK constraint was violated
    #[error("constraint violated: {0}")]
    Constraint(#[source] rusqlite::Error),

    /// The database file is corrupt or not a database
    #[error("database corrupt: {0}")]
    Corrupt(#[source] rusqlite::Error),

    /// Disk-level failure (full, read-only, cannot open)
    #[error("database I/O failure: {0}")]
    Io(#[source] rusqlite::Error),

    /// The store has been closed; no connection is available
    #[error("store is closed")]
    Closed,

    /// Any other SQLite error
    #[error("database error: {0}")]
    Other(#[source] rusqlite::Error),
}

impl StorageError {
    /// Sort a raw rusqlite error into the retry-relevant buckets.
    pub fn classify(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::ConstraintViolation => StorageError::Constraint(err),
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StorageError::Corrupt(err),
                ErrorCode::DiskFull
                | ErrorCode::CannotOpen
                | ErrorCode::ReadOnly
                | ErrorCode::SystemIoFailure => StorageError::Io(err),
                _ => StorageError::Other(err),
            },
            _ => StorageError::Other(err),
        }
    }
}

/// Structured failure reported by the external exposure detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionFailure {
    /// Platform error code, passed through verbatim
    pub code: i64,
    /// Human-readable description from the platform
    pub message: String,
}

impl DetectionFailure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for DetectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying SQL failure, classified for retry decisions
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Write refused by local revocation policy; the database is never touched
    #[error("package revoked by distribution policy (etag {etag:?})")]
    RevokedPackage { etag: Option<String> },

    /// Transient external-detector failure (authorization, throttling); safe to retry
    #[error("exposure detection failed (transient): {0}")]
    DetectionTransient(DetectionFailure),

    /// The external detector rejected local key material as malformed.
    /// Surfacing this error implies the affected country has been purged.
    #[error("exposure detection failed (corrupt key material): {0}")]
    DetectionCorruption(DetectionFailure),

    /// A schema migration step failed and was rolled back
    #[error("migration to schema version {version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: Box<Error>,
    },

    /// File materialization failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(StorageError::classify(err))
    }
}

impl Error {
    /// True for detector failures the caller may simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::DetectionTransient(_))
    }

    /// True for the "bad parameter" class that forced a local purge.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::DetectionCorruption(_))
    }
}
