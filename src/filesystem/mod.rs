// src/filesystem/mod.rs

//! Ephemeral package file materialization
//!
//! The external detection API consumes file locations, not in-memory
//! buffers, so selected packages are written as sibling `.bin`/`.sig` pairs
//! into one freshly created, attempt-unique temporary directory. The pairing
//! convention is load-bearing for the detector; the naming scheme itself is
//! not.
//!
//! The directory is created lazily on the first successful write and removed
//! in full by `clean_up()` — once per attempt, on every exit path. `Drop` is
//! the backstop for panics and early returns.

use crate::db::models::StoredPackage;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// One materialized `.bin`/`.sig` sibling pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenPackage {
    pub bin_path: PathBuf,
    pub sig_path: PathBuf,
    /// Fingerprint of the materialized record, for post-detection bookkeeping
    pub fingerprint: Option<String>,
}

/// Writes selected packages into an attempt-unique temporary directory.
pub struct PackageFileWriter {
    /// Attempt-unique directory; not created until the first write succeeds
    attempt_dir: PathBuf,
    created: bool,
    written: Vec<WrittenPackage>,
}

impl PackageFileWriter {
    /// Prepare a writer rooted under `root`. No I/O happens here; a writer
    /// that never writes never creates a directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let attempt_dir = root
            .as_ref()
            .join(format!("key-packages-{}", Uuid::new_v4()));
        Self {
            attempt_dir,
            created: false,
            written: Vec::new(),
        }
    }

    /// Materialize one package as a `.bin`/`.sig` pair.
    ///
    /// Appends exactly two files with the same base name, or nothing: if
    /// either write fails the partial sibling is removed and `false` is
    /// returned.
    pub fn write_package(&mut self, package: &StoredPackage) -> bool {
        if !self.created {
            if let Err(err) = fs::create_dir_all(&self.attempt_dir) {
                warn!(
                    "Failed to create materialization directory {}: {}",
                    self.attempt_dir.display(),
                    err
                );
                return false;
            }
            self.created = true;
        }

        let base = match package.key.hour {
            Some(hour) => format!("{}_{}_{:02}", package.key.country, package.key.day, hour),
            None => format!("{}_{}", package.key.country, package.key.day),
        };
        let bin_path = self.attempt_dir.join(format!("{base}.bin"));
        let sig_path = self.attempt_dir.join(format!("{base}.sig"));

        if let Err(err) = fs::write(&bin_path, &package.package.bin) {
            warn!("Failed to write {}: {}", bin_path.display(), err);
            return false;
        }
        if let Err(err) = fs::write(&sig_path, &package.package.signature) {
            warn!("Failed to write {}: {}", sig_path.display(), err);
            let _ = fs::remove_file(&bin_path);
            return false;
        }

        self.written.push(WrittenPackage {
            bin_path,
            sig_path,
            fingerprint: package.fingerprint.clone(),
        });
        true
    }

    /// Read-only snapshot of the pairs written so far, in write order.
    pub fn written_packages(&self) -> &[WrittenPackage] {
        &self.written
    }

    /// Hand the accumulated pairs (and directory ownership) to the caller.
    pub fn finish(mut self) -> WrittenPackageSet {
        // Ownership of the directory moves to the set; disarm our own Drop
        let created = std::mem::replace(&mut self.created, false);
        WrittenPackageSet {
            dir: self.attempt_dir.clone(),
            created,
            packages: std::mem::take(&mut self.written),
            cleaned: false,
        }
    }
}

impl Drop for PackageFileWriter {
    fn drop(&mut self) {
        // Reached only when the writer was abandoned before finish()
        if self.created {
            let _ = fs::remove_dir_all(&self.attempt_dir);
        }
    }
}

/// The ordered materialized pairs of one detection attempt. Owns the
/// temporary directory and guarantees its removal.
#[derive(Debug)]
pub struct WrittenPackageSet {
    dir: PathBuf,
    created: bool,
    packages: Vec<WrittenPackage>,
    cleaned: bool,
}

impl WrittenPackageSet {
    /// The materialized pairs, in write order.
    pub fn packages(&self) -> &[WrittenPackage] {
        &self.packages
    }

    /// Fingerprints of the materialized records, for mark-checked batching.
    pub fn fingerprints(&self) -> Vec<String> {
        self.packages
            .iter()
            .filter_map(|p| p.fingerprint.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Remove the entire attempt directory. Idempotent; a set that never
    /// wrote anything has no directory and this is a no-op.
    pub fn clean_up(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        if !self.created {
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Removed materialization directory {}", self.dir.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "Failed to remove materialization directory {}: {}",
                self.dir.display(),
                err
            ),
        }
    }
}

impl Drop for WrittenPackageSet {
    fn drop(&mut self) {
        self.clean_up();
    }
}
