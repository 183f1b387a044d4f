// src/db/models/mod.rs

//! Data models for the package store
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

mod flag;
mod package;

pub use flag::StoreFlag;
pub use package::{DiagnosisPackage, PackageKey, StoredPackage};
