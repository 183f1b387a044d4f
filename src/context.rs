// src/context.rs

//! Shared sync/detection context
//!
//! Process-wide mutable state that both the sync path and the detection path
//! read: the revocation list and the cached remote-configuration metadata.
//! Neither is ambient — every component takes the context as an explicit
//! dependency. Mutation is always a single-writer atomic full replace, never
//! a partial in-place update.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Cached metadata about the last remote configuration fetch.
///
/// The payload itself is opaque to this crate; only the version token and
/// fetch time matter for cache-invalidation decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Version token of the cached remote configuration
    pub etag: Option<String>,
    /// RFC 3339 timestamp of the fetch
    pub fetched_at: String,
}

impl ConfigMetadata {
    pub fn new(etag: Option<String>) -> Self {
        Self {
            etag,
            fetched_at: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Default)]
struct ContextState {
    /// Denylisted ETags and fingerprints
    revoked: HashSet<String>,
    /// Metadata of the cached remote configuration, None when invalidated
    config_metadata: Option<ConfigMetadata>,
}

/// Explicitly injected shared state for sync and detection.
///
/// Cloning is cheap (`Arc`-backed); all clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    inner: Arc<RwLock<ContextState>>,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an ETag or fingerprint is on the revocation list.
    pub fn is_revoked(&self, token: &str) -> bool {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.revoked.contains(token)
    }

    /// Snapshot of the current revocation list.
    pub fn revocation_list(&self) -> HashSet<String> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.revoked.clone()
    }

    /// Atomically replace the whole revocation list with a freshly fetched one.
    pub fn replace_revocation_list(&self, revoked: HashSet<String>) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.revoked = revoked;
    }

    /// Metadata of the cached remote configuration, if any.
    pub fn config_metadata(&self) -> Option<ConfigMetadata> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.config_metadata.clone()
    }

    /// Atomically replace the cached configuration metadata.
    pub fn replace_config_metadata(&self, metadata: Option<ConfigMetadata>) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.config_metadata = metadata;
    }

    /// Drop the cached configuration metadata, forcing a refetch next cycle.
    pub fn invalidate_config_metadata(&self) {
        self.replace_config_metadata(None);
    }
}
