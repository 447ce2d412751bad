//! Core data types for captured items and pipeline errors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::browser::BrowserError;
use crate::config::ConfigError;
use crate::manifest::ManifestError;
use crate::verify::CountMismatchError;

/// Storefront identifier of a catalog item (`databaseID`).
///
/// Unique per item; used both as a map key and as a URL path segment.
pub type ItemId = String;

/// One successfully downloaded library item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedItem {
    pub id: ItemId,
    pub title: String,
    pub organization_name: String,
    /// Acquisition time as reported by the storefront (ISO-8601).
    pub caused_at: String,
    /// Name of the stored file inside the output directory.
    pub file_name: String,
}

/// Captured items keyed by identifier.
///
/// Only the final size is load-bearing; iteration order is unspecified.
#[derive(Debug, Clone, Default)]
pub struct CaptureMap {
    items: HashMap<ItemId, CapturedItem>,
}

impl CaptureMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record keyed by its identifier.
    ///
    /// Returns the record it replaced, if the identifier was already present.
    pub fn insert(&mut self, item: CapturedItem) -> Option<CapturedItem> {
        self.items.insert(item.id.clone(), item)
    }

    /// Get a record by identifier.
    pub fn get(&self, id: &str) -> Option<&CapturedItem> {
        self.items.get(id)
    }

    /// Whether a record exists for the identifier.
    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Number of captured items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over the records in unspecified order.
    pub fn values(&self) -> impl Iterator<Item = &CapturedItem> {
        self.items.values()
    }

    /// Records sorted by identifier, for reproducible exports.
    pub fn sorted(&self) -> Vec<&CapturedItem> {
        let mut items: Vec<_> = self.items.values().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }
}

/// Errors that can occur while running the capture pipeline.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Timed out after {after_ms}ms waiting for {what}")]
    Timeout { what: String, after_ms: u64 },

    #[error("Failed to decode {operation} response: {source}")]
    Decode {
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    CountMismatch(#[from] CountMismatchError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type HarvestResult<T> = Result<T, HarvestError>;
