//! Download task descriptors consumed by the manager.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A scalar metadata value carried verbatim from the task source to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Whole number (ordinal index, page count).
    Integer(i64),
    /// Fractional number.
    Float(f64),
    /// Free text (gallery title, release date).
    Text(String),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Opaque metadata attached to a task and stored in its ledger record.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// One fetchable resource.
///
/// `url` is the dedup key. `destination` is already resolved by the task
/// source; the manager never rewrites it.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    /// Absolute resource locator.
    pub url: String,
    /// Final file path.
    pub destination: PathBuf,
    /// Pass-through metadata.
    pub metadata: Metadata,
}

impl DownloadTask {
    /// Creates a task with empty metadata.
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            metadata: Metadata::new(),
        }
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the destination path.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }
}
