//! Task sources feeding the download manager.
//!
//! # Overview
//!
//! - [`TaskSource`] - Async trait the manager pulls tasks from
//! - [`VecTaskSource`] - In-memory source, mostly for tests and library callers
//! - [`ManifestTaskSource`] - Lazy JSON-lines manifest reader with preset filters
//!
//! Sources are pulled one task at a time by whichever worker is free; they
//! never run ahead of the workers.

mod manifest;

use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::download::DownloadTask;

pub use manifest::{ManifestStats, ManifestTaskSource};

/// Errors produced while reading tasks.
///
/// A source error skips one entry; the run continues.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The underlying file or stream failed.
    #[error("failed to read task source {path}: {source}")]
    Io {
        /// Source path (or `<stream>`).
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A line is not valid JSON.
    #[error("line {line}: invalid JSON: {source}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// A line is valid JSON but not a recognizable entry.
    #[error("line {line}: {reason}")]
    InvalidEntry {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },
}

/// Ordered, possibly lazy sequence of download tasks.
///
/// This trait uses `async_trait` so the manager can hold a `Box<dyn TaskSource>`.
#[async_trait]
pub trait TaskSource: Send {
    /// Returns the next task, an error for one bad entry, or `None` when exhausted.
    async fn next_task(&mut self) -> Option<Result<DownloadTask, SourceError>>;
}

/// Source backed by a pre-built list.
#[derive(Debug, Default)]
pub struct VecTaskSource {
    items: VecDeque<Result<DownloadTask, SourceError>>,
}

impl VecTaskSource {
    /// Creates a source yielding `tasks` in order.
    #[must_use]
    pub fn new(tasks: Vec<DownloadTask>) -> Self {
        Self {
            items: tasks.into_iter().map(Ok).collect(),
        }
    }

    /// Creates a source that also yields errors, in order.
    #[must_use]
    pub fn from_results(items: Vec<Result<DownloadTask, SourceError>>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// Number of items not yet taken.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl TaskSource for VecTaskSource {
    async fn next_task(&mut self) -> Option<Result<DownloadTask, SourceError>> {
        self.items.pop_front()
    }
}
