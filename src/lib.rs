//! Galleryfetch Core Library
//!
//! This library provides the download manager behind the `galleryfetch` tool,
//! which turns tag-based search presets into a paced, deduplicated local
//! archive of image sets.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`ledger`] - Persisted archive of already-downloaded URLs (dedup source of truth)
//! - [`download`] - Rate limiter, retry policy, HTTP fetch client and the worker-pool manager
//! - [`source`] - Task sources feeding the manager (in-memory, JSON-lines manifest)
//! - [`auth`] - Cookie/header providers attached to outgoing requests
//! - [`progress`] - Structured progress events and sinks
//! - [`config`] - Presets file loading and validation
//! - [`template`] - Destination path templating

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod download;
pub mod ledger;
pub mod progress;
pub mod source;
pub mod template;

// Re-export commonly used types
pub use auth::{AuthProvider, CookieFileAuth, NoAuth};
pub use config::{ConfigError, DownloadConfig, PresetConfig, PresetsFile};
pub use download::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DownloadError, DownloadManager, DownloadSummary,
    DownloadTask, EngineError, FailureKind, HttpClient, MetadataValue, RateLimiter, RetryAction,
    RetryPolicy, TaskFailure, classify_error,
};
pub use ledger::{ArchiveLedger, LedgerError, LedgerHandle, LedgerRecord, LedgerWriter};
pub use progress::{ChannelSink, ProgressEvent, ProgressKind, ProgressSink, TracingSink};
pub use source::{ManifestTaskSource, SourceError, TaskSource, VecTaskSource};
