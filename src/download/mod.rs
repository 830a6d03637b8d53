//! Download manager: rate limiting, retry policy, fetch client and worker pool.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use galleryfetch_core::{
//!     ArchiveLedger, DownloadManager, DownloadTask, HttpClient, LedgerWriter, NoAuth,
//!     RateLimiter, RetryPolicy, TracingSink, VecTaskSource,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Arc::new(ArchiveLedger::load("out/gallery-archive.json").await?);
//! let writer = LedgerWriter::spawn(Arc::clone(&ledger));
//! let manager = DownloadManager::new(
//!     2,
//!     RetryPolicy::default(),
//!     Arc::new(RateLimiter::from_secs_f64(1.5)),
//!     HttpClient::new(Duration::from_secs(30))?,
//! )?
//! .with_auth(Arc::new(NoAuth))
//! .with_progress(Arc::new(TracingSink));
//!
//! let source = VecTaskSource::new(vec![DownloadTask::new(
//!     "https://img.example/1/1.jpg",
//!     "out/Title/1.jpg",
//! )]);
//! let summary = manager
//!     .run(Box::new(source), writer.handle(), CancellationToken::new())
//!     .await?;
//! writer.shutdown().await;
//! println!("downloaded {}", summary.downloaded);
//! # Ok(())
//! # }
//! ```

mod client;
mod engine;
mod error;
pub mod rate_limiter;
mod retry;
mod task;

pub use client::{DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, HttpClient, PARTIAL_SUFFIX};
pub use engine::{
    DEFAULT_CONCURRENCY, DEFAULT_GRACE_PERIOD, DownloadManager, DownloadSummary, EngineError,
    MAX_CONCURRENCY, TaskFailure,
};
pub use error::DownloadError;
pub use rate_limiter::{Cancelled, RateLimiter, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureKind, GiveUpReason, RetryAction, RetryPolicy, classify_error,
};
pub use task::{DownloadTask, Metadata, MetadataValue};
