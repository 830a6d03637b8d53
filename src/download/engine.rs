//! Download manager: a fixed pool of workers pulling from one task source.
//!
//! # Per-task flow
//!
//! 1. Skip if the ledger already holds the URL (unless forcing), or if the
//!    same URL is already being fetched in this run
//! 2. Claim the destination path; a task whose destination another task is
//!    still writing waits for it to finish
//! 3. Wait for the shared [`RateLimiter`]
//! 4. Fetch through [`HttpClient::fetch_to_file`]; on failure ask the
//!    [`RetryPolicy`] and either sleep and go back to 3, or give up
//! 5. On success submit the record to the ledger writer and wait for the flush
//!
//! # Cancellation
//!
//! When the token fires, workers stop taking tasks, and rate-limiter waits and
//! backoff sleeps end at once. Fetches already on the wire get a grace period
//! and are then aborted; their partial files are removed by the fetch client.
//! Interrupted tasks are counted as cancelled and are never recorded, so the
//! next run picks them up again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{RetryAction, RetryPolicy};
use super::task::DownloadTask;
use super::{DownloadError, HttpClient};
use crate::auth::{AuthProvider, NoAuth};
use crate::ledger::{LedgerError, LedgerHandle};
use crate::progress::{NoProgress, ProgressCounts, ProgressEvent, ProgressKind, ProgressSink};
use crate::source::TaskSource;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Default number of workers.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// How long in-flight fetches may keep running after cancellation.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Error type for download manager operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// The archive could not be written; the run was stopped.
    #[error("failed to record {url} in the archive: {source}")]
    LedgerFlush {
        /// URL whose record could not be flushed.
        url: String,
        /// Ledger error.
        #[source]
        source: LedgerError,
    },
}

/// A task that failed permanently in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Task URL.
    pub url: String,
    /// Intended destination.
    pub destination: PathBuf,
    /// Terminal reason.
    pub reason: String,
    /// Fetch attempts made.
    pub attempts: u32,
}

/// Final report of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Files written and recorded.
    pub downloaded: u64,
    /// Tasks skipped because the URL was already archived or in flight.
    pub skipped: u64,
    /// Tasks that failed permanently.
    pub failed: u64,
    /// Tasks interrupted by cancellation.
    pub cancelled: u64,
    /// Retries performed across all tasks.
    pub retries: u64,
    /// Bytes written across all downloads.
    pub bytes: u64,
    /// Task source entries that could not be read.
    pub source_errors: u64,
    /// Permanent failures with their reasons.
    pub failures: Vec<TaskFailure>,
    /// Whether the run was cancelled.
    pub was_cancelled: bool,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl DownloadSummary {
    /// Tasks that reached a terminal state (downloaded, skipped or failed).
    #[must_use]
    pub fn total(&self) -> u64 {
        self.downloaded + self.skipped + self.failed
    }
}

/// Counters updated concurrently by workers.
#[derive(Debug, Default)]
struct DownloadStats {
    downloaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    bytes: AtomicU64,
    source_errors: AtomicU64,
    failures: StdMutex<Vec<TaskFailure>>,
}

impl DownloadStats {
    fn counts(&self) -> ProgressCounts {
        ProgressCounts {
            downloaded: self.downloaded.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
        }
    }

    fn push_failure(&self, failure: TaskFailure) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }

    fn summary(&self, was_cancelled: bool, elapsed: Duration) -> DownloadSummary {
        DownloadSummary {
            downloaded: self.downloaded.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            bytes: self.bytes.load(Ordering::SeqCst),
            source_errors: self.source_errors.load(Ordering::SeqCst),
            failures: self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            was_cancelled,
            elapsed,
        }
    }
}

/// Bounded worker pool with retry, pacing and dedup.
///
/// # Concurrency Model
///
/// - `concurrency` Tokio tasks, each pulling one task at a time from the shared source
/// - One global [`RateLimiter`] spaces request starts across all workers
/// - Ledger writes go through the single writer behind a [`LedgerHandle`]
/// - A URL is processed by at most one worker at a time
pub struct DownloadManager {
    concurrency: usize,
    retry_policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    client: HttpClient,
    auth: Arc<dyn AuthProvider>,
    progress: Arc<dyn ProgressSink>,
    force_redownload: bool,
    grace_period: Duration,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("concurrency", &self.concurrency)
            .field("retry_policy", &self.retry_policy)
            .field("rate_limiter", &self.rate_limiter)
            .field("force_redownload", &self.force_redownload)
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager with no authentication and no progress output.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if `concurrency` is outside 1..=100.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use galleryfetch_core::download::{DownloadManager, HttpClient, RateLimiter, RetryPolicy};
    ///
    /// let client = HttpClient::new(Duration::from_secs(30)).unwrap();
    /// let limiter = Arc::new(RateLimiter::new(Duration::from_millis(500)));
    /// let manager = DownloadManager::new(2, RetryPolicy::default(), limiter, client).unwrap();
    /// assert_eq!(manager.concurrency(), 2);
    /// ```
    #[instrument(level = "debug", skip(retry_policy, rate_limiter, client))]
    pub fn new(
        concurrency: usize,
        retry_policy: RetryPolicy,
        rate_limiter: Arc<RateLimiter>,
        client: HttpClient,
    ) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(EngineError::InvalidConcurrency { value: concurrency });
        }

        debug!(
            concurrency,
            max_retries = retry_policy.max_retries(),
            rate_limit_ms = rate_limiter.min_interval().as_millis(),
            "creating download manager"
        );

        Ok(Self {
            concurrency,
            retry_policy,
            rate_limiter,
            client,
            auth: Arc::new(NoAuth),
            progress: Arc::new(NoProgress),
            force_redownload: false,
            grace_period: DEFAULT_GRACE_PERIOD,
        })
    }

    /// Sets the header provider used for every request.
    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Fetches URLs even when the ledger already holds them.
    #[must_use]
    pub fn with_force_redownload(mut self, force: bool) -> Self {
        self.force_redownload = force;
        self
    }

    /// Sets how long in-flight fetches may finish after cancellation.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Returns the configured worker count.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the configured retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Processes every task from `source`.
    ///
    /// Completes when the source is exhausted and all workers are idle, or
    /// after cancellation and the grace period.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LedgerFlush`] if a ledger record could not be
    /// persisted; the run stops taking tasks at that point. Individual task
    /// failures never make this method fail; they are listed in the summary.
    #[instrument(skip_all, fields(concurrency = self.concurrency, force = self.force_redownload))]
    pub async fn run(
        &self,
        source: Box<dyn TaskSource>,
        ledger: LedgerHandle,
        cancel: CancellationToken,
    ) -> Result<DownloadSummary, EngineError> {
        let started = Instant::now();
        let run_token = cancel.child_token();
        let stats = Arc::new(DownloadStats::default());
        let fatal = Arc::new(StdMutex::new(None));

        let ctx = Arc::new(WorkerContext {
            source: Mutex::new(source),
            ledger,
            client: self.client.clone(),
            retry_policy: self.retry_policy.clone(),
            rate_limiter: Arc::clone(&self.rate_limiter),
            auth: Arc::clone(&self.auth),
            progress: Arc::clone(&self.progress),
            force_redownload: self.force_redownload,
            in_flight: StdMutex::new(HashSet::new()),
            busy_destinations: StdMutex::new(HashSet::new()),
            destination_released: Notify::new(),
            stats: Arc::clone(&stats),
            fatal: Arc::clone(&fatal),
            cancel: run_token.clone(),
        });

        info!("starting download run");

        let mut handles: Vec<JoinHandle<()>> = (0..self.concurrency)
            .map(|worker| tokio::spawn(worker_loop(Arc::clone(&ctx), worker)))
            .collect();
        drop(ctx);

        let mut joined = 0;
        while joined < handles.len() {
            tokio::select! {
                biased;
                result = &mut handles[joined] => {
                    if let Err(e) = result {
                        warn!(error = %e, "download worker panicked");
                    }
                    joined += 1;
                }
                () = run_token.cancelled() => break,
            }
        }

        if joined < handles.len() {
            debug!(
                grace_ms = self.grace_period.as_millis(),
                "cancellation requested, waiting for in-flight downloads"
            );
            let deadline = tokio::time::Instant::now() + self.grace_period;
            for handle in handles.iter_mut().skip(joined) {
                match tokio::time::timeout_at(deadline, &mut *handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "download worker panicked"),
                    Err(_) => {
                        handle.abort();
                        // Awaiting the aborted handle guarantees its drop glue has run
                        let _ = handle.await;
                    }
                }
            }
        }

        let summary = stats.summary(cancel.is_cancelled(), started.elapsed());
        info!(
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            retries = summary.retries,
            source_errors = summary.source_errors,
            elapsed_ms = summary.elapsed.as_millis(),
            "download run complete"
        );

        let fatal = fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match fatal {
            Some(error) => Err(error),
            None => Ok(summary),
        }
    }
}

/// State shared by all workers of one run.
struct WorkerContext {
    source: Mutex<Box<dyn TaskSource>>,
    ledger: LedgerHandle,
    client: HttpClient,
    retry_policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    auth: Arc<dyn AuthProvider>,
    progress: Arc<dyn ProgressSink>,
    force_redownload: bool,
    in_flight: StdMutex<HashSet<String>>,
    busy_destinations: StdMutex<HashSet<PathBuf>>,
    destination_released: Notify,
    stats: Arc<DownloadStats>,
    fatal: Arc<StdMutex<Option<EngineError>>>,
    cancel: CancellationToken,
}

impl WorkerContext {
    fn emit(&self, event: ProgressEvent) {
        self.progress.emit(&event);
    }

    fn event(&self, kind: ProgressKind, url: &str, attempt: u32) -> ProgressEvent {
        ProgressEvent::new(kind, url, attempt, self.stats.counts())
    }

    fn skip(&self, url: &str, reason: &'static str) {
        self.stats.skipped.fetch_add(1, Ordering::SeqCst);
        debug!(url = %url, reason, "skipping");
        self.emit(self.event(ProgressKind::Skipped, url, 0));
    }

    fn headers_for(&self, url: &str) -> HeaderMap {
        Url::parse(url).map_or_else(|_| HeaderMap::new(), |parsed| self.auth.headers_for(&parsed))
    }

    fn set_fatal(&self, error: EngineError) {
        let mut fatal = self
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(error);
        }
        self.cancel.cancel();
    }
}

/// Marks a task as cancelled unless it reached a terminal state.
///
/// Dropping the guard un-settled covers both explicit cancellation returns and
/// the worker being aborted mid-fetch. It also releases the URL's in-flight
/// slot and, once claimed, the destination path.
struct TaskGuard<'a> {
    ctx: &'a WorkerContext,
    url: String,
    destination: Option<PathBuf>,
    settled: bool,
}

impl TaskGuard<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.ctx.stats.cancelled.fetch_add(1, Ordering::SeqCst);
            debug!(url = %self.url, "task cancelled");
        }
        self.ctx
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.url);
        if let Some(destination) = self.destination.take() {
            self.ctx
                .busy_destinations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&destination);
            self.ctx.destination_released.notify_waiters();
        }
    }
}

/// Waits until no other task of this run is writing `destination`, then
/// claims it. Returns false if the run is cancelled while waiting.
async fn claim_destination(ctx: &WorkerContext, destination: &Path) -> bool {
    loop {
        let released = ctx.destination_released.notified();
        tokio::pin!(released);
        released.as_mut().enable();

        let claimed = ctx
            .busy_destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(destination.to_path_buf());
        if claimed {
            return true;
        }

        debug!(dest = %destination.display(), "destination busy, waiting");
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return false,
            () = released.as_mut() => {}
        }
    }
}

#[instrument(skip(ctx))]
async fn worker_loop(ctx: Arc<WorkerContext>, worker: usize) {
    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            next = async { ctx.source.lock().await.next_task().await } => next,
        };

        match next {
            None => break,
            Some(Err(error)) => {
                ctx.stats.source_errors.fetch_add(1, Ordering::SeqCst);
                warn!(error = %error, "skipping unreadable task");
            }
            Some(Ok(task)) => process_task(&ctx, task).await,
        }
    }
    debug!("worker finished");
}

#[instrument(skip(ctx, task), fields(url = %task.url))]
async fn process_task(ctx: &WorkerContext, task: DownloadTask) {
    if !ctx.force_redownload && ctx.ledger.contains(&task.url) {
        ctx.skip(&task.url, "already archived");
        return;
    }

    let claimed = ctx
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(task.url.clone());
    if !claimed {
        ctx.skip(&task.url, "same URL already in progress");
        return;
    }

    let mut guard = TaskGuard {
        ctx,
        url: task.url.clone(),
        destination: None,
        settled: false,
    };
    if !claim_destination(ctx, &task.destination).await {
        return;
    }
    guard.destination = Some(task.destination.clone());
    let mut attempt_count = 0u32;

    loop {
        if ctx
            .rate_limiter
            .acquire_until_cancelled(&ctx.cancel)
            .await
            .is_err()
        {
            return;
        }

        let attempt = attempt_count + 1;
        ctx.emit(ctx.event(ProgressKind::Started, &task.url, attempt));
        debug!(attempt, "attempting download");

        let result = ctx
            .client
            .fetch_to_file(&task.url, &task.destination, ctx.headers_for(&task.url))
            .await;

        let error = match result {
            Ok(bytes) => {
                finish_success(ctx, &task, attempt, bytes).await;
                guard.settle();
                return;
            }
            Err(error) => error,
        };

        match ctx.retry_policy.next_action(attempt_count, &error) {
            RetryAction::Retry { after } => {
                if server_hint(&error).is_some() {
                    ctx.rate_limiter.record_server_delay(after);
                }
                ctx.stats.retries.fetch_add(1, Ordering::SeqCst);
                info!(
                    attempt,
                    delay_ms = after.as_millis(),
                    error = %error,
                    "retrying download"
                );
                ctx.emit(
                    ctx.event(ProgressKind::Retrying, &task.url, attempt)
                        .with_detail(error.to_string()),
                );

                tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => return,
                    () = tokio::time::sleep(after) => {}
                }
                attempt_count += 1;

                if !ctx.force_redownload && ctx.ledger.contains(&task.url) {
                    ctx.skip(&task.url, "archived while waiting to retry");
                    guard.settle();
                    return;
                }
            }
            RetryAction::GiveUp { reason } => {
                warn!(attempts = attempt, reason = %reason, "download failed");
                let failure = TaskFailure {
                    url: task.url.clone(),
                    destination: task.destination.clone(),
                    reason: reason.to_string(),
                    attempts: attempt,
                };
                ctx.stats.push_failure(failure);
                ctx.emit(
                    ctx.event(ProgressKind::Failed, &task.url, attempt)
                        .with_detail(reason.to_string()),
                );
                guard.settle();
                return;
            }
        }
    }
}

async fn finish_success(ctx: &WorkerContext, task: &DownloadTask, attempt: u32, bytes: u64) {
    match ctx.ledger.record(&task.url, task.metadata.clone()).await {
        Ok(()) => {
            ctx.stats.downloaded.fetch_add(1, Ordering::SeqCst);
            ctx.stats.bytes.fetch_add(bytes, Ordering::SeqCst);
            ctx.emit(
                ctx.event(ProgressKind::Succeeded, &task.url, attempt)
                    .with_bytes(bytes),
            );
        }
        Err(source) => {
            error!(error = %source, "archive flush failed, stopping run");
            ctx.stats.push_failure(TaskFailure {
                url: task.url.clone(),
                destination: task.destination.clone(),
                reason: format!("archive write failed: {source}"),
                attempts: attempt,
            });
            ctx.emit(
                ctx.event(ProgressKind::Failed, &task.url, attempt)
                    .with_detail(source.to_string()),
            );
            ctx.set_fatal(EngineError::LedgerFlush {
                url: task.url.clone(),
                source,
            });
        }
    }
}

fn server_hint(error: &DownloadError) -> Option<Duration> {
    error.retry_after_hint().and_then(parse_retry_after)
}
