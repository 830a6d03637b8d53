//! Global request pacing for download workers.
//!
//! This module provides the [`RateLimiter`] struct which enforces a minimum
//! delay between the *starts* of consecutive outbound requests, across every
//! worker that shares it.
//!
//! # Overview
//!
//! The limiter keeps a single "last grant" timestamp behind a fair
//! (`tokio::sync::Mutex`, FIFO) lock. A caller holds the lock while it waits
//! out the remaining interval and stamps the new grant time before releasing
//! it, so the check and the update form one critical section and two workers
//! can never both observe an expired window.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use galleryfetch_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(Duration::from_millis(500)));
//!
//! // First request proceeds immediately
//! limiter.acquire().await;
//!
//! // Second request waits until 500ms after the first grant, whichever worker asks
//! limiter.acquire().await;
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative imposed delay (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Returned by [`RateLimiter::acquire_until_cancelled`] when the run is cancelled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled while waiting for the rate limiter")]
pub struct Cancelled;

/// Process-wide rate limiter shared by all download workers.
///
/// Wrap it in `Arc` and hand a clone to each worker.
///
/// # Thread Safety
///
/// `RateLimiter` is `Send + Sync`. Waiters are granted in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum spacing between consecutive grants.
    min_interval: Duration,

    /// Time of the last granted request start.
    /// `None` until the first grant (first request is immediate).
    last_grant: Mutex<Option<Instant>>,

    /// Number of grants handed out.
    grants: AtomicU64,

    /// Cumulative delay imposed on callers and by server hints (milliseconds).
    cumulative_delay_ms: AtomicU64,

    /// Whether the cumulative delay warning has already been logged.
    warned: AtomicBool,
}

impl RateLimiter {
    /// Creates a rate limiter with the given minimum interval.
    ///
    /// A zero interval disables limiting.
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = min_interval.as_millis()))]
    pub fn new(min_interval: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            min_interval,
            last_grant: Mutex::new(None),
            grants: AtomicU64::new(0),
            cumulative_delay_ms: AtomicU64::new(0),
            warned: AtomicBool::new(false),
        }
    }

    /// Creates a rate limiter from fractional seconds (`download_delay_seconds`).
    ///
    /// Negative, NaN or non-finite values fall back to a disabled limiter.
    #[must_use]
    pub fn from_secs_f64(seconds: f64) -> Self {
        let interval = Duration::try_from_secs_f64(seconds).unwrap_or_else(|_| {
            warn!(seconds, "invalid rate limit interval, disabling rate limiting");
            Duration::ZERO
        });
        Self::new(interval)
    }

    /// Creates a disabled rate limiter that applies no delays.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.min_interval.is_zero()
    }

    /// Returns the configured minimum interval.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns how many grants have been handed out so far.
    #[must_use]
    pub fn grant_count(&self) -> u64 {
        self.grants.load(Ordering::SeqCst)
    }

    /// Returns the cumulative delay imposed so far.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::SeqCst))
    }

    /// Suspends until at least `min_interval` has passed since the previous
    /// grant, then records this grant.
    ///
    /// The first grant is immediate. Dropping the future while it waits
    /// releases the gate without recording a grant.
    pub async fn acquire(&self) {
        if self.is_disabled() {
            self.grants.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let mut last_grant = self.last_grant.lock().await;

        if let Some(previous) = *last_grant {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let delay = self.min_interval - elapsed;
                let cumulative = self.add_cumulative_delay(delay);
                debug!(
                    delay_ms = delay.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "applying rate limit delay"
                );
                tokio::time::sleep(delay).await;
            }
        } else {
            debug!("first request - no delay");
        }

        *last_grant = Some(Instant::now());
        self.grants.fetch_add(1, Ordering::SeqCst);
    }

    /// Like [`acquire`](Self::acquire), but gives up as soon as `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if the token fires before the grant.
    pub async fn acquire_until_cancelled(
        &self,
        token: &CancellationToken,
    ) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            () = token.cancelled() => Err(Cancelled),
            () = self.acquire() => Ok(()),
        }
    }

    /// Records a server-mandated wait (from a Retry-After header).
    ///
    /// Only feeds the cumulative-delay accounting; the retrying worker does the
    /// waiting itself.
    #[instrument(skip(self), fields(delay_ms = delay.as_millis()))]
    pub fn record_server_delay(&self, delay: Duration) {
        let cumulative = self.add_cumulative_delay(delay);
        debug!(
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = Duration::from_millis(
            self.cumulative_delay_ms
                .fetch_add(delay_ms, Ordering::SeqCst)
                .saturating_add(delay_ms),
        );

        if total >= CUMULATIVE_DELAY_WARNING_THRESHOLD && !self.warned.swap(true, Ordering::SeqCst)
        {
            warn!(
                cumulative_delay_secs = total.as_secs(),
                "excessive rate limiting - the site may be throttling this client"
            );
        }
        total
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use galleryfetch_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        if let Ok(duration) = datetime.duration_since(std::time::SystemTime::now()) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            debug!(
                header_value,
                "Retry-After date is in the past, returning zero"
            );
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
