//! Retry logic with exponential backoff for transient download failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureKind`] types for
//! classifying fetch errors and deciding what happens next.
//!
//! # Overview
//!
//! When a fetch fails, the error is classified into a [`FailureKind`]:
//! - [`FailureKind::Transient`] - network errors, timeouts, 5xx, truncated bodies
//! - [`FailureKind::RateLimited`] - HTTP 429, waits for the server hint when present
//! - [`FailureKind::Permanent`] - other 4xx, local disk errors, bad URL/destination
//!
//! The [`RetryPolicy`] turns the classification and the number of retries
//! already spent into a [`RetryAction`]. The policy holds no mutable state, so a
//! single instance can be shared by every worker.
//!
//! # Example
//!
//! ```
//! use galleryfetch_core::download::{DownloadError, RetryAction, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://example.com/1.jpg", 503);
//!
//! match policy.next_action(0, &error) {
//!     RetryAction::Retry { after } => println!("retrying in {after:?}"),
//!     RetryAction::GiveUp { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;
use super::rate_limiter::parse_retry_after;

/// Default maximum number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each retry).
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Classification of fetch failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, connection reset, 5xx, truncated body.
    Transient,

    /// Server rate limiting (HTTP 429).
    RateLimited,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 403 Forbidden, disk full, invalid URL.
    Permanent,
}

impl FailureKind {
    /// Returns true if the failure may be retried.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Why the policy stopped retrying a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The error is not retryable.
    Permanent {
        /// Rendered error message.
        detail: String,
    },
    /// The retry budget is spent.
    RetriesExhausted {
        /// Total attempts made, including the initial one.
        attempts: u32,
        /// Rendered message of the last error.
        last_error: String,
    },
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent { detail } => write!(f, "permanent failure: {detail}"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "retries exhausted after {attempts} attempts: {last_error}"),
        }
    }
}

/// Decision taken after a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Wait for `after`, re-acquire the rate limiter, and fetch again.
    Retry {
        /// How long to wait before the next attempt.
        after: Duration,
    },

    /// Stop; the task is permanently failed for this run.
    GiveUp {
        /// Why retrying stopped.
        reason: GiveUpReason,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3 (so at most 4 attempts)
/// - `base_delay`: 1 second
/// - `max_delay`: 32 seconds
/// - `backoff_multiplier`: 2.0
/// - jitter: none
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^attempt_count, max_delay) [+ jitter]
/// ```
///
/// `attempt_count` is the number of retries already performed, so the first
/// retry waits `base_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    max_retries: u32,

    /// Delay before the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied per retry.
    backoff_multiplier: f64,

    /// Upper bound of random jitter added to backoff delays.
    max_jitter: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// A multiplier below 1.0 (or NaN) is clamped to 1.0 so delays never shrink.
    #[must_use]
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        let backoff_multiplier = if backoff_multiplier.is_nan() {
            1.0
        } else {
            backoff_multiplier.max(1.0)
        };
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
            backoff_multiplier,
            max_jitter: None,
        }
    }

    /// Creates a policy with a custom retry budget, using defaults for other settings.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Adds random jitter in `0..=max_jitter` to every backoff delay.
    ///
    /// Server-provided Retry-After waits are never jittered.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = (!max_jitter.is_zero()).then_some(max_jitter);
        self
    }

    /// Returns the configured retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the configured backoff cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Decides what to do after a failed fetch.
    ///
    /// # Arguments
    ///
    /// * `attempt_count` - Retries already performed for this task (0 after the first failure)
    /// * `error` - The error of the attempt that just failed
    #[instrument(skip(self, error), fields(max_retries = self.max_retries))]
    pub fn next_action(&self, attempt_count: u32, error: &DownloadError) -> RetryAction {
        let kind = classify_error(error);

        if !kind.is_retryable() {
            return RetryAction::GiveUp {
                reason: GiveUpReason::Permanent {
                    detail: error.to_string(),
                },
            };
        }

        if attempt_count >= self.max_retries {
            debug!(attempt_count, "retry budget exhausted");
            return RetryAction::GiveUp {
                reason: GiveUpReason::RetriesExhausted {
                    attempts: attempt_count.saturating_add(1),
                    last_error: error.to_string(),
                },
            };
        }

        let hinted = match kind {
            FailureKind::RateLimited => error.retry_after_hint().and_then(parse_retry_after),
            FailureKind::Transient | FailureKind::Permanent => None,
        };

        let after = hinted.unwrap_or_else(|| self.backoff_delay(attempt_count));

        debug!(
            attempt_count,
            delay_ms = after.as_millis(),
            using_retry_after = hinted.is_some(),
            "will retry"
        );

        RetryAction::Retry { after }
    }

    /// Calculates the backoff delay for the given number of retries already performed.
    ///
    /// Formula: `min(base_delay * multiplier^attempt_count, max_delay) + jitter`
    #[must_use]
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let exponent = i32::try_from(attempt_count).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let scaled = Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .unwrap_or(self.max_delay);

        scaled.min(self.max_delay) + self.calculate_jitter()
    }

    fn calculate_jitter(&self) -> Duration {
        let Some(max_jitter) = self.max_jitter else {
            return Duration::ZERO;
        };
        let max_ms = u64::try_from(max_jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Classifies a fetch error into a failure kind.
///
/// # HTTP Status Code Classification
///
/// | Status | Kind |
/// |--------|------|
/// | 429 | RateLimited |
/// | other 4xx | Permanent |
/// | 5xx | Transient |
/// | anything else | Permanent |
///
/// # Non-HTTP Errors
///
/// | Error | Kind |
/// |-------|------|
/// | Timeout, Network | Transient |
/// | Integrity, EmptyBody | Transient |
/// | Io, InvalidUrl, InvalidDestination | Permanent |
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureKind {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),

        DownloadError::Timeout { .. }
        | DownloadError::Network { .. }
        | DownloadError::Integrity { .. }
        | DownloadError::EmptyBody { .. } => FailureKind::Transient,

        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::InvalidDestination { .. } => FailureKind::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureKind {
    match status {
        429 => FailureKind::RateLimited,
        status if (400..500).contains(&status) => FailureKind::Permanent,
        status if (500..600).contains(&status) => FailureKind::Transient,
        // Unfollowed redirects and other oddities won't fix themselves
        _ => FailureKind::Permanent,
    }
}
