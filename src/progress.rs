//! Structured progress events emitted by the download manager.
//!
//! The manager calls [`ProgressSink::emit`] from its workers; sinks must be
//! cheap and non-blocking. The binary drives an indicatif bar from these
//! events, tests usually collect them through a [`ChannelSink`].

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressKind {
    /// A fetch attempt is about to start (after the rate limiter grant).
    Started,
    /// The file is in place and recorded in the ledger.
    Succeeded,
    /// The URL was already in the ledger.
    Skipped,
    /// The task gave up permanently.
    Failed,
    /// An attempt failed and another will follow after a wait.
    Retrying,
}

impl ProgressKind {
    /// Lowercase event name (`started`, `succeeded`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running totals at the time of an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    /// Files downloaded so far.
    pub downloaded: u64,
    /// Tasks skipped as duplicates so far.
    pub skipped: u64,
    /// Tasks failed permanently so far.
    pub failed: u64,
    /// Retries performed so far.
    pub retries: u64,
}

/// One progress event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Event kind.
    pub kind: ProgressKind,
    /// Task URL.
    pub url: String,
    /// 1-based attempt number (0 for skips).
    pub attempt: u32,
    /// Error text, set on `Failed` and `Retrying` events.
    pub detail: Option<String>,
    /// Bytes written, for `Succeeded`.
    pub bytes: Option<u64>,
    /// Running totals.
    pub counts: ProgressCounts,
}

impl ProgressEvent {
    /// Creates an event without detail or byte count.
    #[must_use]
    pub fn new(
        kind: ProgressKind,
        url: impl Into<String>,
        attempt: u32,
        counts: ProgressCounts,
    ) -> Self {
        Self {
            kind,
            url: url.into(),
            attempt,
            detail: None,
            bytes: None,
            counts,
        }
    }

    /// Attaches an error description.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attaches the written byte count.
    #[must_use]
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    /// Handles one event. Must not block.
    fn emit(&self, event: &ProgressEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: &ProgressEvent) {
        let counts = event.counts;
        match event.kind {
            ProgressKind::Started => {
                debug!(url = %event.url, attempt = event.attempt, "fetch started");
            }
            ProgressKind::Succeeded => info!(
                url = %event.url,
                bytes = event.bytes.unwrap_or(0),
                downloaded = counts.downloaded,
                "downloaded"
            ),
            ProgressKind::Skipped => {
                debug!(url = %event.url, skipped = counts.skipped, "already archived");
            }
            ProgressKind::Retrying => warn!(
                url = %event.url,
                attempt = event.attempt,
                error = event.detail.as_deref().unwrap_or(""),
                "attempt failed, retrying"
            ),
            ProgressKind::Failed => warn!(
                url = %event.url,
                attempt = event.attempt,
                error = event.detail.as_deref().unwrap_or(""),
                failed = counts.failed,
                "download failed"
            ),
        }
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    /// Creates the sink and the receiving end.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: &ProgressEvent) {
        // A closed receiver only means nobody is watching anymore
        let _ = self.tx.send(event.clone());
    }
}
