//! Progress UI (spinner) for download runs.

use std::sync::Arc;
use std::time::Duration;

use galleryfetch_core::{ProgressEvent, ProgressKind, ProgressSink, TracingSink};
use indicatif::{ProgressBar, ProgressStyle};
use url::Url;

/// Spinner driven by download manager events.
///
/// The task source is lazy, so the total is unknown; the spinner shows running
/// counts and the host currently being fetched.
pub(crate) struct SpinnerSink {
    spinner: ProgressBar,
}

impl SpinnerSink {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self { spinner }
    }

    pub(crate) fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressSink for SpinnerSink {
    fn emit(&self, event: &ProgressEvent) {
        if event.kind == ProgressKind::Failed {
            self.spinner
                .println(format!("failed: {}", failure_line(event)));
        }
        self.spinner.set_message(status_line(event));
    }
}

/// Chooses the progress sink for a run.
///
/// Returns the sink handed to the manager and, when a spinner is shown, the
/// spinner itself so the caller can clear it afterwards.
pub(crate) fn spawn_progress_ui(
    use_spinner: bool,
) -> (Arc<dyn ProgressSink>, Option<Arc<SpinnerSink>>) {
    if !use_spinner {
        return (Arc::new(TracingSink), None);
    }
    let spinner = Arc::new(SpinnerSink::new());
    (Arc::clone(&spinner) as Arc<dyn ProgressSink>, Some(spinner))
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(std::string::ToString::to_string))
        .unwrap_or_else(|| "source".to_string())
}

pub(crate) fn status_line(event: &ProgressEvent) -> String {
    let counts = event.counts;
    let activity = match event.kind {
        ProgressKind::Started if event.attempt > 1 => {
            format!("Downloading from {} (attempt {})...", host_of(&event.url), event.attempt)
        }
        ProgressKind::Started => format!("Downloading from {}...", host_of(&event.url)),
        ProgressKind::Retrying => format!("Waiting to retry {}...", host_of(&event.url)),
        ProgressKind::Succeeded | ProgressKind::Skipped | ProgressKind::Failed => {
            "Working...".to_string()
        }
    };
    format!(
        "[{} done, {} skipped, {} failed] {activity}",
        counts.downloaded, counts.skipped, counts.failed
    )
}

fn failure_line(event: &ProgressEvent) -> String {
    match &event.detail {
        Some(detail) => format!("{} ({detail})", event.url),
        None => event.url.clone(),
    }
}
