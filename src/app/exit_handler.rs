//! Exit code logic for the galleryfetch process.
//!
//! Single responsibility: map a run summary to the process exit outcome.

use galleryfetch_core::DownloadSummary;

use crate::ProcessExit;

/// Determines the process exit outcome from a finished run.
///
/// A cancelled run is a failure so scripts notice it; tasks left over are
/// picked up by the next run.
pub(crate) fn determine_exit_outcome(summary: &DownloadSummary) -> ProcessExit {
    if summary.was_cancelled {
        ProcessExit::Failure
    } else if summary.failed == 0 {
        ProcessExit::Success
    } else if summary.downloaded > 0 || summary.skipped > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}
