//! CLI output formatting and display helpers.

use std::path::Path;

use galleryfetch_core::{DownloadSummary, PresetsFile};
use tracing::info;

/// Message when no task manifest was given.
pub const NO_TASKS_GUIDANCE: &str = "No task manifest provided. Pass one with --tasks.";

/// Example invocation.
pub const TASKS_EXAMPLE: &str =
    "Example: galleryfetch --config presets.json --preset daily --tasks galleries.jsonl -o ./archive";

/// Failures listed individually before the rest are summarized.
const MAX_LISTED_FAILURES: usize = 20;

/// Returns terminal width from COLUMNS, or 80 if unset/invalid.
pub fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|width| *width >= 20)
        .unwrap_or(80)
}

/// Truncates text to at most `width` chars, appending ellipsis if truncated.
pub fn truncate_to_width(text: &str, width: usize) -> String {
    let text_len = text.chars().count();
    if text_len <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    if width == 1 {
        return "…".to_string();
    }

    let mut output: String = text.chars().take(width - 1).collect();
    output.push('…');
    output
}

/// Prints quick-start guidance to stdout when there is nothing to do.
pub fn print_quick_start_guidance() {
    let width = terminal_width().min(100);
    println!("{}", truncate_to_width(NO_TASKS_GUIDANCE, width));
    println!("{}", truncate_to_width(TASKS_EXAMPLE, width));
}

/// Lines listing the presets of a presets file.
pub(crate) fn preset_listing_lines(presets: &PresetsFile) -> Vec<String> {
    if presets.presets.is_empty() {
        return vec!["No presets defined.".to_string()];
    }
    presets
        .presets
        .iter()
        .map(|(name, preset)| {
            let tags = if preset.tags.is_empty() {
                "any tags".to_string()
            } else {
                preset.tags.join(", ")
            };
            format!(
                "{name}: {tags} (max {}, template {})",
                preset.max_results, preset.output_template
            )
        })
        .collect()
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Renders the end-of-run summary. `archived` is the ledger size after the run.
pub(crate) fn summary_lines(
    summary: &DownloadSummary,
    archived: usize,
    width: usize,
) -> Vec<String> {
    let mut lines = vec![
        format!(
            "Downloaded {}, skipped {}, failed {} ({} retries, {}) in {:.1}s",
            summary.downloaded,
            summary.skipped,
            summary.failed,
            summary.retries,
            format_bytes(summary.bytes),
            summary.elapsed.as_secs_f64()
        ),
        format!("Total in archive: {archived}"),
    ];

    if summary.source_errors > 0 {
        lines.push(format!(
            "{} manifest entries could not be read",
            summary.source_errors
        ));
    }
    if summary.was_cancelled {
        lines.push(format!(
            "Interrupted ({} in flight). Run again to resume.",
            summary.cancelled
        ));
    }

    if !summary.failures.is_empty() {
        lines.push("Failed downloads:".to_string());
        for failure in summary.failures.iter().take(MAX_LISTED_FAILURES) {
            let line = format!("  {} - {}", failure.url, failure.reason);
            lines.push(truncate_to_width(&line, width));
        }
        let hidden = summary.failures.len().saturating_sub(MAX_LISTED_FAILURES);
        if hidden > 0 {
            lines.push(format!("  ... and {hidden} more"));
        }
    }
    lines
}

pub(crate) fn print_completion_summary(
    summary: &DownloadSummary,
    archived: usize,
    output_dir: &Path,
) {
    info!(
        downloaded = summary.downloaded,
        skipped = summary.skipped,
        failed = summary.failed,
        archived,
        output_dir = %output_dir.display(),
        "Download Summary"
    );
    for line in summary_lines(summary, archived, terminal_width()) {
        println!("{line}");
    }
}
