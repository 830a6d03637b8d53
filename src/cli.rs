//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download tagged image galleries into a deduplicated local archive.
///
/// Galleryfetch reads a task manifest, filters it through a named preset, and
/// downloads each image at a polite pace, skipping anything already recorded in
/// the output directory's archive.
#[derive(Parser, Debug)]
#[command(name = "galleryfetch")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Presets file (JSON) with download settings and named presets
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Preset to apply from the presets file
    #[arg(short, long)]
    pub preset: Option<String>,

    /// List the presets defined in the presets file and exit
    #[arg(long)]
    pub list_presets: bool,

    /// Task manifest (JSON lines of galleries or single images)
    #[arg(short, long, value_name = "FILE")]
    pub tasks: Option<PathBuf>,

    /// Output directory (holds the downloads and the archive file)
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Netscape-format cookies file attached to matching requests
    #[arg(long, value_name = "FILE")]
    pub cookies: Option<PathBuf>,

    /// User-Agent header sent with every request
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Required gallery tags (comma-separated), replacing the preset's
    #[arg(long, value_delimiter = ',')]
    pub tags: Option<Vec<String>>,

    /// Excluded gallery tags (comma-separated), replacing the preset's
    #[arg(long, value_delimiter = ',')]
    pub exclude_tags: Option<Vec<String>>,

    /// Only accept galleries in this language
    #[arg(long)]
    pub language: Option<String>,

    /// Maximum number of galleries to accept
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_results: Option<u32>,

    /// Minimum seconds between request starts (0 disables pacing)
    #[arg(short = 'd', long, value_parser = parse_non_negative_seconds)]
    pub delay: Option<f64>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Per-request timeout in seconds
    #[arg(long, value_parser = parse_positive_seconds)]
    pub timeout: Option<f64>,

    /// Download even when the archive already holds the URL
    #[arg(short, long)]
    pub force: bool,

    /// Move a corrupt archive aside and start with an empty one
    #[arg(long)]
    pub reset_corrupt_archive: bool,
}

fn parse_seconds(value: &str) -> Result<f64, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("'{value}' is not a number of seconds"))?;
    if seconds.is_finite() {
        Ok(seconds)
    } else {
        Err(format!("'{value}' is not a finite number of seconds"))
    }
}

fn parse_non_negative_seconds(value: &str) -> Result<f64, String> {
    let seconds = parse_seconds(value)?;
    if seconds < 0.0 {
        return Err(format!("{seconds} must be 0 or greater"));
    }
    Ok(seconds)
}

fn parse_positive_seconds(value: &str) -> Result<f64, String> {
    let seconds = parse_seconds(value)?;
    if seconds <= 0.0 {
        return Err(format!("{seconds} must be greater than 0"));
    }
    Ok(seconds)
}
