use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use galleryfetch_core::auth::StaticHeaders;
use galleryfetch_core::config::{DownloadOverrides, PresetOverrides};
use galleryfetch_core::{
    ArchiveLedger, AuthProvider, CookieFileAuth, DownloadConfig, DownloadManager, HttpClient,
    LedgerError, LedgerWriter, ManifestTaskSource, NoAuth, PresetConfig, PresetsFile, RateLimiter,
};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ProcessExit;
use crate::app::{exit_handler, progress_manager, terminal};
use crate::cli::Args;
use crate::output;

/// Preset name used in messages when no `--preset` is given.
const AD_HOC_PRESET: &str = "command-line";

pub(crate) async fn run_galleryfetch() -> Result<ProcessExit> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = terminal::resolve_default_log_level(args.quiet, args.verbose);
    terminal::init_tracing(default_level, terminal::no_color_env_requested());

    debug!(?args, "CLI arguments parsed");
    info!("Galleryfetch starting");

    let presets = load_presets(&args)?;

    if args.list_presets {
        for line in output::preset_listing_lines(&presets) {
            println!("{line}");
        }
        return Ok(ProcessExit::Success);
    }

    let download = resolve_download_config(&args, &presets)?;
    let preset = resolve_preset(&args, &presets)?;

    let Some(tasks_path) = args.tasks.as_deref() else {
        output::print_quick_start_guidance();
        return Ok(ProcessExit::Success);
    };

    if !args.output.exists() {
        tokio::fs::create_dir_all(&args.output)
            .await
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        info!(dir = %args.output.display(), "Created output directory");
    }

    let ledger = load_ledger(&args.output, args.reset_corrupt_archive).await?;
    info!(
        archived = ledger.len(),
        path = %ledger.path().display(),
        "Archive loaded"
    );

    let source = ManifestTaskSource::open(tasks_path, &args.output, &preset)
        .await
        .with_context(|| format!("failed to open task manifest {}", tasks_path.display()))?;
    let auth = build_auth(&args)?;

    let client = HttpClient::new(download.timeout()).context("failed to build HTTP client")?;
    let rate_limiter = if download.delay().is_zero() {
        debug!("rate limiting disabled");
        Arc::new(RateLimiter::disabled())
    } else {
        debug!(delay_secs = download.download_delay_seconds, "rate limiting enabled");
        Arc::new(RateLimiter::new(download.delay()))
    };

    let use_spinner = terminal::should_use_spinner(
        io::stderr().is_terminal(),
        args.quiet,
        terminal::is_dumb_terminal(),
    );
    let (progress, spinner) = progress_manager::spawn_progress_ui(use_spinner);

    let manager = DownloadManager::new(
        download.concurrent_downloads,
        download.retry_policy(),
        rate_limiter,
        client,
    )?
    .with_auth(auth)
    .with_progress(progress)
    .with_force_redownload(download.force_redownload);

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight downloads");
            cancel_signal.cancel();
        }
    });

    let writer = LedgerWriter::spawn(Arc::clone(&ledger));
    let result = manager
        .run(Box::new(source), writer.handle(), cancel)
        .await;

    if let Some(spinner) = spinner {
        spinner.finish();
    }
    writer.shutdown().await;

    let summary = result.context("download run aborted")?;
    output::print_completion_summary(&summary, ledger.len(), &args.output);

    if summary.was_cancelled {
        warn!(
            downloaded = summary.downloaded,
            "Interrupted. Run again to resume."
        );
    }

    Ok(exit_handler::determine_exit_outcome(&summary))
}

fn load_presets(args: &Args) -> Result<PresetsFile> {
    match &args.config {
        Some(path) => PresetsFile::load(path)
            .with_context(|| format!("failed to load presets file {}", path.display())),
        None => Ok(PresetsFile::default()),
    }
}

/// Precedence: CLI flag > presets file > built-in default.
fn resolve_download_config(args: &Args, presets: &PresetsFile) -> Result<DownloadConfig> {
    let overrides = DownloadOverrides {
        download_delay_seconds: args.delay,
        max_retries: args.max_retries.map(u32::from),
        timeout_seconds: args.timeout,
        concurrent_downloads: args.concurrency.map(usize::from),
        force_redownload: args.force,
    };
    let config = presets.download.clone().with_overrides(&overrides);
    config.validate().context("invalid download settings")?;
    Ok(config)
}

fn resolve_preset(args: &Args, presets: &PresetsFile) -> Result<PresetConfig> {
    let (name, base) = match &args.preset {
        Some(name) => (name.as_str(), presets.preset(name)?.clone()),
        None => (AD_HOC_PRESET, PresetConfig::default()),
    };
    let overrides = PresetOverrides {
        tags: args.tags.clone(),
        exclude_tags: args.exclude_tags.clone(),
        language: args.language.clone(),
        max_results: args
            .max_results
            .map(|value| usize::try_from(value).unwrap_or(usize::MAX)),
    };
    let preset = base.with_overrides(overrides);
    preset.validate(name)?;
    debug!(name, ?preset, "resolved preset");
    Ok(preset)
}

/// Loads the archive, moving a corrupt one aside only when asked to.
async fn load_ledger(output_dir: &Path, reset_corrupt: bool) -> Result<Arc<ArchiveLedger>> {
    let path = ArchiveLedger::path_for_output_dir(output_dir);
    match ArchiveLedger::load(&path).await {
        Ok(ledger) => Ok(Arc::new(ledger)),
        Err(LedgerError::Corrupt { .. }) if reset_corrupt => {
            let moved = ArchiveLedger::quarantine(&path)
                .await
                .context("failed to move the corrupt archive aside")?;
            warn!(moved_to = %moved.display(), "Corrupt archive moved aside, starting empty");
            Ok(Arc::new(ArchiveLedger::empty(path)))
        }
        Err(error @ LedgerError::Corrupt { .. }) => Err(anyhow::Error::new(error)
            .context("archive is corrupt; rerun with --reset-corrupt-archive to move it aside")),
        Err(error) => Err(anyhow::Error::new(error).context("failed to load archive")),
    }
}

fn build_auth(args: &Args) -> Result<Arc<dyn AuthProvider>> {
    let mut headers = HeaderMap::new();
    if let Some(agent) = &args.user_agent {
        let value = HeaderValue::from_str(agent)
            .with_context(|| format!("invalid --user-agent value {agent:?}"))?;
        headers.insert(USER_AGENT, value);
    }

    if let Some(path) = &args.cookies {
        let auth = CookieFileAuth::from_file(path)
            .with_context(|| format!("failed to load cookies from {}", path.display()))?
            .with_headers(headers);
        return Ok(Arc::new(auth));
    }
    if headers.is_empty() {
        Ok(Arc::new(NoAuth))
    } else {
        Ok(Arc::new(StaticHeaders::new(headers)))
    }
}
