//! Presets file loading, validation and CLI override merging.
//!
//! The presets file is JSON with the global download settings at the top
//! level and named search presets under `presets`:
//!
//! ```json
//! {
//!   "download_delay_seconds": 30,
//!   "max_retries": 3,
//!   "timeout_seconds": 30,
//!   "concurrent_downloads": 2,
//!   "presets": {
//!     "landscapes": {
//!       "tags": ["landscape"],
//!       "exclude_tags": ["sketch"],
//!       "language": "english",
//!       "max_results": 50,
//!       "output_template": "{title}/{filename}.{ext}"
//!     }
//!   }
//! }
//! ```
//!
//! Every field is optional. Precedence is CLI flag > file > built-in default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::download::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT, MAX_CONCURRENCY, RetryPolicy,
};
use crate::template::{DEFAULT_OUTPUT_TEMPLATE, PathTemplate, TemplateError};

/// Default pause between request starts.
pub const DEFAULT_DELAY_SECONDS: f64 = 30.0;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;

/// Default cap on galleries taken per preset.
pub const DEFAULT_MAX_RESULTS: usize = 50;

/// Largest accepted retry budget.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Largest accepted delay or timeout, in seconds.
const MAX_SECONDS: f64 = 3600.0;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Config path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected {expected}")]
    Invalid {
        /// Field name.
        field: String,
        /// Offending value.
        value: String,
        /// Accepted range.
        expected: &'static str,
    },

    /// The requested preset does not exist.
    #[error("unknown preset \"{name}\" (available: {available})")]
    UnknownPreset {
        /// Requested name.
        name: String,
        /// Comma-separated known names.
        available: String,
    },

    /// A preset's output template is malformed.
    #[error("preset \"{preset}\": {source}")]
    Template {
        /// Preset name.
        preset: String,
        /// Template error.
        #[source]
        source: TemplateError,
    },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, value: impl ToString, expected: &'static str) -> Self {
        Self::Invalid {
            field: field.into(),
            value: value.to_string(),
            expected,
        }
    }
}

/// Global download settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Minimum spacing between request starts, fractional seconds (0 disables).
    pub download_delay_seconds: f64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Per-request timeout, fractional seconds.
    pub timeout_seconds: f64,
    /// Worker count.
    pub concurrent_downloads: usize,
    /// Fetch even when the URL is already archived.
    pub force_redownload: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_delay_seconds: DEFAULT_DELAY_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            concurrent_downloads: DEFAULT_CONCURRENCY,
            force_redownload: false,
        }
    }
}

/// CLI-provided values that replace file settings when present.
#[derive(Debug, Clone, Default)]
pub struct DownloadOverrides {
    /// `--delay`
    pub download_delay_seconds: Option<f64>,
    /// `--max-retries`
    pub max_retries: Option<u32>,
    /// `--timeout`
    pub timeout_seconds: Option<f64>,
    /// `--concurrency`
    pub concurrent_downloads: Option<usize>,
    /// `--force`; only ever turns forcing on.
    pub force_redownload: bool,
}

impl DownloadConfig {
    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrent_downloads) {
            return Err(ConfigError::invalid(
                "concurrent_downloads",
                self.concurrent_downloads,
                "range 1..=100",
            ));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::invalid(
                "max_retries",
                self.max_retries,
                "range 0..=10",
            ));
        }
        if !(self.download_delay_seconds.is_finite()
            && (0.0..=MAX_SECONDS).contains(&self.download_delay_seconds))
        {
            return Err(ConfigError::invalid(
                "download_delay_seconds",
                self.download_delay_seconds,
                "range 0..=3600 seconds",
            ));
        }
        if !(self.timeout_seconds.is_finite()
            && self.timeout_seconds > 0.0
            && self.timeout_seconds <= MAX_SECONDS)
        {
            return Err(ConfigError::invalid(
                "timeout_seconds",
                self.timeout_seconds,
                "a value above 0 and at most 3600 seconds",
            ));
        }
        Ok(())
    }

    /// Applies CLI overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &DownloadOverrides) -> Self {
        if let Some(delay) = overrides.download_delay_seconds {
            self.download_delay_seconds = delay;
        }
        if let Some(retries) = overrides.max_retries {
            self.max_retries = retries;
        }
        if let Some(timeout) = overrides.timeout_seconds {
            self.timeout_seconds = timeout;
        }
        if let Some(concurrency) = overrides.concurrent_downloads {
            self.concurrent_downloads = concurrency;
        }
        self.force_redownload |= overrides.force_redownload;
        self
    }

    /// Minimum inter-request interval.
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.download_delay_seconds).unwrap_or(Duration::ZERO)
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds).unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Retry policy with the configured budget and default backoff.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_retries(self.max_retries)
    }
}

/// A named search preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetConfig {
    /// Galleries must carry all of these tags.
    pub tags: Vec<String>,
    /// Galleries carrying any of these tags are dropped.
    pub exclude_tags: Vec<String>,
    /// Only galleries in this language (case-insensitive) are kept.
    pub language: Option<String>,
    /// Maximum number of galleries taken.
    pub max_results: usize,
    /// Destination layout relative to the output directory.
    pub output_template: String,
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            exclude_tags: Vec::new(),
            language: None,
            max_results: DEFAULT_MAX_RESULTS,
            output_template: DEFAULT_OUTPUT_TEMPLATE.to_string(),
        }
    }
}

/// CLI-provided preset values that replace the preset's when present.
#[derive(Debug, Clone, Default)]
pub struct PresetOverrides {
    /// `--tags`
    pub tags: Option<Vec<String>>,
    /// `--exclude-tags`
    pub exclude_tags: Option<Vec<String>>,
    /// `--language`
    pub language: Option<String>,
    /// `--max-results`
    pub max_results: Option<usize>,
}

impl PresetConfig {
    /// Applies CLI overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: PresetOverrides) -> Self {
        if let Some(tags) = overrides.tags {
            self.tags = tags;
        }
        if let Some(exclude) = overrides.exclude_tags {
            self.exclude_tags = exclude;
        }
        if overrides.language.is_some() {
            self.language = overrides.language;
        }
        if let Some(max_results) = overrides.max_results {
            self.max_results = max_results;
        }
        self
    }

    /// Parses the output template.
    ///
    /// # Errors
    ///
    /// Returns the template parse error.
    pub fn template(&self) -> Result<PathTemplate, TemplateError> {
        PathTemplate::parse(&self.output_template)
    }

    /// Checks `max_results` and the template.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the preset.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_results == 0 {
            return Err(ConfigError::invalid(
                format!("presets.{name}.max_results"),
                0,
                "at least 1",
            ));
        }
        self.template().map_err(|source| ConfigError::Template {
            preset: name.to_string(),
            source,
        })?;
        Ok(())
    }
}

/// Contents of the presets file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetsFile {
    /// Global download settings.
    #[serde(flatten)]
    pub download: DownloadConfig,
    /// Named presets.
    #[serde(default)]
    pub presets: BTreeMap<String, PresetConfig>,
}

impl PresetsFile {
    /// Loads and validates a presets file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`] or a validation error.
    #[instrument(fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        file.validate()?;
        debug!(presets = file.presets.len(), "loaded presets file");
        Ok(file)
    }

    /// Validates global settings and every preset.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.download.validate()?;
        for (name, preset) in &self.presets {
            preset.validate(name)?;
        }
        Ok(())
    }

    /// Looks up a preset by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPreset`] listing the known names.
    pub fn preset(&self, name: &str) -> Result<&PresetConfig, ConfigError> {
        self.presets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPreset {
                name: name.to_string(),
                available: self.preset_names().collect::<Vec<_>>().join(", "),
            })
    }

    /// Preset names in sorted order.
    pub fn preset_names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }
}
