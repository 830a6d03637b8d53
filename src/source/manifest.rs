//! JSON-lines manifest task source.
//!
//! Each non-blank line that does not start with `#` is one JSON object, in one
//! of two forms:
//!
//! ```text
//! {"gallery": "Title", "release_date": "2024-01-31", "tags": ["a"], "language": "english",
//!  "images": ["https://img.example/1/1.jpg", "https://img.example/1/2.jpg"]}
//! {"url": "https://img.example/x.png", "destination": "misc/x.png", "metadata": {"k": 1}}
//! ```
//!
//! Gallery entries go through the preset filters (required tags, excluded
//! tags, language, `max_results`) and expand into one task per image, with
//! destinations rendered from the preset's output template. Single-image
//! entries bypass the filters. An explicit `destination` must be a relative
//! path that stays inside the output directory.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info, instrument};

use super::{SourceError, TaskSource};
use crate::config::PresetConfig;
use crate::download::{DownloadTask, Metadata};
use crate::template::{
    PathTemplate, TemplateError, TemplateValues, filename_from_url, sanitize_filename,
};

#[derive(Debug, Deserialize)]
struct GalleryEntry {
    gallery: String,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    language: Option<String>,
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    url: String,
    #[serde(default)]
    destination: Option<PathBuf>,
    #[serde(default)]
    metadata: Metadata,
}

/// Counters kept while reading a manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestStats {
    /// Galleries that passed the filters.
    pub galleries_accepted: usize,
    /// Galleries dropped by tag or language filters.
    pub galleries_filtered: usize,
    /// Galleries dropped because `max_results` was reached.
    pub galleries_over_limit: usize,
    /// Tasks handed out.
    pub tasks_emitted: usize,
}

struct GalleryFilter {
    tags: Vec<String>,
    exclude_tags: Vec<String>,
    language: Option<String>,
    max_results: usize,
}

impl GalleryFilter {
    fn from_preset(preset: &PresetConfig) -> Self {
        let lower = |tags: &[String]| -> Vec<String> {
            tags.iter().map(|t| t.trim().to_lowercase()).collect()
        };
        Self {
            tags: lower(&preset.tags),
            exclude_tags: lower(&preset.exclude_tags),
            language: preset.language.as_ref().map(|l| l.trim().to_lowercase()),
            max_results: preset.max_results,
        }
    }

    fn accepts(&self, entry: &GalleryEntry) -> bool {
        let tags: Vec<String> = entry.tags.iter().map(|t| t.trim().to_lowercase()).collect();
        if !self.tags.iter().all(|required| tags.contains(required)) {
            return false;
        }
        if self.exclude_tags.iter().any(|excluded| tags.contains(excluded)) {
            return false;
        }
        match &self.language {
            Some(wanted) => entry
                .language
                .as_ref()
                .is_some_and(|language| language.trim().eq_ignore_ascii_case(wanted)),
            None => true,
        }
    }
}

type LineReader = Lines<Box<dyn AsyncBufRead + Send + Unpin>>;

/// Lazily reads a JSON-lines manifest.
pub struct ManifestTaskSource {
    lines: LineReader,
    origin: PathBuf,
    line_number: usize,
    output_dir: PathBuf,
    template: PathTemplate,
    filter: GalleryFilter,
    pending: VecDeque<DownloadTask>,
    stats: ManifestStats,
    finished: bool,
}

impl std::fmt::Debug for ManifestTaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestTaskSource")
            .field("origin", &self.origin)
            .field("line_number", &self.line_number)
            .field("output_dir", &self.output_dir)
            .field("pending", &self.pending.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ManifestTaskSource {
    /// Opens a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Io`] if the file cannot be opened and
    /// [`SourceError::InvalidEntry`] if the preset's template is malformed.
    #[instrument(skip(output_dir, preset), fields(path = %path.display()))]
    pub async fn open(
        path: &Path,
        output_dir: impl Into<PathBuf>,
        preset: &PresetConfig,
    ) -> Result<Self, SourceError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| SourceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        info!("reading task manifest");
        Self::from_reader(BufReader::new(file), path, output_dir, preset)
    }

    /// Reads a manifest from any buffered async reader.
    ///
    /// `origin` only labels errors.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidEntry`] (line 0) if the preset's template
    /// is malformed.
    pub fn from_reader<R>(
        reader: R,
        origin: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        preset: &PresetConfig,
    ) -> Result<Self, SourceError>
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        let template = preset.template().map_err(|e: TemplateError| SourceError::InvalidEntry {
            line: 0,
            reason: e.to_string(),
        })?;
        let boxed: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(reader);
        Ok(Self {
            lines: boxed.lines(),
            origin: origin.into(),
            line_number: 0,
            output_dir: output_dir.into(),
            template,
            filter: GalleryFilter::from_preset(preset),
            pending: VecDeque::new(),
            stats: ManifestStats::default(),
            finished: false,
        })
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> ManifestStats {
        self.stats
    }

    fn parse_line(&mut self, line: &str) -> Result<(), SourceError> {
        let line_no = self.line_number;
        let parse_error = |source: serde_json::Error| SourceError::Parse {
            line: line_no,
            source,
        };
        let value: serde_json::Value = serde_json::from_str(line).map_err(parse_error)?;

        let Some(object) = value.as_object() else {
            return Err(SourceError::InvalidEntry {
                line: line_no,
                reason: "entry is not a JSON object".to_string(),
            });
        };
        let is_gallery = object.contains_key("images");
        let is_image = object.contains_key("url");

        if is_gallery {
            let entry: GalleryEntry = serde_json::from_value(value).map_err(parse_error)?;
            self.expand_gallery(entry);
            Ok(())
        } else if is_image {
            let entry: ImageEntry = serde_json::from_value(value).map_err(parse_error)?;
            let task = self.image_task(entry, line_no)?;
            self.pending.push_back(task);
            Ok(())
        } else {
            Err(SourceError::InvalidEntry {
                line: line_no,
                reason: "entry has neither \"images\" nor \"url\"".to_string(),
            })
        }
    }

    fn expand_gallery(&mut self, entry: GalleryEntry) {
        if !self.filter.accepts(&entry) {
            debug!(gallery = %entry.gallery, "gallery filtered out");
            self.stats.galleries_filtered += 1;
            return;
        }
        if self.stats.galleries_accepted >= self.filter.max_results {
            debug!(gallery = %entry.gallery, "max_results reached, skipping gallery");
            self.stats.galleries_over_limit += 1;
            return;
        }
        self.stats.galleries_accepted += 1;

        for (position, url) in entry.images.iter().enumerate() {
            let index = position + 1;
            let (stem, ext) = filename_from_url(url);
            let relative = self.template.render(&TemplateValues {
                title: &entry.gallery,
                release_date: entry.release_date.as_deref(),
                filename: &stem,
                ext: ext.as_deref(),
                index,
            });

            let mut task = DownloadTask::new(url.clone(), self.output_dir.join(relative))
                .with_metadata("gallery", entry.gallery.as_str())
                .with_metadata("index", i64::try_from(index).unwrap_or(i64::MAX));
            if let Some(date) = &entry.release_date {
                task = task.with_metadata("release_date", date.as_str());
            }
            self.pending.push_back(task);
        }
    }

    fn image_task(&self, entry: ImageEntry, line: usize) -> Result<DownloadTask, SourceError> {
        let destination = match entry.destination {
            Some(path) => self.output_dir.join(checked_destination(path, line)?),
            None => {
                let (stem, ext) = filename_from_url(&entry.url);
                let name = match ext {
                    Some(ext) => {
                        format!("{}.{}", sanitize_filename(&stem), sanitize_filename(&ext))
                    }
                    None => sanitize_filename(&stem),
                };
                self.output_dir.join(name)
            }
        };
        Ok(DownloadTask {
            url: entry.url,
            destination,
            metadata: entry.metadata,
        })
    }
}

/// Accepts only relative paths made of plain components, with a file name.
fn checked_destination(path: PathBuf, line: usize) -> Result<PathBuf, SourceError> {
    let mut has_name = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SourceError::InvalidEntry {
                    line,
                    reason: format!(
                        "destination {} must stay inside the output directory",
                        path.display()
                    ),
                });
            }
        }
    }
    if !has_name {
        return Err(SourceError::InvalidEntry {
            line,
            reason: "destination is empty".to_string(),
        });
    }
    Ok(path)
}

#[async_trait]
impl TaskSource for ManifestTaskSource {
    async fn next_task(&mut self) -> Option<Result<DownloadTask, SourceError>> {
        loop {
            if let Some(task) = self.pending.pop_front() {
                self.stats.tasks_emitted += 1;
                return Some(Ok(task));
            }

            if self.finished {
                return None;
            }

            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.finished = true;
                    info!(
                        accepted = self.stats.galleries_accepted,
                        filtered = self.stats.galleries_filtered,
                        over_limit = self.stats.galleries_over_limit,
                        tasks = self.stats.tasks_emitted,
                        "manifest exhausted"
                    );
                    return None;
                }
                Err(source) => {
                    // A broken stream does not recover; report once and stop
                    self.finished = true;
                    return Some(Err(SourceError::Io {
                        path: self.origin.clone(),
                        source,
                    }));
                }
            };
            self.line_number += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Err(error) = self.parse_line(trimmed) {
                return Some(Err(error));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::MetadataValue;

    const MANIFEST: &str = r#"
# galleries
{"gallery": "First: One", "release_date": "2024-01-31", "tags": ["Color", "landscape"], "language": "English", "images": ["https://img.example/1/001.jpg", "https://img.example/1/002.png?x=1"]}
{"gallery": "Sketchy", "tags": ["landscape", "sketch"], "language": "english", "images": ["https://img.example/2/001.jpg"]}
{"gallery": "Wrong language", "tags": ["landscape"], "language": "french", "images": ["https://img.example/3/001.jpg"]}

{"url": "https://img.example/loose/cover.webp", "metadata": {"note": "loose", "n": 2}}
{"url": "https://img.example/loose/x.jpg", "destination": "misc/x.jpg"}
{"gallery": "Second", "tags": ["landscape"], "language": "english", "images": ["https://img.example/4/a.jpg"]}
{"gallery": "Third", "tags": ["landscape"], "language": "english", "images": ["https://img.example/5/a.jpg"]}
"#;

    fn preset() -> PresetConfig {
        PresetConfig {
            tags: vec!["landscape".into()],
            exclude_tags: vec!["sketch".into()],
            language: Some("english".into()),
            max_results: 2,
            output_template: "{release_date}/{title}/{index}-{filename}.{ext}".into(),
        }
    }

    async fn collect(source: &mut ManifestTaskSource) -> Vec<Result<DownloadTask, SourceError>> {
        let mut out = Vec::new();
        while let Some(item) = source.next_task().await {
            out.push(item);
        }
        out
    }

    fn source(text: &'static str, preset: &PresetConfig) -> ManifestTaskSource {
        ManifestTaskSource::from_reader(text.as_bytes(), "<test>", "/out", preset).unwrap()
    }

    #[tokio::test]
    async fn test_manifest_filters_and_expands() {
        let mut source = source(MANIFEST, &preset());
        let tasks: Vec<DownloadTask> = collect(&mut source)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        let urls: Vec<&str> = tasks.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(
            urls,
            [
                "https://img.example/1/001.jpg",
                "https://img.example/1/002.png?x=1",
                "https://img.example/loose/cover.webp",
                "https://img.example/loose/x.jpg",
                "https://img.example/4/a.jpg",
            ]
        );

        assert_eq!(
            tasks[1].destination,
            PathBuf::from("/out/2024-01-31/First_ One/2-002.png")
        );
        assert_eq!(tasks[1].metadata["gallery"].to_string(), "First: One");
        assert_eq!(tasks[1].metadata["index"], MetadataValue::Integer(2));
        assert_eq!(tasks[2].destination, PathBuf::from("/out/cover.webp"));
        assert_eq!(tasks[2].metadata["n"], MetadataValue::Integer(2));
        assert_eq!(tasks[3].destination, PathBuf::from("/out/misc/x.jpg"));

        let stats = source.stats();
        assert_eq!(stats.galleries_accepted, 2);
        assert_eq!(stats.galleries_filtered, 2);
        assert_eq!(stats.galleries_over_limit, 1);
        assert_eq!(stats.tasks_emitted, 5);
    }

    #[tokio::test]
    async fn test_manifest_reports_bad_lines_and_continues() {
        let text = "not json\n[1, 2]\n{\"title\": \"x\"}\n{\"images\": []}\n{\"url\": \"https://img.example/ok.jpg\"}\n";
        let mut source = source(text, &PresetConfig::default());
        let items = collect(&mut source).await;

        assert_eq!(items.len(), 5);
        assert!(matches!(items[0], Err(SourceError::Parse { line: 1, .. })));
        assert!(matches!(items[1], Err(SourceError::InvalidEntry { line: 2, .. })));
        assert!(matches!(items[2], Err(SourceError::InvalidEntry { line: 3, .. })));
        assert!(matches!(items[3], Err(SourceError::Parse { line: 4, .. })));
        assert_eq!(items[4].as_ref().unwrap().url, "https://img.example/ok.jpg");
    }

    #[tokio::test]
    async fn test_manifest_rejects_destinations_outside_output_dir() {
        let text = concat!(
            "{\"url\": \"https://img.example/a.jpg\", \"destination\": \"/etc/a.jpg\"}\n",
            "{\"url\": \"https://img.example/b.jpg\", \"destination\": \"misc/../../b.jpg\"}\n",
            "{\"url\": \"https://img.example/c.jpg\", \"destination\": \".\"}\n",
            "{\"url\": \"https://img.example/d.jpg\", \"destination\": \"./misc/d.jpg\"}\n",
        );
        let mut source = source(text, &PresetConfig::default());
        let items = collect(&mut source).await;

        assert_eq!(items.len(), 4);
        for (item, line) in items.iter().take(3).zip(1..) {
            assert!(
                matches!(item, Err(SourceError::InvalidEntry { line: l, .. }) if *l == line),
                "line {line}: {item:?}"
            );
        }
        assert_eq!(
            items[3].as_ref().unwrap().destination,
            PathBuf::from("/out/./misc/d.jpg")
        );
    }

    #[tokio::test]
    async fn test_manifest_is_lazy() {
        let mut source = source(MANIFEST, &preset());
        let first = source.next_task().await.unwrap().unwrap();
        assert_eq!(first.url, "https://img.example/1/001.jpg");
        assert_eq!(source.stats().galleries_accepted, 1);
        assert_eq!(source.stats().galleries_filtered, 0);
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let result = ManifestTaskSource::open(
            Path::new("/nonexistent/tasks.jsonl"),
            "/out",
            &PresetConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(SourceError::Io { .. })));
    }
}
