//! Destination path templating.
//!
//! Templates are relative paths with `{placeholder}` fields:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{title}` | Gallery title, sanitized |
//! | `{release_date}` | Gallery release date, today (`YYYY-MM-DD`) when unknown |
//! | `{filename}` | Image file stem taken from its URL, sanitized |
//! | `{ext}` | Image extension from its URL, `jpg` when missing |
//! | `{index}` | 1-based position of the image in its gallery |
//!
//! `{{` and `}}` produce literal braces. Templates are parsed once and
//! rendered per image.

use std::path::PathBuf;

use thiserror::Error;

/// Default layout: one directory per gallery.
pub const DEFAULT_OUTPUT_TEMPLATE: &str = "{title}/{filename}.{ext}";

/// Extension used when the URL has none.
pub const DEFAULT_EXTENSION: &str = "jpg";

/// Longest file name component produced by sanitization, in bytes.
const MAX_COMPONENT_BYTES: usize = 255;

/// Errors raised while parsing a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A `{name}` field that is not a known placeholder.
    #[error("unknown placeholder {{{name}}} in template \"{template}\"")]
    UnknownPlaceholder {
        /// Placeholder name.
        name: String,
        /// Full template text.
        template: String,
    },

    /// An opening or closing brace without its partner.
    #[error("unbalanced brace at byte {position} in template \"{template}\"")]
    UnbalancedBrace {
        /// Byte offset of the offending brace.
        position: usize,
        /// Full template text.
        template: String,
    },

    /// The template is empty.
    #[error("output template is empty")]
    Empty,

    /// The template is absolute or climbs out with `..`.
    #[error("output template \"{template}\" must stay inside the output directory")]
    EscapesOutputDir {
        /// Full template text.
        template: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    ReleaseDate,
    Filename,
    Ext,
    Index,
}

impl Field {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "title" => Some(Self::Title),
            "release_date" => Some(Self::ReleaseDate),
            "filename" => Some(Self::Filename),
            "ext" => Some(Self::Ext),
            "index" => Some(Self::Index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Values substituted into a template for one image.
#[derive(Debug, Clone, Default)]
pub struct TemplateValues<'a> {
    /// Gallery title.
    pub title: &'a str,
    /// Release date, if the source knows it.
    pub release_date: Option<&'a str>,
    /// File stem.
    pub filename: &'a str,
    /// Extension without the dot.
    pub ext: Option<&'a str>,
    /// 1-based image position.
    pub index: usize,
}

/// A parsed output template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parses a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] for empty templates, unknown placeholders,
    /// unbalanced braces, and templates that leave the output directory.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        if template.trim().is_empty() {
            return Err(TemplateError::Empty);
        }
        // Field values are sanitized, so only literal text can do this
        let escapes = template.starts_with(['/', '\\'])
            || template.split(['/', '\\']).any(|part| part == "..")
            || template.as_bytes().get(1) == Some(&b':');
        if escapes {
            return Err(TemplateError::EscapesOutputDir {
                template: template.to_string(),
            });
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((position, c)) = chars.next() {
            match c {
                '{' if chars.peek().is_some_and(|&(_, next)| next == '{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().is_some_and(|&(_, next)| next == '}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, inner) in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        name.push(inner);
                    }
                    if !closed {
                        return Err(TemplateError::UnbalancedBrace {
                            position,
                            template: template.to_string(),
                        });
                    }
                    let field = Field::from_name(&name).ok_or_else(|| {
                        TemplateError::UnknownPlaceholder {
                            name: name.clone(),
                            template: template.to_string(),
                        }
                    })?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(field));
                }
                '}' => {
                    return Err(TemplateError::UnbalancedBrace {
                        position,
                        template: template.to_string(),
                    });
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    /// Template text as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Renders the template into a relative path.
    #[must_use]
    pub fn render(&self, values: &TemplateValues<'_>) -> PathBuf {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(Field::Title) => out.push_str(&sanitize_filename(values.title)),
                Segment::Field(Field::ReleaseDate) => {
                    let date = values.release_date.map_or_else(today, sanitize_filename);
                    out.push_str(&date);
                }
                Segment::Field(Field::Filename) => {
                    out.push_str(&sanitize_filename(values.filename));
                }
                Segment::Field(Field::Ext) => {
                    let ext = values
                        .ext
                        .filter(|ext| !ext.is_empty())
                        .unwrap_or(DEFAULT_EXTENSION);
                    out.push_str(&sanitize_filename(ext));
                }
                Segment::Field(Field::Index) => out.push_str(&values.index.to_string()),
            }
        }
        PathBuf::from(out)
    }
}

impl Default for PathTemplate {
    fn default() -> Self {
        Self {
            raw: DEFAULT_OUTPUT_TEMPLATE.to_string(),
            segments: vec![
                Segment::Field(Field::Title),
                Segment::Literal("/".to_string()),
                Segment::Field(Field::Filename),
                Segment::Literal(".".to_string()),
                Segment::Field(Field::Ext),
            ],
        }
    }
}

fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Makes a single path component filesystem safe.
///
/// Replaces `<>:"/\|?*` and control characters with `_`, strips trailing
/// dots and spaces, truncates to 255 bytes, and falls back to `file`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let mut trimmed = replaced.trim_end_matches(['.', ' ']).to_string();
    if trimmed.len() > MAX_COMPONENT_BYTES {
        let mut cut = MAX_COMPONENT_BYTES;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        trimmed.truncate(cut);
    }

    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed
    }
}

/// Splits the last URL path segment into a decoded stem and extension.
///
/// The query and fragment are ignored; a URL without a usable last segment
/// yields the stem `image`.
#[must_use]
pub fn filename_from_url(url: &str) -> (String, Option<String>) {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    let last = after_scheme
        .split_once('/')
        .and_then(|(_, path)| path.rsplit('/').next())
        .unwrap_or("");
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());

    if decoded.is_empty() {
        return ("image".to_string(), None);
    }

    match decoded.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem.to_string(), Some(ext.to_ascii_lowercase()))
        }
        _ => (decoded, None),
    }
}
