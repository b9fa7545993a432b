//! Core domain model for the Omeka Classic to Omeka S bridge.

use std::fmt;

use indexmap::IndexMap;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "omb-core";

pub const DUBLIN_CORE_SET: &str = "Dublin Core";
pub const DCTERMS_PREFIX: &str = "dcterms:";
pub const IDENTIFIER_KEY: &str = "dcterms:identifier";
pub const DEFAULT_LANGUAGE: &str = "en";

/// Upper bound on the number of IDs one ID list may expand to.
pub const MAX_IDS_PER_RUN: u64 = 100_000;

/// Named reference as the legacy API nests it (`{"name": ...}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    #[serde(default)]
    pub name: Option<String>,
}

/// One (element-set, element, text) triple from a legacy item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementText {
    #[serde(default)]
    pub element_set: Option<NamedRef>,
    #[serde(default)]
    pub element: Option<NamedRef>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ElementText {
    pub fn new(element_set: &str, element: &str, text: &str) -> Self {
        Self {
            element_set: Some(NamedRef {
                name: Some(element_set.to_string()),
            }),
            element: Some(NamedRef {
                name: Some(element.to_string()),
            }),
            text: Some(text.to_string()),
        }
    }

    pub fn element_set_name(&self) -> Option<&str> {
        self.element_set.as_ref().and_then(|s| s.name.as_deref())
    }

    pub fn element_name(&self) -> Option<&str> {
        self.element.as_ref().and_then(|e| e.name.as_deref())
    }
}

/// A legacy file attachment, normalized from the two shapes the source emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawFileReference")]
pub enum FileReference {
    Structured { original_url: String },
    RawUrl(String),
    Unusable,
}

impl FileReference {
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Structured { original_url } => Some(original_url),
            Self::RawUrl(url) => Some(url),
            Self::Unusable => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileUrls {
    #[serde(default)]
    original: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawFileReference {
    Url(String),
    Record {
        #[serde(default)]
        file_urls: Option<FileUrls>,
        #[serde(default)]
        file: Option<String>,
    },
    Other(IgnoredAny),
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

impl From<RawFileReference> for FileReference {
    fn from(raw: RawFileReference) -> Self {
        match raw {
            RawFileReference::Url(url) if !url.is_empty() => Self::RawUrl(url),
            RawFileReference::Record { file_urls, file } => {
                match non_empty(file_urls.and_then(|u| u.original)).or_else(|| non_empty(file)) {
                    Some(original_url) => Self::Structured { original_url },
                    None => Self::Unusable,
                }
            }
            _ => Self::Unusable,
        }
    }
}

fn file_list_or_empty<'de, D>(deserializer: D) -> Result<Vec<FileReference>, D::Error>
where
    D: Deserializer<'de>,
{
    // Omeka Classic reports `files` as a `{count, url}` link object, not a list.
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(entries) => Ok(entries
            .into_iter()
            .map(|entry| serde_json::from_value(entry).unwrap_or(FileReference::Unusable))
            .collect()),
        _ => Ok(Vec::new()),
    }
}

/// Item record as returned by `GET {source}/items/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyItem {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub element_texts: Vec<ElementText>,
    #[serde(default, deserialize_with = "file_list_or_empty")]
    pub files: Vec<FileReference>,
    #[serde(default)]
    pub added: Option<String>,
}

impl LegacyItem {
    /// Flat list of file URLs in source order; unusable references are dropped.
    pub fn file_urls(&self) -> Vec<String> {
        self.files
            .iter()
            .filter_map(|f| f.url().map(ToString::to_string))
            .collect()
    }
}

/// A single literal value in a destination property bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    #[serde(rename = "@value")]
    pub value: Option<String>,
    #[serde(rename = "@language", default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl PropertyValue {
    pub fn literal(value: Option<String>) -> Self {
        Self {
            value,
            language: default_language(),
        }
    }
}

/// Destination metadata: namespaced property key to ordered values.
///
/// Keys keep first-insertion order, so the bag serializes in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBag(IndexMap<String, Vec<PropertyValue>>);

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.0.entry(key.into()).or_default().push(value);
    }

    pub fn get(&self, key: &str) -> Option<&[PropertyValue]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn first_value(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|values| values.first())
            .and_then(|v| v.value.as_deref())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Cross-system dedup key for one item.
///
/// Uses the first `dcterms:identifier` value; an item without one gets a
/// synthesized `Fallback:{id}-{added}` key so every item can be deduplicated.
pub fn derive_identifier(item_id: u64, item: &LegacyItem, metadata: &PropertyBag) -> String {
    match metadata.first_value(IDENTIFIER_KEY) {
        Some(identifier) if !identifier.is_empty() => identifier.to_string(),
        _ => format!(
            "Fallback:{}-{}",
            item_id,
            item.added.as_deref().unwrap_or("no-date")
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdSpecError {
    #[error("no item IDs given")]
    Empty,
    #[error("`{token}` is not a valid item ID")]
    InvalidNumber { token: String },
    #[error("`{token}` is not a valid range; expected START-END")]
    MalformedRange { token: String },
    #[error("range {start}-{end} runs backwards")]
    ReversedRange { start: u64, end: u64 },
    #[error("range {start}-{end} expands past the limit of {} item IDs", MAX_IDS_PER_RUN)]
    RangeTooLarge { start: u64, end: u64 },
    #[error("ID list expands past the limit of {} item IDs", MAX_IDS_PER_RUN)]
    TooManyIds,
}

/// Parse an ID list such as `100-102,105; 110` into individual IDs.
///
/// Separators are commas, semicolons and whitespace. Ranges are inclusive.
/// Order and repeats are preserved. The expanded list is capped at
/// [`MAX_IDS_PER_RUN`] IDs.
pub fn parse_id_spec(input: &str) -> Result<Vec<u64>, IdSpecError> {
    let tokens = input
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();
    if tokens.is_empty() {
        return Err(IdSpecError::Empty);
    }

    let mut ids = Vec::new();
    for token in tokens {
        if token.contains('-') {
            let mut parts = token.split('-');
            let (Some(start), Some(end), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(IdSpecError::MalformedRange {
                    token: token.to_string(),
                });
            };
            let start = parse_id(start, token)?;
            let end = parse_id(end, token)?;
            if end < start {
                return Err(IdSpecError::ReversedRange { start, end });
            }
            let count = match (end - start).checked_add(1) {
                Some(count) if count <= MAX_IDS_PER_RUN => count,
                _ => return Err(IdSpecError::RangeTooLarge { start, end }),
            };
            if ids.len() as u64 + count > MAX_IDS_PER_RUN {
                return Err(IdSpecError::TooManyIds);
            }
            ids.extend(start..=end);
        } else {
            if ids.len() as u64 >= MAX_IDS_PER_RUN {
                return Err(IdSpecError::TooManyIds);
            }
            ids.push(parse_id(token, token)?);
        }
    }
    Ok(ids)
}

fn parse_id(part: &str, token: &str) -> Result<u64, IdSpecError> {
    part.trim().parse().map_err(|_| {
        if part.is_empty() {
            IdSpecError::MalformedRange {
                token: token.to_string(),
            }
        } else {
            IdSpecError::InvalidNumber {
                token: part.to_string(),
            }
        }
    })
}

/// Step of the per-item workflow a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    DedupCheck,
    Creating,
    MediaUpload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Fetching => "fetching",
            Self::DedupCheck => "duplicate check",
            Self::Creating => "creating",
            Self::MediaUpload => "media upload",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUpload {
    pub file_url: String,
    pub uploaded: bool,
}

/// Result of processing one requested item ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    MappedOnly {
        metadata: PropertyBag,
    },
    SkippedNotFound,
    SkippedDuplicate {
        identifier: String,
    },
    DryRunWouldCreate {
        identifier: String,
        file_count: usize,
    },
    /// `identifier_recorded` is false when the identifier cache could not be
    /// written after the create; a later run may then create the item again.
    Created {
        identifier: String,
        new_item_id: u64,
        identifier_recorded: bool,
        media: Vec<MediaUpload>,
    },
    CreatedWithMediaFailures {
        identifier: String,
        new_item_id: u64,
        identifier_recorded: bool,
        media: Vec<MediaUpload>,
    },
    CreateFailed {
        identifier: String,
    },
    Failed {
        stage: Stage,
        reason: String,
    },
    TimedOut {
        stage: Stage,
    },
}

impl ItemOutcome {
    pub fn created(
        identifier: String,
        new_item_id: u64,
        identifier_recorded: bool,
        media: Vec<MediaUpload>,
    ) -> Self {
        if media.iter().all(|m| m.uploaded) {
            Self::Created {
                identifier,
                new_item_id,
                identifier_recorded,
                media,
            }
        } else {
            Self::CreatedWithMediaFailures {
                identifier,
                new_item_id,
                identifier_recorded,
                media,
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MappedOnly { .. } => "mapped_only",
            Self::SkippedNotFound => "skipped_not_found",
            Self::SkippedDuplicate { .. } => "skipped_duplicate",
            Self::DryRunWouldCreate { .. } => "dry_run_would_create",
            Self::Created { .. } => "created",
            Self::CreatedWithMediaFailures { .. } => "created_with_media_failures",
            Self::CreateFailed { .. } => "create_failed",
            Self::Failed { .. } => "failed",
            Self::TimedOut { .. } => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Fail,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Fail => "fail",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub severity: Severity,
    pub message: String,
}

impl LogLine {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

/// Outcome for one requested item ID, as handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    pub item_id: u64,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

impl ItemReport {
    /// Operator-facing log lines for this report.
    pub fn log_lines(&self) -> Vec<LogLine> {
        let id = self.item_id;
        match &self.outcome {
            ItemOutcome::MappedOnly { metadata } => {
                let rendered = serde_json::to_string_pretty(metadata)
                    .unwrap_or_else(|e| format!("<unrenderable metadata: {e}>"));
                vec![
                    LogLine::new(Severity::Info, format!("Item {id} mapped:")),
                    LogLine::new(Severity::Info, rendered),
                ]
            }
            ItemOutcome::SkippedNotFound => vec![LogLine::new(
                Severity::Fail,
                format!("Item {id} not found or inaccessible. Skipping."),
            )],
            ItemOutcome::SkippedDuplicate { identifier } => vec![LogLine::new(
                Severity::Info,
                format!("Item {id} (identifier: {identifier}) already exists. Skipping."),
            )],
            ItemOutcome::DryRunWouldCreate { file_count, .. } => vec![LogLine::new(
                Severity::Info,
                format!(
                    "[Dry Run] Would create item {id} with metadata and {file_count} media file(s)."
                ),
            )],
            ItemOutcome::Created {
                identifier,
                new_item_id,
                identifier_recorded,
                media,
            }
            | ItemOutcome::CreatedWithMediaFailures {
                identifier,
                new_item_id,
                identifier_recorded,
                media,
            } => {
                let mut lines = vec![LogLine::new(
                    Severity::Success,
                    format!("Item {id} created as new item ID {new_item_id} in Omeka S."),
                )];
                if !identifier_recorded {
                    lines.push(LogLine::new(
                        Severity::Fail,
                        format!(
                            " → Could not save identifier {identifier} to the identifier cache; \
                             a later run may create this item again."
                        ),
                    ));
                }
                lines.extend(media.iter().map(|m| {
                    if m.uploaded {
                        LogLine::new(Severity::Success, format!(" → Media uploaded: {}", m.file_url))
                    } else {
                        LogLine::new(
                            Severity::Fail,
                            format!(" → Failed to upload media: {}", m.file_url),
                        )
                    }
                }));
                lines
            }
            ItemOutcome::CreateFailed { .. } => vec![LogLine::new(
                Severity::Fail,
                format!("Failed to create item {id} in Omeka S."),
            )],
            ItemOutcome::Failed { stage, reason } => vec![LogLine::new(
                Severity::Fail,
                format!("Item {id} failed during {stage}: {reason}"),
            )],
            ItemOutcome::TimedOut { stage } => vec![LogLine::new(
                Severity::Fail,
                format!("Item {id} timed out during {stage}."),
            )],
        }
    }
}
