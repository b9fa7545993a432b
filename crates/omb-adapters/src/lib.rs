//! Source reader contracts + Omeka Classic metadata mapping.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use omb_core::{LegacyItem, PropertyBag, PropertyValue, DCTERMS_PREFIX, DUBLIN_CORE_SET};
use omb_storage::{build_client, execute, join_url, ApiError, HttpClientConfig};
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "omb-adapters";

/// Where legacy item records come from.
#[async_trait]
pub trait SourceReader: Send + Sync {
    fn describe(&self) -> String;

    /// `Ok(None)` means the item is missing or inaccessible; the two are not told apart.
    async fn fetch_item(&self, item_id: u64) -> Result<Option<LegacyItem>, ApiError>;
}

/// Reads items from an Omeka Classic REST API (`GET {base}/items/{id}`).
#[derive(Debug, Clone)]
pub struct ClassicSourceReader {
    base_url: String,
    client: reqwest::Client,
}

impl ClassicSourceReader {
    pub fn new(base_url: impl Into<String>, http: &HttpClientConfig) -> Result<Self> {
        let base_url = base_url.into();
        let client = build_client(http)
            .with_context(|| format!("building source client for {base_url}"))?;
        Ok(Self { base_url, client })
    }

    pub fn item_url(&self, item_id: u64) -> String {
        join_url(&self.base_url, &format!("items/{item_id}"))
    }
}

#[async_trait]
impl SourceReader for ClassicSourceReader {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn fetch_item(&self, item_id: u64) -> Result<Option<LegacyItem>, ApiError> {
        let url = self.item_url(item_id);
        let resp = execute(self.client.get(&url), &url).await?;
        if !resp.status.is_success() {
            debug!(item_id, status = resp.status.as_u16(), %url, "source item unavailable");
            return Ok(None);
        }
        resp.json().map(Some)
    }
}

/// Serves captured item payloads from `{dir}/{id}.json`, for offline rehearsal.
#[derive(Debug, Clone)]
pub struct FixtureSourceReader {
    dir: PathBuf,
}

impl FixtureSourceReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn item_path(&self, item_id: u64) -> PathBuf {
        self.dir.join(format!("{item_id}.json"))
    }
}

#[async_trait]
impl SourceReader for FixtureSourceReader {
    fn describe(&self) -> String {
        format!("fixtures:{}", self.dir.display())
    }

    async fn fetch_item(&self, item_id: u64) -> Result<Option<LegacyItem>, ApiError> {
        let path = self.item_path(item_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ApiError::Decode {
                    url: path.display().to_string(),
                    message: err.to_string(),
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ApiError::Decode {
                url: path.display().to_string(),
                message: e.to_string(),
            })
    }
}

pub fn load_fixture_item(path: impl AsRef<Path>) -> Result<LegacyItem> {
    let path = path.as_ref();
    let data =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Map a legacy item's Dublin Core element texts into a destination property bag.
///
/// Only the `Dublin Core` element set has a destination mapping; every other
/// set is dropped. Values keep their source order within a key. Entries with a
/// missing element name land under the bare `dcterms:` key and missing text
/// becomes a null value.
pub fn map_metadata(item: &LegacyItem) -> PropertyBag {
    let mut bag = PropertyBag::new();
    for field in &item.element_texts {
        if field.element_set_name() != Some(DUBLIN_CORE_SET) {
            continue;
        }
        let element = field.element_name().unwrap_or_default().to_lowercase();
        bag.push(
            format!("{DCTERMS_PREFIX}{element}"),
            PropertyValue::literal(field.text.clone()),
        );
    }
    bag
}
