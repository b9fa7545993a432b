//! Omeka S destination: item/media writes and the duplicate check.

use anyhow::{Context, Result};
use async_trait::async_trait;
use omb_core::PropertyBag;
use omb_storage::{build_client, execute, join_url, ApiError, HttpClientConfig, IdentifierCache};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

pub const DEFAULT_DEDUP_PAGE_SIZE: usize = 1000;

/// Item as listed by `GET {dest}/items`; only the fields dedup needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationItem {
    #[serde(rename = "dcterms:identifier", default)]
    pub identifiers: Vec<IdentifierValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentifierValue {
    #[serde(rename = "@value", default)]
    pub value: Option<JsonValue>,
}

impl DestinationItem {
    pub fn has_identifier(&self, identifier: &str) -> bool {
        self.identifiers
            .iter()
            .any(|v| v.value.as_ref().and_then(JsonValue::as_str) == Some(identifier))
    }
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    #[serde(rename = "o:id", default)]
    id: Option<u64>,
}

#[async_trait]
pub trait DestinationApi: Send + Sync {
    fn describe(&self) -> String;

    /// One page of the most recently created items, newest first.
    async fn list_recent_items(&self, per_page: usize) -> Result<Vec<DestinationItem>, ApiError>;

    /// `Ok(Some(id))` on `201 Created`, `Ok(None)` on any other status.
    async fn create_item(&self, metadata: &PropertyBag) -> Result<Option<u64>, ApiError>;

    /// Attach `file_url` to `item_id` as an externally ingested media.
    async fn create_media(&self, file_url: &str, item_id: u64) -> Result<bool, ApiError>;
}

#[derive(Debug, Clone)]
pub struct OmekaSClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OmekaSClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        http: &HttpClientConfig,
    ) -> Result<Self> {
        let base_url = base_url.into();
        let client = build_client(http)
            .with_context(|| format!("building destination client for {base_url}"))?;
        Ok(Self {
            base_url,
            api_key: api_key.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

#[async_trait]
impl DestinationApi for OmekaSClient {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn list_recent_items(&self, per_page: usize) -> Result<Vec<DestinationItem>, ApiError> {
        let url = self.url("items");
        let request = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[
                ("per_page", per_page.to_string()),
                ("sort_by", "id".to_string()),
                ("sort_order", "desc".to_string()),
            ]);
        let resp = execute(request, &url).await?;
        if !resp.status.is_success() {
            return Err(resp.status_error());
        }
        resp.json()
    }

    async fn create_item(&self, metadata: &PropertyBag) -> Result<Option<u64>, ApiError> {
        let url = self.url("items");
        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(metadata);
        let resp = execute(request, &url).await?;
        debug!(
            status = resp.status.as_u16(),
            body = %resp.text_lossy(),
            "create item response"
        );
        if resp.status != StatusCode::CREATED {
            return Ok(None);
        }
        let created: CreatedResource = resp.json()?;
        Ok(created.id)
    }

    async fn create_media(&self, file_url: &str, item_id: u64) -> Result<bool, ApiError> {
        let url = self.url("media");
        let item_id = item_id.to_string();
        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .form(&[
                ("o:ingester", "url"),
                ("o:item[o:id]", item_id.as_str()),
                ("o:source", file_url),
            ]);
        let resp = execute(request, &url).await?;
        if resp.status != StatusCode::CREATED {
            debug!(status = resp.status.as_u16(), file_url, "media create rejected");
        }
        Ok(resp.status == StatusCode::CREATED)
    }
}

/// Decides whether an identifier already exists at the destination.
///
/// Only the `page_size` most recent destination items are scanned. Identifiers
/// on older items are invisible unless they are already in the cache.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateChecker {
    pub page_size: usize,
}

impl Default for DuplicateChecker {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_DEDUP_PAGE_SIZE,
        }
    }
}

impl DuplicateChecker {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }

    pub async fn exists(
        &self,
        cache: &IdentifierCache,
        destination: &dyn DestinationApi,
        identifier: &str,
    ) -> Result<bool, ApiError> {
        if cache.contains(identifier) {
            debug!(identifier, "identifier found in local cache");
            return Ok(true);
        }

        let items = match destination.list_recent_items(self.page_size).await {
            Ok(items) => items,
            Err(ApiError::HttpStatus { status, url }) => {
                warn!(status, %url, identifier, "destination listing refused; treating as not duplicate");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        Ok(items.iter().any(|item| item.has_identifier(identifier)))
    }
}
