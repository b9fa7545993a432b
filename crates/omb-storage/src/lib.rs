//! Identifier cache persistence + HTTP client utilities for the migration bridge.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "omb-storage";

pub const DEFAULT_IDENTIFIER_CACHE_PATH: &str = "known_identifiers.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("reading identifier cache {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identifier cache {path} is not a JSON array of strings: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing identifier cache {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Identifiers already migrated to the destination, persisted as a JSON array.
///
/// A performance shortcut only: the destination API stays authoritative when
/// an identifier is missing here.
#[derive(Debug, Clone)]
pub struct IdentifierCache {
    path: PathBuf,
    identifiers: BTreeSet<String>,
}

impl IdentifierCache {
    /// Load the cache from `path`. A missing file is an empty cache; `null`
    /// entries in the array are skipped.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let identifiers = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<Option<String>>>(&bytes)
                .map_err(|source| CacheError::Parse {
                    path: path.clone(),
                    source,
                })?
                .into_iter()
                .flatten()
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no identifier cache yet; starting empty");
                BTreeSet::new()
            }
            Err(source) => return Err(CacheError::Read { path, source }),
        };
        Ok(Self { path, identifiers })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.identifiers.contains(identifier)
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// Add `identifier` and rewrite the persisted file.
    ///
    /// Returns `false` without touching disk when the identifier was already known.
    pub async fn record(&mut self, identifier: &str) -> Result<bool, CacheError> {
        if !self.identifiers.insert(identifier.to_string()) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    async fn persist(&self) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(&self.identifiers).map_err(|source| {
            CacheError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|source| CacheError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            accept_invalid_certs: false,
        }
    }
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    if config.accept_invalid_certs {
        warn!("TLS certificate validation disabled for this endpoint");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().context("building reqwest client")
}

/// Join an API base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected response body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ApiError {
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode {
            url: self.final_url.clone(),
            message: e.to_string(),
        })
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn status_error(&self) -> ApiError {
        ApiError::HttpStatus {
            status: self.status.as_u16(),
            url: self.final_url.clone(),
        }
    }
}

/// Send `request` and buffer the full body, whatever the status.
pub async fn execute(
    request: reqwest::RequestBuilder,
    url: &str,
) -> Result<FetchedResponse, ApiError> {
    let resp = request
        .send()
        .await
        .map_err(|e| ApiError::from_reqwest(url, e))?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    let body = resp
        .bytes()
        .await
        .map_err(|e| ApiError::from_reqwest(url, e))?
        .to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}
