//! Migration orchestration: fetch, map, dedup, create, attach media.

mod destination;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use omb_adapters::{map_metadata, ClassicSourceReader, FixtureSourceReader, SourceReader};
use omb_core::{derive_identifier, ItemOutcome, ItemReport, MediaUpload, Stage};
use omb_storage::{
    ApiError, HttpClientConfig, IdentifierCache, DEFAULT_IDENTIFIER_CACHE_PATH,
};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use destination::{
    DestinationApi, DestinationItem, DuplicateChecker, IdentifierValue, OmekaSClient,
    DEFAULT_DEDUP_PAGE_SIZE,
};

pub const CRATE_NAME: &str = "omb-sync";

pub const DEFAULT_SOURCE_API: &str = "https://english3.fsu.edu/fsucardarchive/api";
pub const DEFAULT_DEST_API: &str = "https://fsucardarchive.create.fsu.edu/api";

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source_api: String,
    pub dest_api: String,
    pub api_key: String,
    pub known_identifiers_path: PathBuf,
    pub http_timeout_secs: u64,
    pub dedup_page_size: usize,
    pub source_insecure: bool,
    pub dest_insecure: bool,
    pub user_agent: String,
    pub source_fixtures_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        Self {
            source_api: std::env::var("OMEKA_SOURCE_API")
                .unwrap_or_else(|_| DEFAULT_SOURCE_API.to_string()),
            dest_api: std::env::var("OMEKA_DEST_API")
                .unwrap_or_else(|_| DEFAULT_DEST_API.to_string()),
            api_key: std::env::var("OMEKA_API_KEY").unwrap_or_default(),
            known_identifiers_path: std::env::var("OMEKA_KNOWN_IDENTIFIERS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_IDENTIFIER_CACHE_PATH)),
            http_timeout_secs: std::env::var("OMEKA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            dedup_page_size: std::env::var("OMEKA_DEDUP_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DEDUP_PAGE_SIZE),
            // Legacy archives commonly serve self-signed or mismatched certificates.
            source_insecure: env_flag("OMEKA_SOURCE_INSECURE", true),
            dest_insecure: env_flag("OMEKA_DEST_INSECURE", false),
            user_agent: std::env::var("OMEKA_USER_AGENT")
                .unwrap_or_else(|_| format!("omb/{}", env!("CARGO_PKG_VERSION"))),
            source_fixtures_dir: std::env::var("OMEKA_SOURCE_FIXTURES").ok().map(PathBuf::from),
            reports_dir: std::env::var("OMEKA_REPORTS_DIR").ok().map(PathBuf::from),
        }
    }

    fn http_config(&self, accept_invalid_certs: bool) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            accept_invalid_certs,
        }
    }

    pub fn source_http(&self) -> HttpClientConfig {
        self.http_config(self.source_insecure)
    }

    pub fn dest_http(&self) -> HttpClientConfig {
        self.http_config(self.dest_insecure)
    }

    pub fn source_reader(&self) -> Result<Box<dyn SourceReader>> {
        let reader: Box<dyn SourceReader> = match &self.source_fixtures_dir {
            Some(dir) => Box::new(FixtureSourceReader::new(dir.clone())),
            None => Box::new(ClassicSourceReader::new(
                self.source_api.clone(),
                &self.source_http(),
            )?),
        };
        Ok(reader)
    }

    pub fn destination(&self) -> Result<Box<dyn DestinationApi>> {
        let client = OmekaSClient::new(self.dest_api.clone(), self.api_key.clone(), &self.dest_http())?;
        Ok(Box::new(client))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Preview,
    DryRun,
    Migrate,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<ItemReport>,
}

impl RunSummary {
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for report in &self.reports {
            *counts.entry(report.outcome.kind()).or_default() += 1;
        }
        counts
    }
}

/// Drives the per-item workflow against one source and one destination.
///
/// Items are processed strictly in the order given, one request at a time.
pub struct MigrationPipeline {
    source: Box<dyn SourceReader>,
    destination: Box<dyn DestinationApi>,
    cache: IdentifierCache,
    checker: DuplicateChecker,
    dry_run: bool,
}

impl MigrationPipeline {
    pub fn new(
        source: Box<dyn SourceReader>,
        destination: Box<dyn DestinationApi>,
        cache: IdentifierCache,
    ) -> Self {
        Self {
            source,
            destination,
            cache,
            checker: DuplicateChecker::default(),
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_duplicate_checker(mut self, checker: DuplicateChecker) -> Self {
        self.checker = checker;
        self
    }

    pub fn cache(&self) -> &IdentifierCache {
        &self.cache
    }

    /// Run the full workflow for each item; dry-run stops short of any write.
    pub async fn migrate(
        &mut self,
        item_ids: &[u64],
        mut on_report: impl FnMut(&ItemReport),
    ) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!(
            "migration_run",
            %run_id,
            dry_run = self.dry_run,
            source = %self.source.describe(),
            destination = %self.destination.describe()
        );
        span.in_scope(|| info!(items = item_ids.len(), "starting migration run"));

        let mut reports = Vec::with_capacity(item_ids.len());
        for &item_id in item_ids {
            let outcome = self
                .migrate_item(item_id)
                .instrument(info_span!(parent: &span, "migrate_item", item_id))
                .await;
            let report = ItemReport { item_id, outcome };
            on_report(&report);
            reports.push(report);
        }

        RunSummary {
            run_id,
            mode: if self.dry_run {
                RunMode::DryRun
            } else {
                RunMode::Migrate
            },
            started_at,
            finished_at: Utc::now(),
            reports,
        }
    }

    pub async fn migrate_item(&mut self, item_id: u64) -> ItemOutcome {
        let item = match self.source.fetch_item(item_id).await {
            Ok(Some(item)) => item,
            Ok(None) => return ItemOutcome::SkippedNotFound,
            Err(err) => return failure(Stage::Fetching, err),
        };

        let metadata = map_metadata(&item);
        let identifier = derive_identifier(item_id, &item, &metadata);

        match self
            .checker
            .exists(&self.cache, self.destination.as_ref(), &identifier)
            .await
        {
            Ok(true) => return ItemOutcome::SkippedDuplicate { identifier },
            Ok(false) => {}
            Err(err) => return failure(Stage::DedupCheck, err),
        }

        let file_urls = item.file_urls();
        if self.dry_run {
            return ItemOutcome::DryRunWouldCreate {
                identifier,
                file_count: file_urls.len(),
            };
        }

        let new_item_id = match self.destination.create_item(&metadata).await {
            Ok(Some(id)) => id,
            Ok(None) => return ItemOutcome::CreateFailed { identifier },
            Err(err) => return failure(Stage::Creating, err),
        };
        info!(new_item_id, %identifier, "item created");

        // Recorded before media so a crash mid-upload cannot re-create the item.
        let identifier_recorded = match self.cache.record(&identifier).await {
            Ok(_) => true,
            Err(err) => {
                error!(error = %err, %identifier, "failed to persist migrated identifier");
                false
            }
        };

        let mut media = Vec::with_capacity(file_urls.len());
        for file_url in file_urls {
            let uploaded = match self.destination.create_media(&file_url, new_item_id).await {
                Ok(uploaded) => uploaded,
                Err(err) => {
                    warn!(error = %err, %file_url, "media upload request failed");
                    false
                }
            };
            media.push(MediaUpload { file_url, uploaded });
        }

        ItemOutcome::created(identifier, new_item_id, identifier_recorded, media)
    }
}

/// Fetch and map each item from `source` alone; no cache, no destination.
pub async fn run_preview(
    source: &dyn SourceReader,
    item_ids: &[u64],
    mut on_report: impl FnMut(&ItemReport),
) -> RunSummary {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("preview_run", %run_id, source = %source.describe());

    let mut reports = Vec::with_capacity(item_ids.len());
    for &item_id in item_ids {
        let outcome = preview_item(source, item_id)
            .instrument(info_span!(parent: &span, "preview_item", item_id))
            .await;
        let report = ItemReport { item_id, outcome };
        on_report(&report);
        reports.push(report);
    }

    RunSummary {
        run_id,
        mode: RunMode::Preview,
        started_at,
        finished_at: Utc::now(),
        reports,
    }
}

pub async fn preview_item(source: &dyn SourceReader, item_id: u64) -> ItemOutcome {
    match source.fetch_item(item_id).await {
        Ok(Some(item)) => ItemOutcome::MappedOnly {
            metadata: map_metadata(&item),
        },
        Ok(None) => ItemOutcome::SkippedNotFound,
        Err(err) => failure(Stage::Fetching, err),
    }
}

fn failure(stage: Stage, err: ApiError) -> ItemOutcome {
    warn!(%stage, error = %err, "item step failed");
    if err.is_timeout() {
        ItemOutcome::TimedOut { stage }
    } else {
        ItemOutcome::Failed {
            stage,
            reason: err.to_string(),
        }
    }
}

/// Build a pipeline from `config`, loading the identifier cache from disk.
pub async fn build_pipeline(config: &MigrationConfig, dry_run: bool) -> Result<MigrationPipeline> {
    let cache = IdentifierCache::load(&config.known_identifiers_path)
        .await
        .context("loading identifier cache")?;
    info!(
        path = %cache.path().display(),
        known = cache.len(),
        "identifier cache loaded"
    );
    Ok(MigrationPipeline::new(config.source_reader()?, config.destination()?, cache)
        .with_dry_run(dry_run)
        .with_duplicate_checker(DuplicateChecker::new(config.dedup_page_size)))
}

/// Write `migration_report.json` and `run_brief.md` under `{reports_root}/{run_id}/`.
pub async fn write_run_report(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("migration_report.json"), json)
        .await
        .context("writing migration_report.json")?;

    let brief = format!(
        "# Migration Run\n\n- Run ID: `{}`\n- Mode: {:?}\n- Started: {}\n- Finished: {}\n- Items: {}\n\n## Outcomes\n{}\n",
        summary.run_id,
        summary.mode,
        summary.started_at,
        summary.finished_at,
        summary.reports.len(),
        summary
            .counts()
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    );
    fs::write(run_dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;

    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use omb_core::{ElementText, FileReference, LegacyItem, PropertyBag};
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct FakeSource {
        items: HashMap<u64, LegacyItem>,
        timeouts: HashSet<u64>,
    }

    #[async_trait]
    impl SourceReader for FakeSource {
        fn describe(&self) -> String {
            "fake-source".into()
        }

        async fn fetch_item(&self, item_id: u64) -> Result<Option<LegacyItem>, ApiError> {
            if self.timeouts.contains(&item_id) {
                return Err(ApiError::Timeout {
                    url: format!("fake://items/{item_id}"),
                });
            }
            Ok(self.items.get(&item_id).cloned())
        }
    }

    #[derive(Debug, Default)]
    struct DestinationLog {
        list_calls: usize,
        created: Vec<PropertyBag>,
        media: Vec<(String, u64)>,
    }

    #[derive(Clone, Default)]
    struct FakeDestination {
        log: Arc<Mutex<DestinationLog>>,
        existing: Vec<String>,
        reject_create: bool,
        listing_status: Option<u16>,
        failing_media: HashSet<String>,
    }

    impl FakeDestination {
        fn list_calls(&self) -> usize {
            self.log.lock().unwrap().list_calls
        }

        fn write_calls(&self) -> usize {
            let log = self.log.lock().unwrap();
            log.created.len() + log.media.len()
        }

        fn media_calls(&self) -> Vec<(String, u64)> {
            self.log.lock().unwrap().media.clone()
        }
    }

    #[async_trait]
    impl DestinationApi for FakeDestination {
        fn describe(&self) -> String {
            "fake-destination".into()
        }

        async fn list_recent_items(&self, per_page: usize) -> Result<Vec<DestinationItem>, ApiError> {
            self.log.lock().unwrap().list_calls += 1;
            if let Some(status) = self.listing_status {
                return Err(ApiError::HttpStatus {
                    status,
                    url: "fake://items".into(),
                });
            }
            Ok(self
                .existing
                .iter()
                .take(per_page)
                .map(|identifier| DestinationItem {
                    identifiers: vec![IdentifierValue {
                        value: Some(serde_json::Value::String(identifier.clone())),
                    }],
                })
                .collect())
        }

        async fn create_item(&self, metadata: &PropertyBag) -> Result<Option<u64>, ApiError> {
            let mut log = self.log.lock().unwrap();
            log.created.push(metadata.clone());
            if self.reject_create {
                return Ok(None);
            }
            Ok(Some(900 + log.created.len() as u64))
        }

        async fn create_media(&self, file_url: &str, item_id: u64) -> Result<bool, ApiError> {
            self.log
                .lock()
                .unwrap()
                .media
                .push((file_url.to_string(), item_id));
            Ok(!self.failing_media.contains(file_url))
        }
    }

    fn dc_item(id: u64, identifier: Option<&str>, files: &[&str]) -> LegacyItem {
        let mut element_texts = vec![ElementText::new("Dublin Core", "Title", &format!("Card {id}"))];
        if let Some(identifier) = identifier {
            element_texts.push(ElementText::new("Dublin Core", "Identifier", identifier));
        }
        LegacyItem {
            id: Some(id),
            element_texts,
            files: files
                .iter()
                .map(|url| FileReference::RawUrl(url.to_string()))
                .collect(),
            added: Some("2016-03-08T17:22:41+00:00".into()),
        }
    }

    fn source_with(items: Vec<LegacyItem>) -> FakeSource {
        FakeSource {
            items: items
                .into_iter()
                .map(|item| (item.id.unwrap(), item))
                .collect(),
            ..Default::default()
        }
    }

    fn cache_path(dir: &TempDir) -> PathBuf {
        dir.path().join("known_identifiers.json")
    }

    async fn pipeline(source: FakeSource, dest: &FakeDestination, dir: &TempDir) -> MigrationPipeline {
        let cache = IdentifierCache::load(cache_path(dir)).await.expect("cache");
        MigrationPipeline::new(Box::new(source), Box::new(dest.clone()), cache)
    }

    #[tokio::test]
    async fn new_item_is_created_recorded_and_gets_its_media() {
        let dir = tempdir().expect("tempdir");
        let dest = FakeDestination::default();
        let source = source_with(vec![dc_item(42, Some("X-42"), &["https://src/x42.jpg"])]);
        let mut pipeline = pipeline(source, &dest, &dir).await;

        let outcome = pipeline.migrate_item(42).await;

        assert_eq!(
            outcome,
            ItemOutcome::Created {
                identifier: "X-42".into(),
                new_item_id: 901,
                identifier_recorded: true,
                media: vec![MediaUpload {
                    file_url: "https://src/x42.jpg".into(),
                    uploaded: true,
                }],
            }
        );
        assert!(pipeline.cache().contains("X-42"));
        assert_eq!(dest.media_calls(), vec![("https://src/x42.jpg".to_string(), 901)]);
        assert_eq!(dest.list_calls(), 1);

        let reloaded = IdentifierCache::load(cache_path(&dir)).await.expect("reload");
        assert!(reloaded.contains("X-42"));
    }

    #[tokio::test]
    async fn cached_identifier_skips_without_touching_destination() {
        let dir = tempdir().expect("tempdir");
        IdentifierCache::load(cache_path(&dir))
            .await
            .expect("cache")
            .record("X-43")
            .await
            .expect("record");
        let dest = FakeDestination::default();
        let source = source_with(vec![dc_item(43, Some("X-43"), &["https://src/x43.jpg"])]);
        let mut pipeline = pipeline(source, &dest, &dir).await;

        let outcome = pipeline.migrate_item(43).await;

        assert_eq!(
            outcome,
            ItemOutcome::SkippedDuplicate {
                identifier: "X-43".into()
            }
        );
        assert_eq!(dest.list_calls(), 0);
        assert_eq!(dest.write_calls(), 0);
    }

    #[tokio::test]
    async fn identifier_created_in_a_prior_run_short_circuits_the_next_run() {
        let dir = tempdir().expect("tempdir");
        let first = FakeDestination::default();
        let mut run_one = pipeline(source_with(vec![dc_item(42, Some("X-42"), &[])]), &first, &dir).await;
        run_one.migrate(&[42], |_| {}).await;

        let second = FakeDestination::default();
        let mut run_two = pipeline(source_with(vec![dc_item(42, Some("X-42"), &[])]), &second, &dir).await;
        let summary = run_two.migrate(&[42], |_| {}).await;

        assert_eq!(summary.reports[0].outcome.kind(), "skipped_duplicate");
        assert_eq!(second.list_calls(), 0);
        assert_eq!(second.write_calls(), 0);
    }

    #[tokio::test]
    async fn identifier_found_at_destination_is_skipped() {
        let dir = tempdir().expect("tempdir");
        let dest = FakeDestination {
            existing: vec!["X-1".into(), "X-42".into()],
            ..Default::default()
        };
        let mut pipeline = pipeline(source_with(vec![dc_item(42, Some("X-42"), &[])]), &dest, &dir).await;

        assert_eq!(pipeline.migrate_item(42).await.kind(), "skipped_duplicate");
        assert_eq!(dest.write_calls(), 0);
    }

    #[tokio::test]
    async fn fallback_identifier_is_used_for_dedup() {
        let dir = tempdir().expect("tempdir");
        let dest = FakeDestination {
            existing: vec!["Fallback:44-2016-03-08T17:22:41+00:00".into()],
            ..Default::default()
        };
        let mut pipeline = pipeline(source_with(vec![dc_item(44, None, &[])]), &dest, &dir).await;

        assert_eq!(
            pipeline.migrate_item(44).await,
            ItemOutcome::SkippedDuplicate {
                identifier: "Fallback:44-2016-03-08T17:22:41+00:00".into()
            }
        );
    }

    #[tokio::test]
    async fn dedup_only_sees_the_configured_page_window() {
        let dir = tempdir().expect("tempdir");
        let dest = FakeDestination {
            existing: vec!["X-3".into(), "X-2".into(), "X-42".into()],
            ..Default::default()
        };
        let mut pipeline = pipeline(source_with(vec![dc_item(42, Some("X-42"), &[])]), &dest, &dir)
            .await
            .with_duplicate_checker(DuplicateChecker::new(2));

        assert_eq!(pipeline.migrate_item(42).await.kind(), "created");
    }

    #[tokio::test]
    async fn refused_listing_counts_as_not_duplicate() {
        let dir = tempdir().expect("tempdir");
        let dest = FakeDestination {
            listing_status: Some(500),
            ..Default::default()
        };
        let mut pipeline = pipeline(source_with(vec![dc_item(42, Some("X-42"), &[])]), &dest, &dir).await;

        assert_eq!(pipeline.migrate_item(42).await.kind(), "created");
    }

    #[tokio::test]
    async fn dry_run_never_writes_or_records() {
        let dir = tempdir().expect("tempdir");
        let dest = FakeDestination {
            existing: vec!["X-7".into()],
            ..Default::default()
        };
        let source = source_with(vec![
            dc_item(42, Some("X-42"), &["https://src/a.jpg", "https://src/b.jpg"]),
            dc_item(7, Some("X-7"), &["https://src/c.jpg"]),
        ]);
        let mut pipeline = pipeline(source, &dest, &dir).await.with_dry_run(true);

        let summary = pipeline.migrate(&[42, 7], |_| {}).await;

        assert_eq!(summary.mode, RunMode::DryRun);
        assert_eq!(
            summary.reports[0].outcome,
            ItemOutcome::DryRunWouldCreate {
                identifier: "X-42".into(),
                file_count: 2,
            }
        );
        assert_eq!(summary.reports[1].outcome.kind(), "skipped_duplicate");
        assert_eq!(dest.write_calls(), 0);
        assert!(pipeline.cache().is_empty());
        assert!(!cache_path(&dir).exists());
    }

    #[tokio::test]
    async fn failing_media_does_not_stop_siblings() {
        let dir = tempdir().expect("tempdir");
        let dest = FakeDestination {
            failing_media: HashSet::from(["https://src/b.jpg".to_string()]),
            ..Default::default()
        };
        let files = ["https://src/a.jpg", "https://src/b.jpg", "https://src/c.jpg"];
        let mut pipeline = pipeline(source_with(vec![dc_item(42, Some("X-42"), &files)]), &dest, &dir).await;

        let outcome = pipeline.migrate_item(42).await;

        let ItemOutcome::CreatedWithMediaFailures { media, new_item_id, .. } = outcome else {
            panic!("expected created-with-media-failures");
        };
        assert_eq!(new_item_id, 901);
        assert_eq!(
            media.iter().map(|m| m.uploaded).collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert_eq!(dest.media_calls().len(), 3);
        assert!(pipeline.cache().contains("X-42"));
    }

    #[tokio::test]
    async fn missing_and_rejected_items_are_isolated() {
        let dir = tempdir().expect("tempdir");
        let dest = FakeDestination {
            reject_create: true,
            ..Default::default()
        };
        let mut source = source_with(vec![dc_item(42, Some("X-42"), &["https://src/a.jpg"])]);
        source.timeouts.insert(8);
        let mut pipeline = pipeline(source, &dest, &dir).await;

        let mut seen = Vec::new();
        let summary = pipeline
            .migrate(&[7, 8, 42], |report| seen.push(report.item_id))
            .await;

        assert_eq!(seen, vec![7, 8, 42]);
        assert_eq!(summary.reports[0].outcome, ItemOutcome::SkippedNotFound);
        assert_eq!(
            summary.reports[1].outcome,
            ItemOutcome::TimedOut {
                stage: Stage::Fetching
            }
        );
        assert_eq!(
            summary.reports[2].outcome,
            ItemOutcome::CreateFailed {
                identifier: "X-42".into()
            }
        );
        assert!(dest.media_calls().is_empty());
        assert!(pipeline.cache().is_empty());
        assert_eq!(summary.counts().get("create_failed"), Some(&1));
    }

    #[tokio::test]
    async fn preview_needs_only_a_source() {
        let mut source = source_with(vec![dc_item(42, Some("X-42"), &[])]);
        source.timeouts.insert(44);

        let mut seen = Vec::new();
        let summary = run_preview(&source, &[42, 43, 44], |report| seen.push(report.item_id)).await;

        assert_eq!(summary.mode, RunMode::Preview);
        assert_eq!(seen, vec![42, 43, 44]);
        let ItemOutcome::MappedOnly { metadata } = &summary.reports[0].outcome else {
            panic!("expected mapped-only");
        };
        assert_eq!(metadata.first_value("dcterms:identifier"), Some("X-42"));
        assert_eq!(
            metadata.keys().collect::<Vec<_>>(),
            vec!["dcterms:title", "dcterms:identifier"]
        );
        assert_eq!(summary.reports[1].outcome, ItemOutcome::SkippedNotFound);
        assert_eq!(
            summary.reports[2].outcome,
            ItemOutcome::TimedOut {
                stage: Stage::Fetching
            }
        );
    }

    #[tokio::test]
    async fn unwritable_cache_is_flagged_on_the_created_outcome() {
        let dir = tempdir().expect("tempdir");
        let cache_file = dir.path().join("state").join("known_identifiers.json");
        let cache = IdentifierCache::load(&cache_file).await.expect("cache");
        std::fs::write(dir.path().join("state"), "not a directory").expect("block cache dir");
        let dest = FakeDestination::default();
        let source = source_with(vec![dc_item(42, Some("X-42"), &["https://src/a.jpg"])]);
        let mut pipeline = MigrationPipeline::new(Box::new(source), Box::new(dest.clone()), cache);

        let outcome = pipeline.migrate_item(42).await;

        let ItemOutcome::Created {
            identifier_recorded,
            new_item_id,
            ..
        } = &outcome
        else {
            panic!("expected created");
        };
        assert!(!identifier_recorded);
        assert_eq!(*new_item_id, 901);
        assert_eq!(dest.media_calls().len(), 1);

        let report = ItemReport {
            item_id: 42,
            outcome,
        };
        assert!(report
            .log_lines()
            .iter()
            .any(|line| line.severity == omb_core::Severity::Fail
                && line.message.contains("identifier cache")));
    }

    #[tokio::test]
    async fn run_report_is_written_per_run() {
        let dir = tempdir().expect("tempdir");
        let dest = FakeDestination::default();
        let mut pipeline = pipeline(source_with(vec![dc_item(42, Some("X-42"), &[])]), &dest, &dir).await;
        let summary = pipeline.migrate(&[42, 99], |_| {}).await;

        let run_dir = write_run_report(&dir.path().join("reports"), &summary)
            .await
            .expect("report");

        let report: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("migration_report.json")).expect("read"),
        )
        .expect("json");
        assert_eq!(report["mode"], "migrate");
        assert_eq!(report["reports"][0]["outcome"], "created");
        assert_eq!(report["reports"][1]["outcome"], "skipped_not_found");
        let brief = std::fs::read_to_string(run_dir.join("run_brief.md")).expect("brief");
        assert!(brief.contains("- created: 1"));
    }

    #[test]
    fn destination_item_matches_only_exact_string_identifiers() {
        let item: DestinationItem = serde_json::from_value(serde_json::json!({
            "o:id": 5,
            "dcterms:identifier": [
                {"@value": 42},
                {"type": "literal"},
                {"@value": "X-42", "@language": "en"}
            ]
        }))
        .expect("item");
        assert!(item.has_identifier("X-42"));
        assert!(!item.has_identifier("42"));
        assert!(!item.has_identifier("x-42"));
    }
}
