use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use omb_core::{parse_id_spec, ItemReport};
use omb_sync::{build_pipeline, run_preview, write_run_report, MigrationConfig, RunSummary};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "omb-cli")]
#[command(about = "Migrate Omeka Classic items into Omeka S")]
struct Cli {
    /// Trace raw destination responses
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and map items without touching the destination
    Preview(RunArgs),
    /// Fetch, deduplicate and create items with their media
    Migrate {
        #[command(flatten)]
        run: RunArgs,
        /// Report what would be created without writing anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Item IDs, e.g. "100-102,105 110"
    #[arg(long)]
    ids: String,
    /// Omeka Classic API base URL
    #[arg(long)]
    source: Option<String>,
    /// Read items from `<DIR>/<id>.json` instead of the source API
    #[arg(long, value_name = "DIR")]
    source_fixtures: Option<PathBuf>,
    /// Omeka S API base URL
    #[arg(long)]
    dest: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    /// JSON file of identifiers already migrated
    #[arg(long, value_name = "FILE")]
    known_identifiers: Option<PathBuf>,
    /// How many recent destination items the duplicate check scans
    #[arg(long)]
    dedup_page_size: Option<usize>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Write a per-run report under this directory
    #[arg(long, value_name = "DIR")]
    report_dir: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, mut config: MigrationConfig) -> MigrationConfig {
        if let Some(v) = &self.source {
            config.source_api = v.clone();
        }
        if let Some(v) = &self.source_fixtures {
            config.source_fixtures_dir = Some(v.clone());
        }
        if let Some(v) = &self.dest {
            config.dest_api = v.clone();
        }
        if let Some(v) = &self.api_key {
            config.api_key = v.clone();
        }
        if let Some(v) = &self.known_identifiers {
            config.known_identifiers_path = v.clone();
        }
        if let Some(v) = self.dedup_page_size {
            config.dedup_page_size = v;
        }
        if let Some(v) = self.timeout_secs {
            config.http_timeout_secs = v;
        }
        if let Some(v) = &self.report_dir {
            config.reports_dir = Some(v.clone());
        }
        config
    }

    fn item_ids(&self) -> Result<Vec<u64>> {
        parse_id_spec(&self.ids).map_err(|e| {
            anyhow!(
                "invalid item ID list `{}`: {e}; expected something like 100-102,105,110",
                self.ids
            )
        })
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "warn,omb_cli=debug,omb_sync=debug,omb_adapters=debug,omb_storage=debug"
    } else {
        "warn,omb_cli=info,omb_sync=info,omb_adapters=info,omb_storage=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_report(report: &ItemReport) {
    for line in report.log_lines() {
        println!("[{}] {}", line.severity, line.message);
    }
}

/// Preview reads from the source only; the cache and destination are never opened.
async fn preview(config: &MigrationConfig, ids: &[u64]) -> Result<RunSummary> {
    let source = config.source_reader()?;
    Ok(run_preview(source.as_ref(), ids, print_report).await)
}

async fn finish(config: &MigrationConfig, summary: &RunSummary) -> Result<()> {
    let counts = summary
        .counts()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!(
        "run complete: run_id={} mode={:?} items={} {}",
        summary.run_id,
        summary.mode,
        summary.reports.len(),
        counts
    );
    if let Some(dir) = &config.reports_dir {
        let run_dir = write_run_report(dir, summary).await?;
        info!(path = %run_dir.display(), "run report written");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Preview(run) => {
            let ids = run.item_ids()?;
            let config = run.apply(MigrationConfig::from_env());
            let summary = preview(&config, &ids).await?;
            finish(&config, &summary).await?;
        }
        Commands::Migrate { run, dry_run } => {
            let ids = run.item_ids()?;
            let config = run.apply(MigrationConfig::from_env());
            if config.api_key.is_empty() && !dry_run {
                warn!("no API key configured; destination writes will likely be rejected");
            }
            let mut pipeline = build_pipeline(&config, dry_run).await?;
            let summary = pipeline.migrate(&ids, print_report).await;
            finish(&config, &summary).await?;
        }
    }

    Ok(())
}
