//! Geotweets Ingest - load geotagged events into a spatial store

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geotweets_common::logging::{init_logging, LogConfig, LogLevel};
use geotweets_common::types::SchemaVersion;
use geotweets_ingest::config::IngestConfig;
use geotweets_ingest::normalize::Normalizer;
use geotweets_ingest::packed::PackedSink;
use geotweets_ingest::pipeline::{
    run_json_shard, run_packed_shard, PipelineSettings, PipelineStats, ProgressReporter,
};
use geotweets_ingest::shard::{CoordinatorReport, Partition, ShardCoordinator};
use geotweets_ingest::sink::{MemoryStore, StoreTarget};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "geotweets-ingest")]
#[command(author, version, about = "Load geotagged tweets into PostGIS")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Store connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Successfully applied records per commit
    #[arg(long, global = true)]
    commit_interval: Option<usize>,

    /// Shards processed at the same time
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Store schema generation (legacy or current)
    #[arg(long, global = true)]
    schema: Option<SchemaVersion>,

    /// Write to an in-memory store instead of the database
    #[arg(long, global = true)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load JSON-lines files, one shard per file
    Import {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Normalize one JSON-lines file into packed partitions
    Pack {
        input: PathBuf,

        #[arg(short, long)]
        out_dir: PathBuf,

        #[arg(short, long, default_value_t = 1)]
        shards: usize,
    },

    /// Load packed partitions in parallel
    Load {
        #[arg(short, long)]
        dir: PathBuf,

        #[arg(short, long, default_value_t = 1)]
        shards: usize,
    },
}

impl Cli {
    fn config(&self) -> Result<IngestConfig> {
        let mut config = IngestConfig::load().context("Failed to load configuration")?;
        if let Some(url) = &self.database_url {
            config.store.url = url.clone();
        }
        if let Some(interval) = self.commit_interval {
            config.commit_interval = interval;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(schema) = self.schema {
            config.schema = schema;
        }
        config.validate()?;
        Ok(config)
    }
}

fn shard_progress(multi: &MultiProgress, label: String) -> Arc<dyn ProgressReporter> {
    let pb = multi.add(ProgressBar::new_spinner());
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {pos} records {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(label);
    pb.enable_steady_tick(Duration::from_millis(120));
    Arc::new(pb)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("geotweets-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let guard = init_logging(&log_config)?;

    let config = cli.config()?;
    let settings = PipelineSettings {
        normalizer: Normalizer::new(config.capabilities()),
        commit_interval: config.commit_interval,
    };

    let target = if cli.dry_run {
        StoreTarget::Memory(MemoryStore::shared())
    } else {
        StoreTarget::Postgres(config.store.clone())
    };

    let multi = MultiProgress::new();

    let report = match cli.command {
        Command::Import { paths } => {
            info!(files = paths.len(), store = target.describe(), schema = %config.schema, "Importing");
            run_shards(&config, settings, target, &multi, Partition::json_files(paths)).await
        },
        Command::Pack {
            input,
            out_dir,
            shards,
        } => {
            info!(input = %input.display(), out_dir = %out_dir.display(), shards, "Packing");
            let sink = PackedSink::create(&out_dir, shards).await?;
            let progress = shard_progress(&multi, format!("pack {}", input.display()));
            let stats = run_json_shard(0, &input, settings, sink, progress).await?;
            summarize_pack(&stats);
            return Ok(());
        },
        Command::Load { dir, shards } => {
            info!(dir = %dir.display(), shards, store = target.describe(), "Loading packed partitions");
            run_shards(&config, settings, target, &multi, Partition::packed(dir, shards)).await
        },
    };

    summarize(&report, cli.dry_run);
    if !report.all_succeeded() {
        // flush file logs before exiting
        drop(guard);
        process::exit(1);
    }
    Ok(())
}

async fn run_shards(
    config: &IngestConfig,
    settings: PipelineSettings,
    target: StoreTarget,
    multi: &MultiProgress,
    partitions: Vec<Partition>,
) -> CoordinatorReport {
    let capabilities = config.capabilities();
    let multi = multi.clone();

    ShardCoordinator::new(config.workers)
        .run(partitions, move |partition| {
            let target = target.clone();
            let progress = shard_progress(&multi, partition.to_string());
            async move {
                let shard = partition.index();
                let sink = target.open(capabilities).await.map_err(|e| {
                    geotweets_ingest::IngestError::shard_fatal(shard, e)
                })?;
                match &partition {
                    Partition::JsonLines { path, .. } => {
                        run_json_shard(shard, path, settings, sink, progress).await
                    },
                    Partition::Packed { dir, .. } => {
                        run_packed_shard(shard, dir, settings, sink, progress).await
                    },
                }
            }
        })
        .await
}

fn summarize(report: &CoordinatorReport, dry_run: bool) {
    info!(
        applied = report.total_applied(),
        quarantined = report.total_quarantined(),
        commits = report.total_commits(),
        duration_seconds = report.duration_seconds,
        dry_run,
        "Ingestion complete"
    );

    for path in report.quarantine_paths() {
        warn!(quarantine = %path.display(), "Failed records were quarantined");
    }

    for (shard, reason) in report.failed() {
        error!(shard, reason, "Shard did not finish; rerun it to resume");
    }

    println!(
        "{} records applied, {} quarantined, {} shard(s) failed",
        report.total_applied(),
        report.total_quarantined(),
        report.failed().count()
    );
}

fn summarize_pack(stats: &PipelineStats) {
    info!(
        packed = stats.applied,
        quarantined = stats.quarantined,
        "Packing complete"
    );
    if let Some(path) = &stats.quarantine_path {
        warn!(quarantine = %path.display(), "Failed records were quarantined");
    }
    println!("{} records packed, {} quarantined", stats.applied, stats.quarantined);
}
