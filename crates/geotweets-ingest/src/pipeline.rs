//! Per-shard ingestion pipeline
//!
//! One pipeline instance owns one sink (one connection, one transaction),
//! one quarantine file and its own counters. Records are handled strictly
//! one at a time:
//!
//! ```text
//! line -> normalize -> SAVEPOINT -> actor, place, event -> RELEASE -> maybe commit
//!                    \-> on a record-scoped error: ROLLBACK TO SAVEPOINT, quarantine
//! ```
//!
//! A record picked as a deadlock victim is rolled back and applied again, up
//! to `MAX_ATTEMPTS` times, before it is quarantined.
//!
//! Store failures that look like a lost connection, and failures of the
//! savepoint/commit statements themselves, end the shard instead.

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, instrument};

use geotweets_common::types::NormalizedRecord;

use crate::committer::BatchCommitter;
use crate::error::{IngestError, IngestResult};
use crate::normalize::Normalizer;
use crate::packed::{partition_file, PackedReader, PackedRow, RowKind};
use crate::quarantine::{Quarantine, QuarantineReport};
use crate::sink::{apply, RecordSink};

/// Counters owned by one pipeline instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub shard: usize,
    /// Records (or packed rows) read, excluding blank lines
    pub processed: u64,
    /// Records handed to the sink without error
    pub applied: u64,
    pub quarantined: u64,
    pub commits: usize,
    /// Set when at least one record was quarantined
    pub quarantine_path: Option<PathBuf>,
}

/// Receives counter snapshots as a shard makes progress
pub trait ProgressReporter: Send + Sync {
    fn report(&self, stats: &PipelineStats);

    fn finish(&self, _stats: &PipelineStats) {}
}

/// Discards progress updates
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _stats: &PipelineStats) {}
}

impl ProgressReporter for indicatif::ProgressBar {
    fn report(&self, stats: &PipelineStats) {
        self.set_position(stats.processed);
        if stats.quarantined > 0 {
            self.set_message(format!("shard {} ({} quarantined)", stats.shard, stats.quarantined));
        }
    }

    fn finish(&self, stats: &PipelineStats) {
        self.finish_with_message(format!(
            "shard {}: {} applied, {} quarantined",
            stats.shard, stats.applied, stats.quarantined
        ));
    }
}

/// Shard-fatal error, plus the quarantine the shard left behind
#[derive(Error, Debug)]
#[error("{error}")]
pub struct ShardFailure {
    pub error: IngestError,
    /// Set when lines were quarantined before the shard aborted
    pub quarantine: Option<QuarantineReport>,
}

impl From<IngestError> for ShardFailure {
    fn from(error: IngestError) -> Self {
        Self {
            error,
            quarantine: None,
        }
    }
}

/// Settings shared by every shard of a run
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub normalizer: Normalizer,
    pub commit_interval: usize,
}

pub struct ShardPipeline<S> {
    normalizer: Normalizer,
    committer: BatchCommitter<S>,
    quarantine: Quarantine,
    stats: PipelineStats,
    progress: Arc<dyn ProgressReporter>,
}

/// Attempts per record when the store picks it as a deadlock victim
const MAX_ATTEMPTS: usize = 3;

/// Failures of the bracketing statements poison the transaction
fn escalate(err: IngestError) -> IngestError {
    if err.is_record_scoped() {
        IngestError::StoreUnavailable(err.to_string())
    } else {
        err
    }
}

impl<S: RecordSink> ShardPipeline<S> {
    pub fn new(
        shard: usize,
        settings: PipelineSettings,
        sink: S,
        quarantine: Quarantine,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            normalizer: settings.normalizer,
            committer: BatchCommitter::new(sink, settings.commit_interval),
            quarantine,
            stats: PipelineStats {
                shard,
                ..PipelineStats::default()
            },
            progress,
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Handle one raw JSON line; only shard-fatal errors are returned
    pub async fn ingest_line(&mut self, raw: &[u8]) -> IngestResult<()> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        self.stats.processed += 1;

        let outcome = match std::str::from_utf8(raw) {
            Ok(line) => match self.normalizer.normalize_line(line) {
                Ok(record) => self.apply_isolated(&record).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(IngestError::malformed(format!("line is not UTF-8: {}", e))),
        };

        self.settle(raw, outcome).await
    }

    /// Read newline-delimited JSON until end of input
    pub async fn ingest_lines<R: AsyncBufRead + Unpin>(&mut self, mut reader: R) -> IngestResult<()> {
        let mut buf = Vec::with_capacity(4096);
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                return Ok(());
            }
            self.ingest_line(&buf).await?;
        }
    }

    /// Handle one decoded packed row; only shard-fatal errors are returned
    pub async fn ingest_packed(&mut self, kind: RowKind, value: Value) -> IngestResult<()> {
        self.stats.processed += 1;
        let raw = value.to_string();

        let outcome = match PackedRow::from_value(kind, value) {
            Ok(row) => self.write_isolated(&row).await,
            Err(e) => Err(e),
        };

        self.settle(raw.as_bytes(), outcome).await
    }

    async fn apply_isolated(&mut self, record: &NormalizedRecord) -> IngestResult<()> {
        let sink = self.committer.sink_mut();
        let mut attempt = 1;
        loop {
            sink.begin_record().await.map_err(escalate)?;
            match apply(sink, record).await {
                Ok(()) => return sink.end_record().await.map_err(escalate),
                Err(e) => {
                    sink.abort_record().await.map_err(escalate)?;
                    if !e.is_retryable() || attempt == MAX_ATTEMPTS {
                        return Err(e);
                    }
                    debug!(attempt, event = record.event.id, error = %e, "Retrying record");
                    attempt += 1;
                },
            }
        }
    }

    async fn write_isolated(&mut self, row: &PackedRow) -> IngestResult<()> {
        let sink = self.committer.sink_mut();
        let mut attempt = 1;
        loop {
            sink.begin_record().await.map_err(escalate)?;
            let written = match row {
                PackedRow::Actor(actor) => sink.write_actor(actor).await,
                PackedRow::Place(place) => sink.write_place(place).await,
                PackedRow::Event(event) => sink.write_event(event).await,
            };
            match written {
                Ok(()) => return sink.end_record().await.map_err(escalate),
                Err(e) => {
                    sink.abort_record().await.map_err(escalate)?;
                    if !e.is_retryable() || attempt == MAX_ATTEMPTS {
                        return Err(e);
                    }
                    debug!(attempt, error = %e, "Retrying packed row");
                    attempt += 1;
                },
            }
        }
    }

    /// Count, commit or quarantine according to how the record went
    async fn settle(&mut self, raw: &[u8], outcome: IngestResult<()>) -> IngestResult<()> {
        match outcome {
            Ok(()) => {
                self.stats.applied += 1;
                // a failed commit loses the whole batch, not one record
                self.committer.record_applied().await.map_err(escalate)?;
            },
            Err(e) if e.is_record_scoped() => {
                self.quarantine.quarantine(raw, &e).await?;
                self.stats.quarantined += 1;
            },
            Err(e) => return Err(e),
        }

        self.stats.commits = self.committer.commits();
        self.progress.report(&self.stats);
        Ok(())
    }

    /// Commit the trailing batch and close everything the shard owns
    pub async fn finish(self) -> IngestResult<PipelineStats> {
        let mut stats = self.stats;
        stats.commits = self.committer.finish().await?;

        let report = self.quarantine.finish().await?;
        if report.count > 0 {
            stats.quarantine_path = Some(report.path);
        }

        self.progress.finish(&stats);
        info!(
            shard = stats.shard,
            processed = stats.processed,
            applied = stats.applied,
            quarantined = stats.quarantined,
            commits = stats.commits,
            "Shard finished"
        );
        Ok(stats)
    }

    /// Close without committing after a shard-fatal error
    ///
    /// Quarantined lines are kept; the uncommitted batch is replayed on the
    /// next run.
    pub async fn abandon(self) -> QuarantineReport {
        if let Err(e) = self.committer.abandon().await {
            error!(shard = self.stats.shard, error = %e, "Failed to close sink");
        }
        let path = self.quarantine.path().to_path_buf();
        let count = self.quarantine.count();
        self.quarantine
            .finish()
            .await
            .unwrap_or(QuarantineReport { path, count })
    }

    /// Load decoded rows, one file after another
    pub async fn load_partition(&mut self, readers: Vec<(RowKind, PackedReader)>) -> IngestResult<()> {
        for (kind, mut reader) in readers {
            debug!(path = %reader.path().display(), "Loading packed file");
            while let Some(value) = reader.next_value().await? {
                self.ingest_packed(kind, value).await?;
            }
        }
        Ok(())
    }

    /// Finish on success, abandon on a shard-fatal error
    pub async fn conclude(self, result: IngestResult<()>) -> Result<PipelineStats, ShardFailure> {
        match result {
            Ok(()) => Ok(self.finish().await?),
            Err(error) => {
                let shard = self.stats.shard;
                let report = self.abandon().await;
                error!(
                    shard,
                    error = %error,
                    quarantined = report.count,
                    quarantine = %report.path.display(),
                    "Shard aborted"
                );
                Err(ShardFailure {
                    error,
                    quarantine: Some(report).filter(|r| r.count > 0),
                })
            },
        }
    }
}

/// Ingest one newline-delimited JSON file
#[instrument(skip(path, sink, settings, progress), fields(path = %path.display()))]
pub async fn run_json_shard<S: RecordSink + 'static>(
    shard: usize,
    path: &Path,
    settings: PipelineSettings,
    sink: S,
    progress: Arc<dyn ProgressReporter>,
) -> Result<PipelineStats, ShardFailure> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| IngestError::shard_fatal(shard, format!("open {}: {}", path.display(), e)))?;

    info!(shard, "Ingesting JSON lines");
    let mut pipeline = ShardPipeline::new(shard, settings, sink, Quarantine::beside(path), progress);
    let result = pipeline.ingest_lines(BufReader::new(file)).await;
    pipeline.conclude(result).await
}

/// Load one packed partition: actors, then places, then events
#[instrument(skip(dir, sink, settings, progress), fields(dir = %dir.display()))]
pub async fn run_packed_shard<S: RecordSink + 'static>(
    shard: usize,
    dir: &Path,
    settings: PipelineSettings,
    sink: S,
    progress: Arc<dyn ProgressReporter>,
) -> Result<PipelineStats, ShardFailure> {
    let mut readers = Vec::with_capacity(RowKind::LOAD_ORDER.len());
    for kind in RowKind::LOAD_ORDER {
        let path = partition_file(dir, kind, shard);
        let reader = PackedReader::open(&path).await.map_err(|e| {
            IngestError::shard_fatal(shard, format!("open {}: {}", path.display(), e))
        })?;
        readers.push((kind, reader));
    }

    info!(shard, "Loading packed partition");
    let quarantine = Quarantine::new(dir.join(format!("errors{}.json", shard)));
    let mut pipeline = ShardPipeline::new(shard, settings, sink, quarantine, progress);
    let result = pipeline.load_partition(readers).await;
    pipeline.conclude(result).await
}
