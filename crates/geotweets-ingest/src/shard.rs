//! Shard coordinator
//!
//! Runs one pipeline per input partition, at most `workers` at a time. Each
//! shard runs in its own task, so a shard that errors or panics is recorded
//! as failed while the others carry on. Shards share nothing but the store.

use futures::stream::{self, StreamExt};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::pipeline::{PipelineStats, ShardFailure};
use crate::quarantine::QuarantineReport;

/// One independent unit of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    /// A newline-delimited JSON file
    JsonLines { index: usize, path: PathBuf },
    /// Packed files with suffix `index` inside `dir`
    Packed { index: usize, dir: PathBuf },
}

impl Partition {
    pub fn index(&self) -> usize {
        match self {
            Partition::JsonLines { index, .. } | Partition::Packed { index, .. } => *index,
        }
    }

    /// One partition per input file, indexed in argument order
    pub fn json_files(paths: impl IntoIterator<Item = PathBuf>) -> Vec<Partition> {
        paths
            .into_iter()
            .enumerate()
            .map(|(index, path)| Partition::JsonLines { index, path })
            .collect()
    }

    pub fn packed(dir: impl Into<PathBuf>, shards: usize) -> Vec<Partition> {
        let dir = dir.into();
        (0..shards)
            .map(|index| Partition::Packed {
                index,
                dir: dir.clone(),
            })
            .collect()
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::JsonLines { index, path } => write!(f, "#{} {}", index, path.display()),
            Partition::Packed { index, dir } => write!(f, "#{} {} (packed)", index, dir.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    Completed(PipelineStats),
    Failed {
        shard: usize,
        error: String,
        /// Lines quarantined before the shard stopped
        quarantine: Option<QuarantineReport>,
    },
}

impl ShardOutcome {
    pub fn shard(&self) -> usize {
        match self {
            ShardOutcome::Completed(stats) => stats.shard,
            ShardOutcome::Failed { shard, .. } => *shard,
        }
    }
}

/// Per-shard outcomes, ordered by shard index
#[derive(Debug, Clone, Default)]
pub struct CoordinatorReport {
    pub outcomes: Vec<ShardOutcome>,
    pub duration_seconds: f64,
}

impl CoordinatorReport {
    pub fn completed(&self) -> impl Iterator<Item = &PipelineStats> {
        self.outcomes.iter().filter_map(|o| match o {
            ShardOutcome::Completed(stats) => Some(stats),
            ShardOutcome::Failed { .. } => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (usize, &str)> {
        self.outcomes.iter().filter_map(|o| match o {
            ShardOutcome::Failed { shard, error, .. } => Some((*shard, error.as_str())),
            ShardOutcome::Completed(_) => None,
        })
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn total_applied(&self) -> u64 {
        self.completed().map(|s| s.applied).sum()
    }

    /// Includes lines quarantined by shards that later failed
    pub fn total_quarantined(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o {
                ShardOutcome::Completed(stats) => stats.quarantined,
                ShardOutcome::Failed { quarantine, .. } => {
                    quarantine.as_ref().map_or(0, |q| q.count)
                },
            })
            .sum()
    }

    pub fn total_commits(&self) -> usize {
        self.completed().map(|s| s.commits).sum()
    }

    pub fn quarantine_paths(&self) -> Vec<&PathBuf> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ShardOutcome::Completed(stats) => stats.quarantine_path.as_ref(),
                ShardOutcome::Failed { quarantine, .. } => quarantine.as_ref().map(|q| &q.path),
            })
            .collect()
    }
}

pub struct ShardCoordinator {
    workers: usize,
}

impl ShardCoordinator {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` for every partition and wait for all of them
    pub async fn run<F, Fut>(&self, partitions: Vec<Partition>, job: F) -> CoordinatorReport
    where
        F: Fn(Partition) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PipelineStats, ShardFailure>> + Send + 'static,
    {
        let start = Instant::now();
        let total = partitions.len();
        let job = Arc::new(job);

        info!(shards = total, workers = self.workers, "Starting shards");

        let mut outcomes: Vec<ShardOutcome> = stream::iter(partitions)
            .map(|partition| {
                let job = Arc::clone(&job);
                async move {
                    let shard = partition.index();
                    let label = partition.to_string();
                    info!(shard, partition = %label, "Starting shard");

                    match tokio::spawn(async move { job(partition).await }).await {
                        Ok(Ok(stats)) => ShardOutcome::Completed(stats),
                        Ok(Err(failure)) => {
                            error!(
                                shard,
                                partition = %label,
                                error = %failure.error,
                                quarantine = ?failure.quarantine.as_ref().map(|q| &q.path),
                                "Shard failed"
                            );
                            ShardOutcome::Failed {
                                shard,
                                error: failure.error.to_string(),
                                quarantine: failure.quarantine,
                            }
                        },
                        Err(join) => {
                            let error = if join.is_panic() {
                                "shard panicked".to_string()
                            } else {
                                join.to_string()
                            };
                            error!(shard, partition = %label, error = %error, "Shard task died");
                            ShardOutcome::Failed {
                                shard,
                                error,
                                quarantine: None,
                            }
                        },
                    }
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        outcomes.sort_by_key(ShardOutcome::shard);

        let report = CoordinatorReport {
            outcomes,
            duration_seconds: start.elapsed().as_secs_f64(),
        };

        info!(
            shards = total,
            failed = report.failed().count(),
            applied = report.total_applied(),
            quarantined = report.total_quarantined(),
            duration_seconds = report.duration_seconds,
            "All shards finished"
        );
        report
    }
}
