//! Batch committer
//!
//! Commits after every `interval` successfully applied records and once more
//! at end of stream if anything is still pending. Failed records never count
//! toward the interval and never trigger a commit, so for X successful
//! records exactly `ceil(X / interval)` commits are issued.

use tracing::debug;

use crate::error::IngestResult;
use crate::sink::RecordSink;

pub struct BatchCommitter<S> {
    sink: S,
    interval: usize,
    pending: usize,
    commits: usize,
}

impl<S: RecordSink> BatchCommitter<S> {
    pub fn new(sink: S, interval: usize) -> Self {
        Self {
            sink,
            interval: interval.max(1),
            pending: 0,
            commits: 0,
        }
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Records applied since the last commit
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Count one applied record, committing when the interval is reached
    pub async fn record_applied(&mut self) -> IngestResult<()> {
        self.pending += 1;
        if self.pending >= self.interval {
            self.commit().await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> IngestResult<()> {
        self.sink.commit().await?;
        self.commits += 1;
        debug!(records = self.pending, commits = self.commits, "Committed batch");
        self.pending = 0;
        Ok(())
    }

    /// Commit the trailing batch and release the sink
    pub async fn finish(mut self) -> IngestResult<usize> {
        if self.pending > 0 {
            self.commit().await?;
        }
        self.sink.close().await?;
        Ok(self.commits)
    }

    /// Release the sink without committing the trailing batch
    pub async fn abandon(mut self) -> IngestResult<()> {
        self.sink.close().await
    }
}
