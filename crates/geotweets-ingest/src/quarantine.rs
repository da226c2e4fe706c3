//! Error quarantine
//!
//! Lines that fail to normalize or persist are copied verbatim, in arrival
//! order, to a side file. The file is created on the first failure and
//! flushed after every line. A run without failures removes the file left by
//! an earlier run.

use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{IngestError, IngestResult};

/// Where quarantined lines went and how many there were
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineReport {
    pub path: PathBuf,
    pub count: u64,
}

pub struct Quarantine {
    path: PathBuf,
    file: Option<File>,
    count: u64,
}

impl Quarantine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            count: 0,
        }
    }

    /// `<input>_errors.json` next to the input file
    pub fn beside(input: &Path) -> Self {
        let mut name = input.as_os_str().to_owned();
        name.push("_errors.json");
        Self::new(PathBuf::from(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Append `raw_line` and count the failure
    ///
    /// Takes bytes so lines that are not valid UTF-8 are still kept verbatim.
    pub async fn quarantine(
        &mut self,
        raw_line: impl AsRef<[u8]>,
        error: &IngestError,
    ) -> IngestResult<()> {
        warn!(
            error = %error,
            kind = error.kind(),
            quarantine = %self.path.display(),
            "Quarantined record"
        );

        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all(trim_line_ending(raw_line.as_ref())).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
        }

        self.count += 1;
        Ok(())
    }

    pub async fn finish(mut self) -> IngestResult<QuarantineReport> {
        match self.file.take() {
            Some(file) => file.sync_all().await?,
            None => match tokio::fs::remove_file(&self.path).await {
                Ok(()) => debug!(path = %self.path.display(), "Removed stale quarantine file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            },
        }
        Ok(QuarantineReport {
            path: self.path,
            count: self.count,
        })
    }
}

fn trim_line_ending(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}
