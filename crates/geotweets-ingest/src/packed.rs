//! Packed intermediate rows
//!
//! A pack pass normalizes JSON input once and writes the rows as MessagePack
//! arrays, one value after another, into per-shard files:
//! `actors{i}.msgpack`, `places{i}.msgpack`, `events{i}.msgpack`. Rows keep
//! the column order of their table, so each packed value is the tuple the
//! loader binds.
//!
//! All rows of one record land in the same shard, so a shard's events only
//! reference actors and places loaded earlier by that same shard.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info};

use geotweets_common::types::{ActorRow, EventRow, PlaceRow};

use crate::error::{IngestError, IngestResult};
use crate::sink::RecordSink;

/// Which table a packed file feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Actor,
    Place,
    Event,
}

impl RowKind {
    /// Load order; events last so their references already exist
    pub const LOAD_ORDER: [RowKind; 3] = [RowKind::Actor, RowKind::Place, RowKind::Event];

    pub fn file_stem(self) -> &'static str {
        match self {
            RowKind::Actor => "actors",
            RowKind::Place => "places",
            RowKind::Event => "events",
        }
    }

    fn slot(self) -> usize {
        match self {
            RowKind::Actor => 0,
            RowKind::Place => 1,
            RowKind::Event => 2,
        }
    }
}

pub fn partition_file(dir: &Path, kind: RowKind, index: usize) -> PathBuf {
    dir.join(format!("{}{}.msgpack", kind.file_stem(), index))
}

/// One decoded packed row, typed by its table
#[derive(Debug, Clone, PartialEq)]
pub enum PackedRow {
    Actor(ActorRow),
    Place(PlaceRow),
    Event(EventRow),
}

impl PackedRow {
    /// Interpret a decoded tuple as a row of `kind`; arity and types must match
    pub fn from_value(kind: RowKind, value: Value) -> IngestResult<Self> {
        fn typed<T: DeserializeOwned>(kind: RowKind, value: Value) -> IngestResult<T> {
            serde_json::from_value(value).map_err(|e| {
                IngestError::malformed(format!("packed {} row: {}", kind.file_stem(), e))
            })
        }

        Ok(match kind {
            RowKind::Actor => PackedRow::Actor(typed(kind, value)?),
            RowKind::Place => PackedRow::Place(typed(kind, value)?),
            RowKind::Event => PackedRow::Event(typed(kind, value)?),
        })
    }
}

/// Rows decoded ahead of the loader
const READ_AHEAD: usize = 256;

/// Sequential reader over one packed file
///
/// Rows are decoded on a blocking thread and handed over through a bounded
/// channel, so only a window of the partition is held in memory.
pub struct PackedReader {
    path: PathBuf,
    rows: mpsc::Receiver<IngestResult<Value>>,
}

impl PackedReader {
    pub async fn open(path: impl Into<PathBuf>) -> IngestResult<Self> {
        let path = path.into();
        let file = File::open(&path).await?.into_std().await;
        debug!(path = %path.display(), "Opened packed file");

        let (tx, rows) = mpsc::channel(READ_AHEAD);
        let source = path.clone();
        tokio::task::spawn_blocking(move || decode_rows(&source, file, tx));

        Ok(Self { path, rows })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next tuple, or `None` at end of file
    ///
    /// A decode error leaves the stream position unknown, so it is reported
    /// as an I/O error rather than a bad row, and nothing follows it.
    pub async fn next_value(&mut self) -> IngestResult<Option<Value>> {
        self.rows.recv().await.transpose()
    }
}

fn decode_rows(path: &Path, file: std::fs::File, tx: mpsc::Sender<IngestResult<Value>>) {
    let mut reader = std::io::BufReader::new(file);
    let mut row = 0u64;
    loop {
        let at_end = match reader.fill_buf() {
            Ok(buf) => buf.is_empty(),
            Err(e) => {
                let _ = tx.blocking_send(Err(e.into()));
                return;
            },
        };
        if at_end {
            return;
        }

        let decoded = rmp_serde::from_read::<_, Value>(&mut reader).map_err(|e| {
            IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} at row {}: {}", path.display(), row, e),
            ))
        });
        let failed = decoded.is_err();
        // a closed channel means the loader gave up on this shard
        if tx.blocking_send(decoded).is_err() || failed {
            return;
        }
        row += 1;
    }
}

struct PartitionWriter {
    files: [BufWriter<File>; 3],
}

impl PartitionWriter {
    async fn create(dir: &Path, index: usize) -> IngestResult<Self> {
        let open = |kind| {
            let path = partition_file(dir, kind, index);
            async move { File::create(&path).await.map(BufWriter::new) }
        };
        Ok(Self {
            files: [
                open(RowKind::Actor).await?,
                open(RowKind::Place).await?,
                open(RowKind::Event).await?,
            ],
        })
    }

    async fn flush(&mut self) -> IngestResult<()> {
        for file in &mut self.files {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Sink that writes packed rows instead of touching a store
///
/// Records are distributed round-robin over `shards` partitions. A record's
/// rows are buffered until `end_record`, so an aborted record leaves no
/// trace in any file.
pub struct PackedSink {
    dir: PathBuf,
    writers: Vec<PartitionWriter>,
    staged: Vec<(RowKind, Vec<u8>)>,
    records: usize,
}

impl PackedSink {
    pub async fn create(dir: impl Into<PathBuf>, shards: usize) -> IngestResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut writers = Vec::with_capacity(shards.max(1));
        for index in 0..shards.max(1) {
            writers.push(PartitionWriter::create(&dir, index).await?);
        }

        info!(dir = %dir.display(), shards = writers.len(), "Created packed partitions");
        Ok(Self {
            dir,
            writers,
            staged: Vec::new(),
            records: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stage<T: Serialize>(&mut self, kind: RowKind, row: &T) -> IngestResult<()> {
        let bytes = rmp_serde::to_vec(row)
            .map_err(|e| IngestError::StoreWrite(format!("pack {}: {}", kind.file_stem(), e)))?;
        self.staged.push((kind, bytes));
        Ok(())
    }
}

#[async_trait]
impl RecordSink for PackedSink {
    async fn begin_record(&mut self) -> IngestResult<()> {
        self.staged.clear();
        Ok(())
    }

    async fn end_record(&mut self) -> IngestResult<()> {
        let shard = self.records % self.writers.len();
        let writer = &mut self.writers[shard];
        for (kind, bytes) in self.staged.drain(..) {
            writer.files[kind.slot()].write_all(&bytes).await?;
        }
        self.records += 1;
        Ok(())
    }

    async fn abort_record(&mut self) -> IngestResult<()> {
        self.staged.clear();
        Ok(())
    }

    async fn write_actor(&mut self, actor: &ActorRow) -> IngestResult<()> {
        self.stage(RowKind::Actor, actor)
    }

    async fn write_place(&mut self, place: &PlaceRow) -> IngestResult<()> {
        self.stage(RowKind::Place, place)
    }

    async fn write_event(&mut self, event: &EventRow) -> IngestResult<()> {
        self.stage(RowKind::Event, event)
    }

    async fn commit(&mut self) -> IngestResult<()> {
        for writer in &mut self.writers {
            writer.flush().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> IngestResult<()> {
        self.staged.clear();
        for writer in &mut self.writers {
            writer.flush().await?;
        }
        Ok(())
    }
}
