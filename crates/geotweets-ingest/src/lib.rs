//! Geotweets Ingest Library
//!
//! Loads geotagged social-media events, one JSON object per line, into a
//! relational store with spatial columns.
//!
//! # Pipeline
//!
//! - [`normalize`]: raw JSON into actor, place and event rows
//! - [`geometry`]: GeoJSON-like shapes into hex WKB
//! - [`sink`]: idempotent writes with per-record savepoints
//! - [`committer`]: commit every N applied records
//! - [`quarantine`]: failed lines kept verbatim beside the input
//! - [`shard`]: one pipeline per input file, run concurrently
//! - [`packed`]: optional two-pass mode through MessagePack partitions
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use geotweets_ingest::normalize::Normalizer;
//! use geotweets_ingest::pipeline::{run_json_shard, NoProgress, PipelineSettings};
//! use geotweets_ingest::sink::{MemorySink, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = PipelineSettings {
//!         normalizer: Normalizer::default(),
//!         commit_interval: 5000,
//!     };
//!     let sink = MemorySink::new(MemoryStore::shared());
//!     let stats = run_json_shard(0, "tweets.json".as_ref(), settings, sink, Arc::new(NoProgress)).await?;
//!     println!("{} applied, {} quarantined", stats.applied, stats.quarantined);
//!     Ok(())
//! }
//! ```

pub mod committer;
pub mod config;
pub mod error;
pub mod extract;
pub mod geometry;
pub mod normalize;
pub mod packed;
pub mod pipeline;
pub mod quarantine;
pub mod shard;
pub mod sink;

pub use error::{IngestError, IngestResult};
