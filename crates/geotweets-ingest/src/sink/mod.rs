//! Persistence sinks
//!
//! A sink owns one store connection and at most one open transaction. Every
//! write is insert-or-skip on the primary key, so replaying rows after a
//! crash is harmless. Each record is bracketed by `begin_record` /
//! `end_record`; `abort_record` discards that record's writes without
//! touching the rest of the open transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use geotweets_common::types::{ActorRow, EventRow, NormalizedRecord, PlaceRow, SchemaCapabilities};

use crate::config::StoreConfig;
use crate::error::IngestResult;

pub use memory::{MemorySink, MemoryStore};
pub use postgres::PgSink;

#[async_trait]
pub trait RecordSink: Send {
    /// Mark the start of one record's writes
    async fn begin_record(&mut self) -> IngestResult<()>;

    /// Keep the writes made since `begin_record`
    async fn end_record(&mut self) -> IngestResult<()>;

    /// Discard the writes made since `begin_record`
    async fn abort_record(&mut self) -> IngestResult<()>;

    async fn write_actor(&mut self, actor: &ActorRow) -> IngestResult<()>;

    async fn write_place(&mut self, place: &PlaceRow) -> IngestResult<()>;

    async fn write_event(&mut self, event: &EventRow) -> IngestResult<()>;

    /// Commit the open transaction; the next write opens a new one
    async fn commit(&mut self) -> IngestResult<()>;

    /// Release the connection, discarding anything not committed
    async fn close(&mut self) -> IngestResult<()>;
}

/// Write one normalized record: actor, then place, then event
///
/// Errors are returned untouched; the caller decides between quarantine and
/// aborting the shard.
pub async fn apply<S: RecordSink + ?Sized>(
    sink: &mut S,
    record: &NormalizedRecord,
) -> IngestResult<()> {
    sink.write_actor(&record.actor).await?;
    if let Some(place) = &record.place {
        sink.write_place(place).await?;
    }
    sink.write_event(&record.event).await
}

#[async_trait]
impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    async fn begin_record(&mut self) -> IngestResult<()> {
        (**self).begin_record().await
    }

    async fn end_record(&mut self) -> IngestResult<()> {
        (**self).end_record().await
    }

    async fn abort_record(&mut self) -> IngestResult<()> {
        (**self).abort_record().await
    }

    async fn write_actor(&mut self, actor: &ActorRow) -> IngestResult<()> {
        (**self).write_actor(actor).await
    }

    async fn write_place(&mut self, place: &PlaceRow) -> IngestResult<()> {
        (**self).write_place(place).await
    }

    async fn write_event(&mut self, event: &EventRow) -> IngestResult<()> {
        (**self).write_event(event).await
    }

    async fn commit(&mut self) -> IngestResult<()> {
        (**self).commit().await
    }

    async fn close(&mut self) -> IngestResult<()> {
        (**self).close().await
    }
}

/// Where shard sinks write to
#[derive(Clone)]
pub enum StoreTarget {
    Postgres(StoreConfig),
    /// Shared in-process store, for dry runs
    Memory(Arc<Mutex<MemoryStore>>),
}

impl StoreTarget {
    /// Open a fresh sink for one shard
    pub async fn open(&self, capabilities: SchemaCapabilities) -> IngestResult<Box<dyn RecordSink>> {
        Ok(match self {
            StoreTarget::Postgres(config) => Box::new(PgSink::connect(config, capabilities).await?),
            StoreTarget::Memory(store) => Box::new(MemorySink::new(store.clone())),
        })
    }

    pub fn describe(&self) -> &'static str {
        match self {
            StoreTarget::Postgres(_) => "postgres",
            StoreTarget::Memory(_) => "memory",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use serde_json::json;

    #[tokio::test]
    async fn test_boxed_memory_sink_applies_record() {
        let store = MemoryStore::shared();
        let target = StoreTarget::Memory(store.clone());
        let mut sink = target.open(SchemaCapabilities::default()).await.unwrap();

        let line = json!({
            "id": 7,
            "user": {
                "id": 3, "name": "a", "screen_name": "a_", "description": null,
                "verified": false, "geo_enabled": true, "statuses_count": 1,
                "followers_count": 1, "friends_count": 1, "time_zone": null,
                "lang": null, "location": null
            },
            "entities": {},
            "text": "hi", "created_at": "Wed Aug 27 13:08:45 +0000 2008", "lang": "en",
            "coordinates": {"type": "Point", "coordinates": [1.0, 2.0]}
        })
        .to_string();
        let record = Normalizer::default().normalize_line(&line).unwrap();

        sink.begin_record().await.unwrap();
        apply(&mut sink, &record).await.unwrap();
        sink.end_record().await.unwrap();
        sink.commit().await.unwrap();
        sink.close().await.unwrap();

        let store = store.lock().unwrap();
        assert_eq!(target.describe(), "memory");
        assert!(store.actors.contains_key(&3));
        assert!(store.events.contains_key(&7));
    }
}
