//! In-process store with the same write semantics as the Postgres sink
//!
//! Used by `--dry-run` and by tests. Foreign keys are checked at write time,
//! as a store with immediate constraint checking would.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use geotweets_common::types::{ActorRow, EventRow, PlaceRow};

use super::RecordSink;
use crate::error::{IngestError, IngestResult};

/// Committed contents of the in-memory store
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub actors: BTreeMap<i64, ActorRow>,
    pub places: BTreeMap<String, PlaceRow>,
    pub events: BTreeMap<i64, EventRow>,
    pub commits: usize,
}

impl MemoryStore {
    pub fn shared() -> Arc<Mutex<MemoryStore>> {
        Arc::new(Mutex::new(MemoryStore::default()))
    }
}

#[derive(Debug, Clone)]
enum Write {
    Actor(ActorRow),
    Place(PlaceRow),
    Event(EventRow),
}

/// One connection's view of a shared [`MemoryStore`]
pub struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
    pending: Vec<Write>,
    savepoint: Option<usize>,
}

impl MemorySink {
    pub fn new(store: Arc<Mutex<MemoryStore>>) -> Self {
        Self {
            store,
            pending: Vec::new(),
            savepoint: None,
        }
    }

    /// Writes staged in the open transaction
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    fn lock(&self) -> IngestResult<MutexGuard<'_, MemoryStore>> {
        self.store
            .lock()
            .map_err(|_| IngestError::StoreUnavailable("memory store poisoned".to_string()))
    }

    fn actor_visible(&self, store: &MemoryStore, id: i64) -> bool {
        store.actors.contains_key(&id)
            || self
                .pending
                .iter()
                .any(|w| matches!(w, Write::Actor(a) if a.id == id))
    }

    fn place_visible(&self, store: &MemoryStore, id: &str) -> bool {
        store.places.contains_key(id)
            || self
                .pending
                .iter()
                .any(|w| matches!(w, Write::Place(p) if p.id == id))
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn begin_record(&mut self) -> IngestResult<()> {
        self.savepoint = Some(self.pending.len());
        Ok(())
    }

    async fn end_record(&mut self) -> IngestResult<()> {
        self.savepoint = None;
        Ok(())
    }

    async fn abort_record(&mut self) -> IngestResult<()> {
        if let Some(mark) = self.savepoint.take() {
            self.pending.truncate(mark);
        }
        Ok(())
    }

    async fn write_actor(&mut self, actor: &ActorRow) -> IngestResult<()> {
        self.pending.push(Write::Actor(actor.clone()));
        Ok(())
    }

    async fn write_place(&mut self, place: &PlaceRow) -> IngestResult<()> {
        self.pending.push(Write::Place(place.clone()));
        Ok(())
    }

    async fn write_event(&mut self, event: &EventRow) -> IngestResult<()> {
        {
            let store = self.lock()?;
            if !self.actor_visible(&store, event.actor_id) {
                return Err(IngestError::StoreWrite(format!(
                    "event {} violates foreign key: unknown actor {}",
                    event.id, event.actor_id
                )));
            }
            if let Some(place_id) = &event.place_id {
                if !self.place_visible(&store, place_id) {
                    return Err(IngestError::StoreWrite(format!(
                        "event {} violates foreign key: unknown place {}",
                        event.id, place_id
                    )));
                }
            }
        }
        self.pending.push(Write::Event(event.clone()));
        Ok(())
    }

    async fn commit(&mut self) -> IngestResult<()> {
        let writes = std::mem::take(&mut self.pending);
        self.savepoint = None;

        let mut store = self.lock()?;
        for write in writes {
            // first writer wins
            match write {
                Write::Actor(a) => {
                    store.actors.entry(a.id).or_insert(a);
                },
                Write::Place(p) => {
                    store.places.entry(p.id.clone()).or_insert(p);
                },
                Write::Event(e) => {
                    store.events.entry(e.id).or_insert(e);
                },
            }
        }
        store.commits += 1;
        Ok(())
    }

    async fn close(&mut self) -> IngestResult<()> {
        self.pending.clear();
        self.savepoint = None;
        Ok(())
    }
}
