//! End-to-end pipeline behaviour against the in-memory store

mod common;

use async_trait::async_trait;
use common::*;
use geotweets_common::types::{ActorRow, EventRow, PlaceRow, SchemaCapabilities};
use geotweets_ingest::error::{IngestError, IngestResult};
use geotweets_ingest::normalize::Normalizer;
use geotweets_ingest::pipeline::{run_json_shard, NoProgress, PipelineSettings, ShardPipeline};
use geotweets_ingest::quarantine::Quarantine;
use geotweets_ingest::shard::{Partition, ShardCoordinator};
use geotweets_ingest::sink::{MemorySink, MemoryStore, RecordSink};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn settings(commit_interval: usize) -> PipelineSettings {
    PipelineSettings {
        normalizer: Normalizer::new(SchemaCapabilities::default()),
        commit_interval,
    }
}

type EventFault = Box<dyn FnMut(&EventRow) -> Option<IngestError> + Send>;

/// Memory sink that fails chosen event writes the way a real store would
struct FaultySink {
    inner: MemorySink,
    event_fault: EventFault,
    fail_rollback: bool,
}

impl FaultySink {
    fn new(store: Arc<Mutex<MemoryStore>>, event_fault: EventFault) -> Self {
        Self {
            inner: MemorySink::new(store),
            event_fault,
            fail_rollback: false,
        }
    }
}

#[async_trait]
impl RecordSink for FaultySink {
    async fn begin_record(&mut self) -> IngestResult<()> {
        self.inner.begin_record().await
    }

    async fn end_record(&mut self) -> IngestResult<()> {
        self.inner.end_record().await
    }

    async fn abort_record(&mut self) -> IngestResult<()> {
        if self.fail_rollback {
            return Err(IngestError::StoreWrite("no such savepoint".to_string()));
        }
        self.inner.abort_record().await
    }

    async fn write_actor(&mut self, actor: &ActorRow) -> IngestResult<()> {
        self.inner.write_actor(actor).await
    }

    async fn write_place(&mut self, place: &PlaceRow) -> IngestResult<()> {
        self.inner.write_place(place).await
    }

    async fn write_event(&mut self, event: &EventRow) -> IngestResult<()> {
        if let Some(err) = (self.event_fault)(event) {
            return Err(err);
        }
        self.inner.write_event(event).await
    }

    async fn commit(&mut self) -> IngestResult<()> {
        self.inner.commit().await
    }

    async fn close(&mut self) -> IngestResult<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_quarantine_completeness_and_order() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();

    let bad_json = "{\"id\": 5, \"user\": ".to_string();
    let no_coords = tweet_without_coordinates(6, 60).to_string();
    let no_user = serde_json::json!({"id": 8, "text": "x"}).to_string();
    let lines = vec![
        tweet(1, 10).to_string(),
        bad_json.clone(),
        tweet(2, 20).to_string(),
        no_coords.clone(),
        tweet_at(3, 30, "pl1").to_string(),
        no_user.clone(),
        tweet(4, 10).to_string(),
    ];
    let input = write_lines(dir.path(), "tweets.json", &lines);

    let store = MemoryStore::shared();
    let stats = run_json_shard(
        0,
        &input,
        settings(2),
        MemorySink::new(store.clone()),
        Arc::new(NoProgress),
    )
    .await
    .unwrap();

    assert_eq!(stats.processed, 7);
    assert_eq!(stats.applied, 4);
    assert_eq!(stats.quarantined, 3);
    assert_eq!(stats.commits, 2);

    let quarantine_path = stats.quarantine_path.expect("quarantine file");
    assert_eq!(quarantine_path, dir.path().join("tweets.json_errors.json"));
    assert_eq!(read_lines(&quarantine_path), vec![bad_json, no_coords, no_user]);

    let store = store.lock().unwrap();
    assert_eq!(store.events.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert_eq!(store.actors.len(), 3);
    assert!(store.places.contains_key("pl1"));
    assert!(!store.actors.contains_key(&60));
}

#[tokio::test]
async fn test_null_coordinates_write_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_lines(
        dir.path(),
        "nulls.json",
        &[tweet_without_coordinates(7, 3).to_string()],
    );

    let store = MemoryStore::shared();
    let stats = run_json_shard(
        0,
        &input,
        settings(10),
        MemorySink::new(store.clone()),
        Arc::new(NoProgress),
    )
    .await
    .unwrap();

    assert_eq!(stats.quarantined, 1);
    assert_eq!(stats.commits, 0);
    let store = store.lock().unwrap();
    assert!(store.actors.is_empty());
    assert!(store.events.is_empty());
    assert_eq!(store.commits, 0);
}

#[tokio::test]
async fn test_rejected_event_rolls_back_its_actor_and_place() {
    let dir = tempfile::tempdir().unwrap();
    let rejected = tweet_at(13, 500, "lonely").to_string();
    let lines = vec![
        tweet(12, 100).to_string(),
        rejected.clone(),
        tweet(14, 100).to_string(),
    ];
    let input = write_lines(dir.path(), "tweets.json", &lines);

    let store = MemoryStore::shared();
    let sink = FaultySink::new(
        store.clone(),
        Box::new(|event: &EventRow| {
            (event.id == 13).then(|| IngestError::StoreWrite("check constraint".to_string()))
        }),
    );
    let stats = run_json_shard(0, &input, settings(100), sink, Arc::new(NoProgress))
        .await
        .unwrap();

    assert_eq!(stats.applied, 2);
    assert_eq!(stats.quarantined, 1);
    assert_eq!(read_lines(&stats.quarantine_path.unwrap()), vec![rejected]);

    let store = store.lock().unwrap();
    assert!(!store.actors.contains_key(&500));
    assert!(!store.places.contains_key("lonely"));
    assert_eq!(store.events.keys().copied().collect::<Vec<_>>(), vec![12, 14]);
}

#[tokio::test]
async fn test_failures_do_not_count_toward_commit_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mut lines: Vec<String> = (1..=5).map(|id| tweet(id, id).to_string()).collect();
    lines.insert(1, "garbage".to_string());
    lines.insert(4, tweet_without_coordinates(99, 99).to_string());
    let input = write_lines(dir.path(), "tweets.json", &lines);

    let store = MemoryStore::shared();
    let stats = run_json_shard(
        0,
        &input,
        settings(2),
        MemorySink::new(store.clone()),
        Arc::new(NoProgress),
    )
    .await
    .unwrap();

    assert_eq!(stats.applied, 5);
    assert_eq!(stats.commits, 3);
    assert_eq!(store.lock().unwrap().commits, 3);
}

#[tokio::test]
async fn test_blank_and_non_utf8_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.json");
    let mut body = Vec::new();
    body.extend_from_slice(tweet(1, 1).to_string().as_bytes());
    body.extend_from_slice(b"\n\n   \n");
    body.extend_from_slice(b"{\"text\": \"\xff\xfe\"}\r\n");
    body.extend_from_slice(tweet(2, 1).to_string().as_bytes());
    std::fs::write(&path, body).unwrap();

    let store = MemoryStore::shared();
    let stats = run_json_shard(
        0,
        &path,
        settings(10),
        MemorySink::new(store.clone()),
        Arc::new(NoProgress),
    )
    .await
    .unwrap();

    assert_eq!(stats.processed, 3);
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.quarantined, 1);
    let quarantined = std::fs::read(stats.quarantine_path.unwrap()).unwrap();
    assert_eq!(quarantined, b"{\"text\": \"\xff\xfe\"}\n");
}

#[tokio::test]
async fn test_replayed_input_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<String> = (1..=4).map(|id| tweet_at(id, 10, "pl").to_string()).collect();
    let input = write_lines(dir.path(), "tweets.json", &lines);
    let store = MemoryStore::shared();

    for _ in 0..2 {
        run_json_shard(
            0,
            &input,
            settings(3),
            MemorySink::new(store.clone()),
            Arc::new(NoProgress),
        )
        .await
        .unwrap();
    }

    let store = store.lock().unwrap();
    assert_eq!(store.events.len(), 4);
    assert_eq!(store.actors.len(), 1);
    assert_eq!(store.places.len(), 1);
}

#[tokio::test]
async fn test_shards_overlap_and_fail_independently() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let a = write_lines(
        dir.path(),
        "a.json",
        &[tweet(1, 10).to_string(), tweet(2, 20).to_string()],
    );
    let b = write_lines(
        dir.path(),
        "b.json",
        &[tweet(2, 20).to_string(), tweet(3, 10).to_string()],
    );
    let missing = dir.path().join("missing.json");

    let store = MemoryStore::shared();
    let shared = store.clone();
    let report = ShardCoordinator::new(2)
        .run(Partition::json_files(vec![a, missing, b]), move |partition| {
            let store = shared.clone();
            async move {
                let Partition::JsonLines { index, path } = partition else {
                    unreachable!("only JSON partitions here");
                };
                run_json_shard(
                    index,
                    &path,
                    settings(1),
                    MemorySink::new(store),
                    Arc::new(NoProgress),
                )
                .await
            }
        })
        .await;

    assert!(!report.all_succeeded());
    let failed: Vec<usize> = report.failed().map(|(shard, _)| shard).collect();
    assert_eq!(failed, vec![1]);
    assert_eq!(report.total_applied(), 4);

    let store = store.lock().unwrap();
    assert_eq!(store.events.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(store.actors.len(), 2);
}

#[tokio::test]
async fn test_pipeline_fed_line_by_line() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::shared();
    let mut pipeline = ShardPipeline::new(
        4,
        settings(50),
        MemorySink::new(store.clone()),
        Quarantine::new(dir.path().join("errors4.json")),
        Arc::new(NoProgress),
    );

    pipeline.ingest_line(tweet(1, 1).to_string().as_bytes()).await.unwrap();
    pipeline.ingest_line(b"[]").await.unwrap();
    assert_eq!(pipeline.stats().quarantined, 1);
    assert!(store.lock().unwrap().events.is_empty());

    let stats = pipeline.finish().await.unwrap();
    assert_eq!(stats.shard, 4);
    assert_eq!(stats.commits, 1);
    assert_eq!(store.lock().unwrap().events.len(), 1);
}

#[tokio::test]
async fn test_clean_rerun_leaves_no_quarantine_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::shared();

    let input = write_lines(
        dir.path(),
        "tweets.json",
        &["garbage".to_string(), tweet(1, 1).to_string()],
    );
    let first = run_json_shard(
        0,
        &input,
        settings(10),
        MemorySink::new(store.clone()),
        Arc::new(NoProgress),
    )
    .await
    .unwrap();
    let quarantine_path = first.quarantine_path.expect("quarantine file");
    assert_eq!(read_lines(&quarantine_path), vec!["garbage".to_string()]);

    write_lines(dir.path(), "tweets.json", &[tweet(1, 1).to_string()]);
    let second = run_json_shard(
        0,
        &input,
        settings(10),
        MemorySink::new(store),
        Arc::new(NoProgress),
    )
    .await
    .unwrap();

    assert_eq!(second.quarantined, 0);
    assert_eq!(second.quarantine_path, None);
    assert!(!quarantine_path.exists());
}

#[tokio::test]
async fn test_store_outage_aborts_shard_and_keeps_earlier_commits() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<String> = (1..=5).map(|id| tweet(id, id).to_string()).collect();
    let input = write_lines(dir.path(), "tweets.json", &lines);

    let store = MemoryStore::shared();
    let sink = FaultySink::new(
        store.clone(),
        Box::new(|event: &EventRow| {
            (event.id >= 4).then(|| IngestError::StoreUnavailable("connection reset".to_string()))
        }),
    );
    let failure = run_json_shard(0, &input, settings(2), sink, Arc::new(NoProgress))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, IngestError::StoreUnavailable(_)));
    assert_eq!(failure.quarantine, None);
    assert!(!dir.path().join("tweets.json_errors.json").exists());

    let store = store.lock().unwrap();
    assert_eq!(store.events.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(store.commits, 1);
}

#[tokio::test]
async fn test_failed_rollback_is_shard_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<String> = (1..=3).map(|id| tweet(id, id).to_string()).collect();
    let input = write_lines(dir.path(), "tweets.json", &lines);

    let store = MemoryStore::shared();
    let mut sink = FaultySink::new(
        store.clone(),
        Box::new(|event: &EventRow| {
            (event.id == 2).then(|| IngestError::StoreWrite("check constraint".to_string()))
        }),
    );
    sink.fail_rollback = true;

    let failure = run_json_shard(0, &input, settings(1), sink, Arc::new(NoProgress))
        .await
        .unwrap_err();

    // the record error is not quarantined once its rollback failed
    assert!(matches!(failure.error, IngestError::StoreUnavailable(_)));
    assert_eq!(failure.quarantine, None);
    assert_eq!(store.lock().unwrap().events.keys().copied().collect::<Vec<_>>(), vec![1]);
}

#[tokio::test]
async fn test_aborted_shard_reports_quarantine_location() {
    let dir = tempfile::tempdir().unwrap();
    let lines = vec![
        "garbage".to_string(),
        tweet(1, 1).to_string(),
        tweet(2, 2).to_string(),
    ];
    let input = write_lines(dir.path(), "tweets.json", &lines);

    let sink = FaultySink::new(
        MemoryStore::shared(),
        Box::new(|event: &EventRow| {
            (event.id == 2).then(|| IngestError::StoreUnavailable("connection reset".to_string()))
        }),
    );
    let partitions = Partition::json_files(vec![input.clone()]);
    let sink = Arc::new(Mutex::new(Some(sink)));
    let report = ShardCoordinator::new(1)
        .run(partitions, move |partition| {
            let sink = sink.lock().unwrap().take().expect("one shard");
            async move {
                let Partition::JsonLines { index, path } = partition else {
                    unreachable!("only JSON partitions here");
                };
                run_json_shard(index, &path, settings(10), sink, Arc::new(NoProgress)).await
            }
        })
        .await;

    let expected = dir.path().join("tweets.json_errors.json");
    assert!(!report.all_succeeded());
    assert_eq!(report.total_quarantined(), 1);
    assert_eq!(report.quarantine_paths(), vec![&expected]);
    assert_eq!(read_lines(&expected), vec!["garbage".to_string()]);
}

#[tokio::test]
async fn test_deadlock_victim_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<String> = (1..=3).map(|id| tweet(id, id).to_string()).collect();
    let input = write_lines(dir.path(), "tweets.json", &lines);

    let store = MemoryStore::shared();
    let mut victim_once = true;
    let sink = FaultySink::new(
        store.clone(),
        Box::new(move |event: &EventRow| {
            if event.id == 2 && victim_once {
                victim_once = false;
                return Some(IngestError::StoreContention("deadlock detected".to_string()));
            }
            None
        }),
    );
    let stats = run_json_shard(0, &input, settings(10), sink, Arc::new(NoProgress))
        .await
        .unwrap();

    assert_eq!(stats.applied, 3);
    assert_eq!(stats.quarantined, 0);
    let store = store.lock().unwrap();
    assert_eq!(store.events.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(store.actors.len(), 3);
}

#[tokio::test]
async fn test_persistent_contention_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let contended = tweet(2, 2).to_string();
    let lines = vec![tweet(1, 1).to_string(), contended.clone()];
    let input = write_lines(dir.path(), "tweets.json", &lines);

    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let store = MemoryStore::shared();
    let sink = FaultySink::new(
        store.clone(),
        Box::new(move |event: &EventRow| {
            (event.id == 2).then(|| {
                seen.fetch_add(1, Ordering::SeqCst);
                IngestError::StoreContention("deadlock detected".to_string())
            })
        }),
    );
    let stats = run_json_shard(0, &input, settings(10), sink, Arc::new(NoProgress))
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(stats.quarantined, 1);
    assert_eq!(read_lines(&stats.quarantine_path.unwrap()), vec![contended]);
    assert!(!store.lock().unwrap().actors.contains_key(&2));
}
