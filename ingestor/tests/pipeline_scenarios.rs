use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use ingestor::backoff::{BackoffPolicy, RecordingSleeper};
use ingestor::db::StorageSink;
use ingestor::dedup::InMemoryDeduplicator;
use ingestor::egress::{EgressPublisher, ExchangeTransport};
use ingestor::errors::{Error, Result};
use ingestor::model::TelemetryReading;
use ingestor::pipeline::{Outcome, Pipeline};

const PAYLOAD: &str = r#"{"device_id":"3fa85f64-5717-4562-b3fc-2c963f66afa6","timestamp":"2025-01-01T00:00:00Z","temperature":21.5,"humidity":40.0}"#;

#[derive(Default)]
struct MemoryStore {
    rows: Mutex<Vec<TelemetryReading>>,
}

#[async_trait]
impl StorageSink for MemoryStore {
    async fn insert(&self, reading: &TelemetryReading) -> Result<()> {
        self.rows.lock().unwrap().push(reading.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Exchange {
    open: bool,
    reachable: bool,
    messages: Vec<(Vec<u8>, DateTime<Utc>)>,
}

/// In-process stand-in for the fanout exchange.
#[derive(Clone)]
struct MemoryExchange {
    inner: Arc<Mutex<Exchange>>,
}

impl MemoryExchange {
    fn new(reachable: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Exchange {
                reachable,
                ..Default::default()
            })),
        }
    }

    fn messages(&self) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .map(|(body, _)| serde_json::from_slice(body).unwrap())
            .collect()
    }
}

#[async_trait]
impl ExchangeTransport for MemoryExchange {
    async fn connect(&mut self, _on_close: Arc<Notify>) -> Result<()> {
        let mut exchange = self.inner.lock().unwrap();
        if !exchange.reachable {
            return Err(Error::Connection("connection refused".to_string()));
        }
        exchange.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    async fn publish(&mut self, body: &[u8], sent_at: DateTime<Utc>) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .push((body.to_vec(), sent_at));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.lock().unwrap().open = false;
        Ok(())
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    exchange: MemoryExchange,
    pipeline: Pipeline,
}

fn fixture(exchange_reachable: bool) -> Fixture {
    let store = Arc::new(MemoryStore::default());
    let exchange = MemoryExchange::new(exchange_reachable);
    let publisher = EgressPublisher::new(exchange.clone())
        .with_backoff(BackoffPolicy::egress(), Arc::new(RecordingSleeper::new()));
    let pipeline = Pipeline::new(
        Arc::new(InMemoryDeduplicator::new()),
        store.clone(),
        Arc::new(publisher),
    );
    Fixture {
        store,
        exchange,
        pipeline,
    }
}

#[tokio::test]
async fn test_single_submission_stores_and_fans_out_identical_fields() {
    let f = fixture(true);

    let outcome = f.pipeline.run(PAYLOAD.as_bytes()).await;
    assert!(matches!(outcome, Outcome::Succeeded));

    let rows = f.store.rows.lock().unwrap().clone();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].device_id().to_string(),
        "3fa85f64-5717-4562-b3fc-2c963f66afa6"
    );
    assert_eq!(
        rows[0].timestamp(),
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    );
    assert_eq!(rows[0].temperature(), 21.5);
    assert_eq!(rows[0].humidity(), 40.0);

    let messages = f.exchange.messages();
    assert_eq!(messages.len(), 1);
    let sent: serde_json::Value = serde_json::from_str(PAYLOAD).unwrap();
    assert_eq!(messages[0], sent);
}

#[tokio::test(start_paused = true)]
async fn test_resubmission_within_window_is_skipped() {
    let f = fixture(true);

    assert!(matches!(
        f.pipeline.run(PAYLOAD.as_bytes()).await,
        Outcome::Succeeded
    ));
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(matches!(
        f.pipeline.run(PAYLOAD.as_bytes()).await,
        Outcome::DuplicateSkipped
    ));

    assert_eq!(f.store.rows.lock().unwrap().len(), 1);
    assert_eq!(f.exchange.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resubmission_after_window_is_processed_again() {
    let f = fixture(true);

    assert!(matches!(
        f.pipeline.run(PAYLOAD.as_bytes()).await,
        Outcome::Succeeded
    ));
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(matches!(
        f.pipeline.run(PAYLOAD.as_bytes()).await,
        Outcome::Succeeded
    ));

    assert_eq!(f.store.rows.lock().unwrap().len(), 2);
    assert_eq!(f.exchange.messages().len(), 2);
}

#[tokio::test]
async fn test_malformed_input_never_persists() {
    let f = fixture(true);
    let bad: [&[u8]; 6] = [
        b"",
        b"not json",
        br#"{"device_id":"3fa85f64-5717-4562-b3fc-2c963f66afa6"}"#,
        br#"{"device_id":"dev-1","timestamp":"2025-01-01T00:00:00Z","temperature":21.5,"humidity":40.0}"#,
        br#"{"device_id":"3fa85f64-5717-4562-b3fc-2c963f66afa6","timestamp":"yesterday","temperature":21.5,"humidity":40.0}"#,
        br#"{"device_id":"3fa85f64-5717-4562-b3fc-2c963f66afa6","timestamp":"2025-01-01T00:00:00Z","temperature":"warm","humidity":40.0}"#,
    ];

    for raw in bad {
        match f.pipeline.run(raw).await {
            Outcome::Dropped(e) => assert!(
                matches!(e, Error::Decode(_) | Error::Validation(_)),
                "unexpected error {e}"
            ),
            other => panic!("expected Dropped, got {:?}", other),
        }
    }

    assert!(f.store.rows.lock().unwrap().is_empty());
    assert!(f.exchange.messages().is_empty());
}

#[tokio::test]
async fn test_publish_failure_after_persist_is_partial_success() {
    let f = fixture(false);

    let outcome = f.pipeline.run(PAYLOAD.as_bytes()).await;

    match outcome {
        Outcome::PartiallySucceeded(e) => {
            assert_eq!(e.attempts, 3);
            assert!(matches!(*e.last, Error::Connection(_)));
        }
        other => panic!("expected PartiallySucceeded, got {:?}", other),
    }
    assert_eq!(f.store.rows.lock().unwrap().len(), 1);
    assert!(f.exchange.messages().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_produce_one_row() {
    let f = Arc::new(fixture(true));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let f = f.clone();
            tokio::spawn(async move { f.pipeline.run(PAYLOAD.as_bytes()).await })
        })
        .collect();

    let mut succeeded = 0;
    let mut skipped = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Outcome::Succeeded => succeeded += 1,
            Outcome::DuplicateSkipped => skipped += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(skipped, 15);
    assert_eq!(f.store.rows.lock().unwrap().len(), 1);
    assert_eq!(f.exchange.messages().len(), 1);
}
