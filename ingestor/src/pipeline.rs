//! One message's journey: decode, validate, dedup, persist, publish.
//!
//! Each stage runs only if the previous one succeeded. Nothing is retried
//! here; the only retries are the publisher's own bounded attempts. A dedup
//! claim is kept even when persisting fails afterwards, so a retransmission
//! of that message inside the dedup window is skipped as a duplicate.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::db::StorageSink;
use crate::dedup::{Deduplicator, DEDUP_TTL};
use crate::egress::{EgressPublisher, ExchangeTransport};
use crate::errors::{Error, PublishError, Result};
use crate::model::{TelemetryPayload, TelemetryReading};
use crate::validate::validate;

/// Turns raw frame bytes into a payload.
pub type Decoder = fn(&[u8]) -> Result<TelemetryPayload>;

/// Downstream delivery of accepted readings.
#[async_trait]
pub trait ReadingPublisher: Send + Sync {
    async fn publish(&self, reading: &TelemetryReading) -> std::result::Result<(), PublishError>;
}

#[async_trait]
impl<T: ExchangeTransport> ReadingPublisher for EgressPublisher<T> {
    async fn publish(&self, reading: &TelemetryReading) -> std::result::Result<(), PublishError> {
        EgressPublisher::publish(self, reading).await
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// Persisted and published.
    Succeeded,
    /// Another run already claimed this `(device, second)`.
    DuplicateSkipped,
    /// Stopped before anything was persisted.
    Dropped(Error),
    /// Persisted, but the publish failed.
    PartiallySucceeded(PublishError),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::DuplicateSkipped => "duplicate_skipped",
            Outcome::Dropped(_) => "dropped",
            Outcome::PartiallySucceeded(_) => "partially_succeeded",
        }
    }
}

pub struct Pipeline {
    decode: Decoder,
    dedup: Arc<dyn Deduplicator>,
    storage: Arc<dyn StorageSink>,
    publisher: Arc<dyn ReadingPublisher>,
    dedup_ttl: Duration,
}

impl Pipeline {
    pub fn new(
        dedup: Arc<dyn Deduplicator>,
        storage: Arc<dyn StorageSink>,
        publisher: Arc<dyn ReadingPublisher>,
    ) -> Self {
        Self {
            decode: TelemetryPayload::from_json,
            dedup,
            storage,
            publisher,
            dedup_ttl: DEDUP_TTL,
        }
    }

    pub fn with_decoder(mut self, decode: Decoder) -> Self {
        self.decode = decode;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub async fn run(&self, raw: &[u8]) -> Outcome {
        let reading = match (self.decode)(raw).and_then(validate) {
            Ok(reading) => reading,
            Err(e) => return Outcome::Dropped(e),
        };

        match self.dedup.claim(&reading.dedup_key(), self.dedup_ttl).await {
            Ok(true) => {}
            Ok(false) => return Outcome::DuplicateSkipped,
            Err(e) => return Outcome::Dropped(as_dedup_unavailable(e)),
        }

        if let Err(e) = self.storage.insert(&reading).await {
            return Outcome::Dropped(as_persist(e));
        }

        match self.publisher.publish(&reading).await {
            Ok(()) => Outcome::Succeeded,
            Err(e) => Outcome::PartiallySucceeded(e),
        }
    }
}

fn as_dedup_unavailable(err: Error) -> Error {
    match err {
        Error::DedupUnavailable(_) => err,
        other => Error::DedupUnavailable(other.to_string()),
    }
}

fn as_persist(err: Error) -> Error {
    match err {
        Error::Persist(_) => err,
        other => Error::Persist(other.to_string()),
    }
}
