use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::{BackoffPolicy, Sleeper, TokioSleeper};
use crate::connection::{ConnectionState, StateTracker};
use crate::errors::{Error, PublishError, Result};
use crate::metrics::{PUBLISH_ATTEMPTS_TOTAL, RECONNECTS_TOTAL};
use crate::model::TelemetryReading;

pub const DEFAULT_EXCHANGE: &str = "sensor_exchange";
const MAX_PUBLISH_ATTEMPTS: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// The publish side of a broker session: one connection, one channel, one
/// declared exchange.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    /// Opens the connection and channel and declares the exchange. A no-op
    /// when already open. `on_close` is notified when the broker or network
    /// closes the connection.
    async fn connect(&mut self, on_close: Arc<Notify>) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn publish(&mut self, body: &[u8], sent_at: DateTime<Utc>) -> Result<()>;

    /// Releases the channel and connection. Safe to call repeatedly.
    async fn close(&mut self) -> Result<()>;
}

/// AMQP 0-9-1 transport declaring a durable, non auto-delete fanout exchange.
pub struct LapinTransport {
    url: String,
    exchange: String,
    conn: Option<Connection>,
    channel: Option<Channel>,
}

impl LapinTransport {
    pub fn new(url: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: exchange.into(),
            conn: None,
            channel: None,
        }
    }

    fn declare_error(&self, err: lapin::Error) -> Error {
        match &err {
            lapin::Error::ProtocolError(amqp)
                if matches!(
                    amqp.kind(),
                    AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                ) =>
            {
                Error::ExchangeConflict(format!("exchange {}: {}", self.exchange, err))
            }
            _ => Error::Connection(err.to_string()),
        }
    }
}

#[async_trait]
impl ExchangeTransport for LapinTransport {
    async fn connect(&mut self, on_close: Arc<Notify>) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.close().await?;

        let conn = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        conn.on_error(move |err| {
            warn!(error = %err, "AMQP connection closed");
            on_close.notify_one();
        });

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.declare_error(e))?;

        self.conn = Some(conn);
        self.channel = Some(channel);
        Ok(())
    }

    fn is_open(&self) -> bool {
        let conn_open = self
            .conn
            .as_ref()
            .is_some_and(|conn| conn.status().connected());
        let channel_open = self
            .channel
            .as_ref()
            .is_some_and(|channel| channel.status().connected());
        conn_open && channel_open
    }

    async fn publish(&mut self, body: &[u8], sent_at: DateTime<Utc>) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .filter(|channel| channel.status().connected())
            .ok_or_else(|| Error::Transport("channel closed".to_string()))?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_timestamp(sent_at.timestamp().max(0) as u64);

        channel
            .basic_publish(
                &self.exchange,
                "",
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                if let Err(e) = channel.close(200, "OK").await {
                    debug!(error = %e, "AMQP channel close failed");
                }
            }
        }
        if let Some(conn) = self.conn.take() {
            if conn.status().connected() {
                if let Err(e) = conn.close(200, "OK").await {
                    debug!(error = %e, "AMQP connection close failed");
                }
            }
        }
        Ok(())
    }
}

/// Owns the publish-side connection.
///
/// All access to the transport goes through one mutex, so publishes never
/// share the channel and a reconnect never overlaps a publish. The
/// supervisor (`supervise`) reconnects after asynchronous closes; a publish
/// that finds the channel closed reconnects inline unless the supervisor is
/// already doing so.
pub struct EgressPublisher<T: ExchangeTransport> {
    transport: Mutex<T>,
    on_close: Arc<Notify>,
    reconnecting: AtomicBool,
    state: StateTracker,
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
    max_attempts: u32,
    retry_pause: Duration,
}

impl<T: ExchangeTransport> EgressPublisher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Mutex::new(transport),
            on_close: Arc::new(Notify::new()),
            reconnecting: AtomicBool::new(false),
            state: StateTracker::new("egress"),
            policy: BackoffPolicy::egress(),
            sleeper: Arc::new(TokioSleeper),
            max_attempts: MAX_PUBLISH_ATTEMPTS,
            retry_pause: RETRY_PAUSE,
        }
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        self.policy = policy;
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn connect(&self) -> Result<()> {
        let mut transport = self.transport.lock().await;
        self.connect_locked(&mut transport).await
    }

    async fn connect_locked(&self, transport: &mut T) -> Result<()> {
        if self.state.get() == ConnectionState::Disconnected {
            self.state.transition(ConnectionState::Connecting);
        }
        transport.connect(self.on_close.clone()).await?;
        self.state.transition(ConnectionState::Connected);
        Ok(())
    }

    /// Publishes one reading, with at most `MAX_PUBLISH_ATTEMPTS` attempts
    /// separated by a fixed pause.
    pub async fn publish(&self, reading: &TelemetryReading) -> std::result::Result<(), PublishError> {
        let body = reading.to_json().map_err(|e| PublishError::new(0, e))?;

        let mut last = Error::Transport("no publish attempt made".to_string());
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                self.sleeper.sleep(self.retry_pause).await;
            }
            PUBLISH_ATTEMPTS_TOTAL.inc();

            match self.try_publish(&body).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempt, "Published after retry");
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Publish attempt failed"
                    );
                    last = e;
                }
            }
        }

        Err(PublishError::new(self.max_attempts, last))
    }

    async fn try_publish(&self, body: &[u8]) -> Result<()> {
        let mut transport = self.transport.lock().await;
        if !transport.is_open() {
            if self.reconnecting.load(Ordering::SeqCst) {
                return Err(Error::Transport(
                    "channel closed, reconnect in progress".to_string(),
                ));
            }
            info!("Channel closed, reconnecting before publish");
            if let Err(e) = self.connect_locked(&mut transport).await {
                self.state.transition(ConnectionState::Reconnecting);
                return Err(e);
            }
        }
        transport.publish(body, Utc::now()).await
    }

    pub async fn close(&self) {
        let mut transport = self.transport.lock().await;
        if let Err(e) = transport.close().await {
            warn!(error = %e, "AMQP close failed");
        }
        self.state.transition(ConnectionState::Disconnected);
    }

    /// Retries `connect` with backoff until it succeeds. Returns `false` on
    /// shutdown.
    async fn reconnect(&self, shutdown: &CancellationToken) -> bool {
        self.reconnecting.store(true, Ordering::SeqCst);
        self.state.transition(ConnectionState::Reconnecting);

        let mut backoff = self.policy.start();
        let connected = loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = shutdown.cancelled() => break false,
            }

            RECONNECTS_TOTAL.with_label_values(&["egress"]).inc();
            let attempt = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.cancelled() => break false,
            };
            match attempt {
                Ok(()) => {
                    info!("Successfully reconnected");
                    break true;
                }
                Err(e) => {
                    error!(error = %e, next_delay = ?backoff.current(), "Failed to reconnect");
                }
            }
        };

        self.reconnecting.store(false, Ordering::SeqCst);
        connected
    }

    /// Connects, then watches for close notifications and reconnects, until
    /// `shutdown` fires.
    pub async fn supervise(self: Arc<Self>, shutdown: CancellationToken) {
        let span = info_span!("egress", component = "egress");
        async move {
            info!("Connecting to AMQP broker");
            let attempt = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.cancelled() => return,
            };
            if let Err(e) = attempt {
                error!(error = %e, "AMQP connection failed");
                if !self.reconnect(&shutdown).await {
                    return;
                }
            }

            loop {
                tokio::select! {
                    _ = self.on_close.notified() => {}
                    _ = shutdown.cancelled() => return,
                }
                if shutdown.is_cancelled() {
                    return;
                }
                warn!("AMQP connection closed, starting reconnect");
                if !self.reconnect(&shutdown).await {
                    return;
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RecordingSleeper;
    use crate::model::TelemetryPayload;
    use crate::validate::validate;
    use lapin::protocol::AMQPError;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Broker {
        open: bool,
        connect_results: VecDeque<Result<()>>,
        publish_results: VecDeque<Result<()>>,
        connects: usize,
        published: Vec<Vec<u8>>,
        closes: usize,
        on_close: Option<Arc<Notify>>,
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        broker: Arc<StdMutex<Broker>>,
    }

    impl FakeTransport {
        fn drop_connection(&self) {
            let mut broker = self.broker.lock().unwrap();
            broker.open = false;
            if let Some(on_close) = broker.on_close.as_ref() {
                on_close.notify_one();
            }
        }
    }

    #[async_trait]
    impl ExchangeTransport for FakeTransport {
        async fn connect(&mut self, on_close: Arc<Notify>) -> Result<()> {
            let mut broker = self.broker.lock().unwrap();
            if broker.open {
                return Ok(());
            }
            broker.connects += 1;
            broker.connect_results.pop_front().unwrap_or(Ok(()))?;
            broker.open = true;
            broker.on_close = Some(on_close);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.broker.lock().unwrap().open
        }

        async fn publish(&mut self, body: &[u8], _sent_at: DateTime<Utc>) -> Result<()> {
            let mut broker = self.broker.lock().unwrap();
            broker.publish_results.pop_front().unwrap_or(Ok(()))?;
            broker.published.push(body.to_vec());
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            let mut broker = self.broker.lock().unwrap();
            broker.open = false;
            broker.closes += 1;
            Ok(())
        }
    }

    fn reading() -> TelemetryReading {
        let raw = br#"{"device_id":"3fa85f64-5717-4562-b3fc-2c963f66afa6","timestamp":"2025-01-01T00:00:00Z","temperature":21.5,"humidity":40.0}"#;
        validate(TelemetryPayload::from_json(raw).unwrap()).unwrap()
    }

    fn publisher(transport: &FakeTransport, sleeper: &RecordingSleeper) -> EgressPublisher<FakeTransport> {
        EgressPublisher::new(transport.clone())
            .with_backoff(BackoffPolicy::egress(), Arc::new(sleeper.clone()))
    }

    fn transport_err(msg: &str) -> Result<()> {
        Err(Error::Transport(msg.to_string()))
    }

    #[tokio::test]
    async fn test_publish_reconnects_closed_channel_inline() {
        let transport = FakeTransport::default();
        let sleeper = RecordingSleeper::new();
        let publisher = publisher(&transport, &sleeper);

        publisher.publish(&reading()).await.unwrap();

        let broker = transport.broker.lock().unwrap();
        assert_eq!(broker.connects, 1);
        assert_eq!(broker.published.len(), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_publish_retries_with_fixed_pause() {
        let transport = FakeTransport::default();
        transport.broker.lock().unwrap().publish_results =
            vec![transport_err("timeout"), transport_err("timeout")].into();
        let sleeper = RecordingSleeper::new();
        let publisher = publisher(&transport, &sleeper);

        publisher.publish(&reading()).await.unwrap();

        assert_eq!(transport.broker.lock().unwrap().published.len(), 1);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(1), Duration::from_secs(1)]
        );
    }

    #[tokio::test]
    async fn test_publish_gives_up_after_three_attempts() {
        let transport = FakeTransport::default();
        transport.broker.lock().unwrap().publish_results = vec![
            transport_err("first"),
            transport_err("second"),
            transport_err("third"),
        ]
        .into();
        let sleeper = RecordingSleeper::new();
        let publisher = publisher(&transport, &sleeper);

        let err = publisher.publish(&reading()).await.unwrap_err();

        assert_eq!(err.attempts, 3);
        assert!(err.last.to_string().contains("third"));
        assert!(transport.broker.lock().unwrap().published.is_empty());
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_skips_inline_reconnect_while_supervisor_reconnects() {
        let transport = FakeTransport::default();
        let sleeper = RecordingSleeper::new();
        let publisher = publisher(&transport, &sleeper);
        publisher.reconnecting.store(true, Ordering::SeqCst);

        let err = publisher.publish(&reading()).await.unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(transport.broker.lock().unwrap().connects, 0);
    }

    #[tokio::test]
    async fn test_published_body_matches_wire_schema() {
        let transport = FakeTransport::default();
        let sleeper = RecordingSleeper::new();
        let publisher = publisher(&transport, &sleeper);

        publisher.publish(&reading()).await.unwrap();

        let body = transport.broker.lock().unwrap().published[0].clone();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["device_id"], "3fa85f64-5717-4562-b3fc-2c963f66afa6");
        assert_eq!(value["timestamp"], "2025-01-01T00:00:00Z");
        assert_eq!(value["temperature"], 21.5);
        assert_eq!(value["humidity"], 40.0);
    }

    #[tokio::test]
    async fn test_failed_inline_reconnect_reports_reconnecting() {
        let transport = FakeTransport::default();
        let sleeper = RecordingSleeper::new();
        let publisher = publisher(&transport, &sleeper);
        publisher.connect().await.unwrap();
        assert_eq!(*publisher.state().borrow(), ConnectionState::Connected);

        {
            let mut broker = transport.broker.lock().unwrap();
            broker.open = false;
            broker.connect_results = vec![
                Err(Error::Connection("refused".to_string())),
                Err(Error::Connection("refused".to_string())),
                Err(Error::Connection("refused".to_string())),
            ]
            .into();
        }

        let err = publisher.publish(&reading()).await.unwrap_err();
        assert!(matches!(*err.last, Error::Connection(_)));
        assert_eq!(*publisher.state().borrow(), ConnectionState::Reconnecting);

        publisher.publish(&reading()).await.unwrap();
        assert_eq!(*publisher.state().borrow(), ConnectionState::Connected);
    }

    #[test]
    fn test_precondition_failed_declare_is_exchange_conflict() {
        let transport = LapinTransport::new("amqp://localhost:5672/%2f", DEFAULT_EXCHANGE);

        let conflict = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED),
            "inequivalent arg 'type' for exchange".into(),
        ));
        match transport.declare_error(conflict) {
            Error::ExchangeConflict(msg) => assert!(msg.contains(DEFAULT_EXCHANGE)),
            other => panic!("expected ExchangeConflict, got {:?}", other),
        }

        let refused = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED),
            "access refused".into(),
        ));
        assert!(matches!(
            transport.declare_error(refused),
            Error::Connection(_)
        ));
        assert!(matches!(
            transport.declare_error(lapin::Error::ChannelsLimitReached),
            Error::Connection(_)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = FakeTransport::default();
        let sleeper = RecordingSleeper::new();
        let publisher = publisher(&transport, &sleeper);
        publisher.connect().await.unwrap();

        publisher.close().await;
        publisher.close().await;

        assert_eq!(transport.broker.lock().unwrap().closes, 2);
        assert_eq!(*publisher.state().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_supervisor_reconnects_with_backoff_after_close() {
        let transport = FakeTransport::default();
        let sleeper = RecordingSleeper::new();
        let publisher = Arc::new(publisher(&transport, &sleeper));
        let mut state = publisher.state();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(publisher.clone().supervise(shutdown.clone()));

        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert!(sleeper.delays().is_empty());

        transport.broker.lock().unwrap().connect_results = vec![
            Err(Error::Connection("refused".to_string())),
            Err(Error::Connection("refused".to_string())),
            Err(Error::Connection("refused".to_string())),
        ]
        .into();
        transport.drop_connection();

        while transport.broker.lock().unwrap().connects < 5 {
            tokio::task::yield_now().await;
        }
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        let expected: Vec<_> = [1, 2, 4, 8].iter().map(|s| Duration::from_secs(*s)).collect();
        assert_eq!(sleeper.delays(), expected);

        shutdown.cancel();
        task.await.unwrap();
    }
}
