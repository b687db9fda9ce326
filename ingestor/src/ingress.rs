use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::{Backoff, BackoffPolicy, Sleeper, TokioSleeper};
use crate::connection::{ConnectionState, StateTracker};
use crate::errors::{Error, Result};
use crate::metrics::{MESSAGES_TOTAL, QUEUE_FULL_TOTAL, RECONNECTS_TOTAL};
use crate::model::Frame;

pub const DEFAULT_TOPIC_FILTER: &str = "sensors/+";
pub const DEFAULT_QUIESCE: Duration = Duration::from_millis(250);

/// The subscribe side of a broker session.
#[async_trait]
pub trait SubscribeTransport: Send {
    /// Opens a fresh session, discarding any previous one.
    async fn connect(&mut self) -> Result<()>;

    async fn subscribe(&mut self, filter: &str) -> Result<()>;

    /// Waits for the next frame. An error means the session is gone.
    async fn recv(&mut self) -> Result<Frame>;

    async fn disconnect(&mut self, quiesce: Duration) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub capacity: usize,
}

/// `rumqttc` session with a clean session and QoS 1 subscriptions.
pub struct RumqttTransport {
    settings: MqttSettings,
    session: Option<(AsyncClient, EventLoop)>,
    pending: VecDeque<Frame>,
}

impl RumqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            session: None,
            pending: VecDeque::new(),
        }
    }

    fn options(&self) -> MqttOptions {
        let s = &self.settings;
        let mut options = MqttOptions::new(s.client_id.clone(), s.host.clone(), s.port);
        options.set_keep_alive(s.keep_alive);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (s.username.as_ref(), s.password.as_ref()) {
            options.set_credentials(username, password);
        }
        options
    }
}

fn to_frame(publish: rumqttc::Publish) -> Frame {
    Frame {
        topic: publish.topic,
        payload: publish.payload.to_vec(),
    }
}

#[async_trait]
impl SubscribeTransport for RumqttTransport {
    async fn connect(&mut self) -> Result<()> {
        self.session = None;
        self.pending.clear();

        let (client, mut eventloop) = AsyncClient::new(self.options(), self.settings.capacity);
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => {}
                    Err(e) => return Err(Error::Connection(e.to_string())),
                }
            }
        };
        let ack = timeout(self.settings.connect_timeout, handshake)
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "no CONNACK within {:?}",
                    self.settings.connect_timeout
                ))
            })??;
        debug!(session_present = ack.session_present, "CONNACK received");

        self.session = Some((client, eventloop));
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> Result<()> {
        let RumqttTransport {
            settings,
            session,
            pending,
        } = self;
        let Some((client, eventloop)) = session.as_mut() else {
            return Err(Error::Subscription("connection not established".to_string()));
        };

        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::Subscription(e.to_string()))?;

        let wait_suback = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(ack))) => return Ok(ack),
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        pending.push_back(to_frame(publish))
                    }
                    Ok(_) => {}
                    Err(e) => return Err(Error::Subscription(e.to_string())),
                }
            }
        };
        let ack = timeout(settings.connect_timeout, wait_suback)
            .await
            .map_err(|_| Error::Subscription(format!("no SUBACK for {}", filter)))??;

        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(Error::Subscription(format!(
                "broker rejected filter {}",
                filter
            )));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        let Some((_, eventloop)) = self.session.as_mut() else {
            return Err(Error::Connection("connection not established".to_string()));
        };

        let result = loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => break Ok(to_frame(publish)),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    break Err(Error::Connection("broker sent DISCONNECT".to_string()))
                }
                Ok(_) => {}
                Err(e) => break Err(Error::Connection(e.to_string())),
            }
        };

        if result.is_err() {
            self.session = None;
        }
        result
    }

    async fn disconnect(&mut self, quiesce: Duration) -> Result<()> {
        let Some((client, mut eventloop)) = self.session.take() else {
            return Ok(());
        };

        client
            .disconnect()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if timeout(quiesce, flush).await.is_err() {
            warn!(?quiesce, "Quiesce budget exhausted, forcing MQTT close");
        }
        Ok(())
    }
}

/// Owns the subscribe-side connection and its reconnect loop.
///
/// Every received frame is handed to the bounded work queue; pipeline runs
/// happen on the worker side, never on this task.
pub struct IngressConnection<T: SubscribeTransport> {
    transport: T,
    topic_filter: String,
    queue: mpsc::Sender<Frame>,
    state: StateTracker,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
    session_open: bool,
}

impl<T: SubscribeTransport> IngressConnection<T> {
    pub fn new(transport: T, topic_filter: impl Into<String>, queue: mpsc::Sender<Frame>) -> Self {
        Self {
            transport,
            topic_filter: topic_filter.into(),
            queue,
            state: StateTracker::new("ingress"),
            backoff: BackoffPolicy::ingress().start(),
            sleeper: Arc::new(TokioSleeper),
            session_open: false,
        }
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        self.backoff = policy.start();
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.state.get() == ConnectionState::Disconnected {
            self.state.transition(ConnectionState::Connecting);
        }
        self.session_open = false;
        self.transport.connect().await?;
        self.session_open = true;
        Ok(())
    }

    pub async fn subscribe(&mut self) -> Result<()> {
        if !self.session_open {
            return Err(Error::Subscription(
                "connection not established".to_string(),
            ));
        }
        self.transport
            .subscribe(&self.topic_filter)
            .await
            .map_err(|e| match e {
                Error::Subscription(_) => e,
                other => Error::Subscription(other.to_string()),
            })?;
        self.state.transition(ConnectionState::Connected);
        Ok(())
    }

    /// Hands one frame to the work queue, waiting for room when it is full.
    pub async fn on_message(&mut self, frame: Frame) -> Result<()> {
        MESSAGES_TOTAL.inc();
        debug!(
            "Received message on topic {}, size: {} bytes",
            frame.topic,
            frame.payload.len()
        );

        match self.queue.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                QUEUE_FULL_TOTAL.inc();
                debug!("Work queue full, waiting for a free slot");
                self.queue.send(frame).await.map_err(|_| Error::ChannelSend)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelSend),
        }
    }

    pub async fn disconnect(&mut self, quiesce: Duration) {
        if let Err(e) = self.transport.disconnect(quiesce).await {
            warn!(error = %e, "MQTT disconnect failed");
        }
        self.session_open = false;
        self.state.transition(ConnectionState::Disconnected);
        info!("MQTT client disconnected");
    }

    async fn connect_and_subscribe(&mut self) -> Result<()> {
        self.connect().await?;
        self.subscribe().await
    }

    /// Retries connect + subscribe until both succeed. Returns `false` if
    /// shutdown was requested first.
    async fn establish(&mut self, shutdown: &CancellationToken) -> bool {
        loop {
            info!(topic = %self.topic_filter, "Attempting MQTT connection");
            let attempt = tokio::select! {
                result = self.connect_and_subscribe() => result,
                _ = shutdown.cancelled() => return false,
            };

            match attempt {
                Ok(()) => {
                    self.backoff.reset();
                    info!("MQTT connection established successfully");
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    RECONNECTS_TOTAL.with_label_values(&["ingress"]).inc();
                    error!(error = %e, retry_delay = ?delay, "MQTT connection failed");
                    tokio::select! {
                        _ = self.sleeper.sleep(delay) => {}
                        _ = shutdown.cancelled() => return false,
                    }
                }
            }
        }
    }

    /// Runs until `shutdown` fires or the work queue closes, then disconnects
    /// within `quiesce`.
    pub async fn run(mut self, shutdown: CancellationToken, quiesce: Duration) {
        let span = info_span!("ingress", component = "ingress");
        async move {
            if self.establish(&shutdown).await {
                loop {
                    let next = tokio::select! {
                        next = self.transport.recv() => next,
                        _ = shutdown.cancelled() => break,
                    };

                    match next {
                        Ok(frame) => {
                            if self.on_message(frame).await.is_err() {
                                error!("Work queue closed, stopping ingress");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "MQTT connection lost");
                            self.session_open = false;
                            self.state.transition(ConnectionState::Reconnecting);
                            if !self.establish(&shutdown).await {
                                break;
                            }
                        }
                    }
                }
            }
            self.disconnect(quiesce).await;
        }
        .instrument(span)
        .await
    }
}
