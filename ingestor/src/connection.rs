use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::metrics::CONNECTION_STATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    fn gauge_value(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Reconnecting => 3.0,
        }
    }
}

/// Single-writer holder of one connection manager's state.
///
/// Only the owning manager calls `transition`; everyone else observes
/// through `subscribe`.
#[derive(Debug)]
pub struct StateTracker {
    role: &'static str,
    tx: watch::Sender<ConnectionState>,
}

impl StateTracker {
    pub fn new(role: &'static str) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        CONNECTION_STATE
            .with_label_values(&[role])
            .set(ConnectionState::Disconnected.gauge_value());
        Self { role, tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn transition(&self, to: ConnectionState) {
        let from = self.tx.send_replace(to);
        if from != to {
            info!(role = self.role, ?from, ?to, "Connection state changed");
            CONNECTION_STATE
                .with_label_values(&[self.role])
                .set(to.gauge_value());
        }
    }
}
