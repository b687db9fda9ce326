use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{Error, Result};

/// Telemetry as it arrives on the wire, before validation.
///
/// Unknown fields are ignored; a missing field or a timestamp without a
/// timezone fails decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryPayload {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
}

impl TelemetryPayload {
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// A validated reading. Built once by `validate::validate` and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryReading {
    device_id: Uuid,
    timestamp: DateTime<Utc>,
    temperature: f64,
    humidity: f64,
}

impl TelemetryReading {
    pub(crate) fn new(
        device_id: Uuid,
        timestamp: DateTime<Utc>,
        temperature: f64,
        humidity: f64,
    ) -> Self {
        Self {
            device_id,
            timestamp,
            temperature,
            humidity,
        }
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn humidity(&self) -> f64 {
        self.humidity
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.device_id, self.timestamp)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Transport(format!("serialize reading: {}", e)))
    }
}

/// Cache key for one `(device, whole second)` pair: `dedup:<device_id>:<unix_seconds>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(device_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self(format!("dedup:{}:{}", device_id, timestamp.timestamp()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw frame handed from the ingress connection to the workers.
#[derive(Debug, Clone)]
pub struct Frame {
    pub topic: String,
    pub payload: Vec<u8>,
}
