use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

/// Wire payload published on `sensors/<device_id>`.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub device_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
}

impl Telemetry {
    pub fn generate(rng: &mut impl Rng, device_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        let temperature = if rng.gen_bool(0.05) {
            rng.gen_range(-20.0..60.0) // 5% outliers
        } else {
            rng.gen_range(15.0..35.0)
        };

        let humidity = if rng.gen_bool(0.05) {
            rng.gen_range(0.0..100.0) // 5% outliers
        } else {
            rng.gen_range(30.0..80.0)
        };

        Self {
            device_id,
            timestamp,
            temperature,
            humidity,
        }
    }

    pub fn topic(&self) -> String {
        format!("sensors/{}", self.device_id)
    }
}

/// Hands out whole-second timestamps that never repeat for a device.
///
/// The ingestor deduplicates on `(device_id, unix second)`, so two distinct
/// readings from one device inside the same second would collapse into one.
/// At rates above one reading per device per second the timestamps run
/// ahead of the wall clock.
#[derive(Debug)]
pub struct DeviceClock {
    last: Vec<Option<i64>>,
}

impl DeviceClock {
    pub fn new(devices: usize) -> Self {
        Self {
            last: vec![None; devices],
        }
    }

    pub fn next(&mut self, device: usize, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = match self.last[device] {
            Some(last) => now.timestamp().max(last + 1),
            None => now.timestamp(),
        };
        self.last[device] = Some(secs);
        DateTime::from_timestamp(secs, 0).unwrap_or(now)
    }
}

/// Parses a probability in `0.0..=1.0`.
pub fn parse_ratio(raw: &str) -> Result<f64, String> {
    let ratio: f64 = raw.parse().map_err(|e| format!("{}", e))?;
    if ratio.is_finite() && (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(format!("{} is not within 0.0..=1.0", raw))
    }
}
