use crate::errors::{Error, Result};
use crate::model::{TelemetryPayload, TelemetryReading};
use uuid::Uuid;

const TEMP_MIN: f64 = -273.15;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;

/// Validates a decoded payload and turns it into a reading.
pub fn validate(payload: TelemetryPayload) -> Result<TelemetryReading> {
    let device_id = Uuid::parse_str(&payload.device_id).map_err(|e| {
        Error::Validation(format!("Invalid device_id {:?}: {}", payload.device_id, e))
    })?;

    if !payload.temperature.is_finite() || payload.temperature < TEMP_MIN {
        return Err(Error::Validation(format!(
            "Temperature {} is not representable (min {})",
            payload.temperature, TEMP_MIN
        )));
    }

    if !payload.humidity.is_finite()
        || payload.humidity < HUMIDITY_MIN
        || payload.humidity > HUMIDITY_MAX
    {
        return Err(Error::Validation(format!(
            "Humidity {} out of range [{}, {}]",
            payload.humidity, HUMIDITY_MIN, HUMIDITY_MAX
        )));
    }

    Ok(TelemetryReading::new(
        device_id,
        payload.timestamp,
        payload.temperature,
        payload.humidity,
    ))
}
