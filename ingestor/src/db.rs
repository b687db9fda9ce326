use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info};

use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::TelemetryReading;

/// Durable write of one reading. Implementations must tolerate concurrent
/// callers and either store the whole reading or nothing.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn insert(&self, reading: &TelemetryReading) -> Result<()>;
}

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorageSink for PgStorage {
    async fn insert(&self, reading: &TelemetryReading) -> Result<()> {
        let query = r#"
            INSERT INTO sensor_data (device_id, ts, temperature, humidity)
            VALUES ($1, $2, $3, $4)
            "#;

        sqlx::query(query)
            .bind(reading.device_id())
            .bind(reading.timestamp())
            .bind(reading.temperature())
            .bind(reading.humidity())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                DB_FAILURES_TOTAL.inc();
                error!(device = %reading.device_id(), "Database insert failed: {}", e);
                Error::Persist(e.to_string())
            })?;

        Ok(())
    }
}
