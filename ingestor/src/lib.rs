//! Telemetry ingestion: MQTT in, Redis dedup, PostgreSQL persist, AMQP fanout out.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod db;
pub mod dedup;
pub mod egress;
pub mod errors;
pub mod http;
pub mod ingress;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod validate;
pub mod workers;
