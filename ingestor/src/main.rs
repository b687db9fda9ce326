use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ingestor::config::Config;
use ingestor::db::{self, PgStorage};
use ingestor::dedup::RedisDeduplicator;
use ingestor::egress::{EgressPublisher, LapinTransport};
use ingestor::ingress::{IngressConnection, RumqttTransport};
use ingestor::pipeline::Pipeline;
use ingestor::{http, metrics, workers};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting IoT Ingestor");
    info!("MQTT broker: {}:{} ({})", config.mqtt_broker, config.mqtt_port, config.mqtt_topic);
    info!("AMQP exchange: {}", config.amqp_exchange);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_url.split('@').last().unwrap_or("***"));

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let dedup = match RedisDeduplicator::connect(&config.redis_url, config.redis_timeout).await {
        Ok(dedup) => dedup,
        Err(e) => {
            error!("Failed to connect to Redis: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();

    let publisher = Arc::new(EgressPublisher::new(LapinTransport::new(
        config.amqp_url.clone(),
        config.amqp_exchange.clone(),
    )));
    let egress_handle = tokio::spawn(publisher.clone().supervise(shutdown.clone()));

    let pipeline = Arc::new(
        Pipeline::new(
            Arc::new(dedup),
            Arc::new(PgStorage::new(pool)),
            publisher.clone(),
        )
        .with_dedup_ttl(config.dedup_ttl),
    );

    info!("Queue capacity: {}, workers: {}", config.queue_capacity, config.workers);
    let (tx, rx) = mpsc::channel(config.queue_capacity);

    let ingress = IngressConnection::new(
        RumqttTransport::new(config.mqtt_settings()),
        config.mqtt_topic.clone(),
        tx,
    );
    let app = http::create_router(ingress.state(), publisher.state());
    let ingress_handle = tokio::spawn(ingress.run(shutdown.clone(), config.quiesce));

    let workers_handle = tokio::spawn(workers::run_workers(
        rx,
        pipeline,
        config.workers,
        config.shutdown_grace,
        shutdown.clone(),
    ));

    let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };
    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("HTTP server error: {}", e);
        }
    });

    info!("IoT ingestor started successfully");
    shutdown_signal().await;

    info!("Shutting down gracefully...");
    shutdown.cancel();

    // Workers stop taking frames on cancel and give in-flight runs the
    // grace period; ingress disconnects within its quiesce budget.
    if let Err(e) = ingress_handle.await {
        error!("Ingress task failed: {}", e);
    }
    if let Err(e) = workers_handle.await {
        error!("Worker task failed: {}", e);
    }

    let egress_shutdown = async {
        publisher.close().await;
        egress_handle.await
    };
    match timeout(config.shutdown_grace, egress_shutdown).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Egress task failed: {}", e),
        Err(_) => warn!(
            "AMQP close did not finish within {:?}, exiting anyway",
            config.shutdown_grace
        ),
    }
    if let Err(e) = server_handle.await {
        error!("HTTP server task failed: {}", e);
    }

    info!("Shutdown complete");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received interrupt signal"),
                    _ = terminate.recv() => info!("Received terminate signal"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for interrupt signal: {}", e);
    }
    info!("Received interrupt signal");
}
