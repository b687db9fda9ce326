mod telemetry;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use telemetry::{parse_ratio, DeviceClock, Telemetry};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Publishes synthetic sensor readings to the ingestion broker.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Messages per second across all devices.
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Share of readings sent twice, to exercise deduplication. Each device
    /// stamps distinct whole seconds, so only these retransmissions are
    /// duplicates.
    #[arg(long, env = "DUPLICATE_RATIO", default_value_t = 0.05, value_parser = parse_ratio)]
    duplicate_ratio: f64,
}

const BURST_SIZE: usize = 200;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let duplicate_ratio = args.duplicate_ratio;
    let rate = args.rate.max(1);

    info!("Starting IoT Simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}, Duplicates: {:.0}%",
        args.broker,
        args.port,
        rate,
        args.devices,
        duplicate_ratio * 100.0
    );

    let devices: Vec<Uuid> = (0..args.devices.max(1)).map(|_| Uuid::new_v4()).collect();
    let mut clock = DeviceClock::new(devices.len());
    if rate > devices.len() as u64 {
        warn!(
            "Rate exceeds one reading per device per second; timestamps will run ahead of the clock"
        );
    }

    let mut rng = rand::thread_rng();
    let client_id = format!("sim-{}", rng.gen::<u32>());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish telemetry");

    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / rate);
    info!(
        "Publishing in bursts of {} messages every {:?}",
        BURST_SIZE, burst_interval
    );

    let mut counter = 0u64;
    let mut duplicates = 0u64;

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let device = (counter % devices.len() as u64) as usize;
            let timestamp = clock.next(device, Utc::now());
            let telemetry = Telemetry::generate(&mut rng, devices[device], timestamp);

            let payload = match serde_json::to_string(&telemetry) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };

            let copies = if rng.gen_bool(duplicate_ratio) { 2 } else { 1 };
            for _ in 0..copies {
                match client
                    .publish(telemetry.topic(), QoS::AtLeastOnce, false, payload.clone())
                    .await
                {
                    Ok(_) => counter += 1,
                    Err(e) => warn!("Failed to publish: {}", e),
                }
            }
            if copies > 1 {
                duplicates += 1;
            }
        }

        if counter % 10000 < BURST_SIZE as u64 {
            info!("Published {} messages ({} retransmissions)", counter, duplicates);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - system may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}
