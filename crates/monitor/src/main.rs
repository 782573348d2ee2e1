mod adc;
mod config;
mod dht;
mod mqtt;
mod pump;
mod reconcile;
mod sensors;

use anyhow::{Context, Result};
use garden_bus::{announce, Liveness};
use rumqttc::{Event, Packet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Settings;
use mqtt::Monitor;
use pump::{PumpBoard, PumpGuard};
use reconcile::ConfigCache;
use sensors::Hardware;

const PROCESS: &str = "garden_monitor";

/// How often due sensors are checked.
const TICK: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();
    let local = config::load(&settings.sensor_config)?;

    // ── Hardware ────────────────────────────────────────────────────
    let hardware = Hardware {
        adc: adc::open(local.adc_address).context("failed to open ADC")?,
        dht: Arc::new(dht::open(local.dht_pin).context("failed to open DHT-22")?),
    };
    let board = PumpBoard::new(&local.pumps, local.active_low).context("failed to open pump relays")?;
    let guard = PumpGuard::spawn(board);

    // One announcement and one in-flight sample per sensor at most.
    let burst = 2 * local.sensors.len();
    let mut monitor = Monitor::new(ConfigCache::new(local.sensors), hardware, local.pumps, guard);

    // ── MQTT ────────────────────────────────────────────────────────
    let (bus, mut eventloop) = garden_bus::connect(PROCESS, &settings.mqtt_host, settings.mqtt_port, burst);
    for pattern in monitor.patterns() {
        bus.subscribe(pattern).await?;
    }
    info!(host = %settings.mqtt_host, port = settings.mqtt_port, "monitor subscribed");

    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let outcome = loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if let Err(e) = monitor.handle(&bus, &p.topic, &p.payload).await {
                        break Err(e).context("publish failed");
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    if let Err(e) = announce(&bus, PROCESS, Liveness::Online).await {
                        break Err(e).context("failed to announce online");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    break Err(anyhow::anyhow!("broker closed the connection"));
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt connection lost: {e}");
                    break Err(e).context("mqtt connection lost");
                }
            },
            _ = tick.tick() => monitor.sample_due(&bus, Instant::now()),
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break garden_bus::shutdown(&bus, &mut eventloop, PROCESS)
                    .await
                    .context("clean disconnect failed");
            }
        }
    };

    // Pumps go off whichever way the loop ended.
    monitor.shutdown().await;
    info!("all pumps off");
    outcome
}
