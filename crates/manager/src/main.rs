mod config;
mod db;
mod mqtt;
mod reconcile;
mod watering;

use anyhow::{bail, Context, Result};
use garden_bus::{announce, Liveness};
use rumqttc::{Event, Packet};
use time::OffsetDateTime;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Settings;
use db::Db;
use mqtt::Manager;

const PROCESS: &str = "garden_manager";

/// Publishes one handler can make: the online flag plus `sensors/info`.
const PUBLISH_BURST: usize = 2;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&settings.db_url).await?;
    db.migrate().await?;

    // ── Seed file (optional) ────────────────────────────────────────
    match config::load(&settings.seed_path)? {
        Some(seed) => config::apply(&seed, &db).await?,
        None => info!(path = %settings.seed_path, "no seed file, starting from database"),
    }

    let created = reconcile::ensure_default_plants(&db).await?;
    let sensors = db.load_sensors().await?;
    let plants = db.load_plants().await?;
    info!(
        sensors = sensors.len(),
        plants = plants.len(),
        default_plants = created.len(),
        "registry ready"
    );
    if plants.is_empty() {
        warn!("no plants configured, nothing will be watered");
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let (bus, mut eventloop) = garden_bus::connect(PROCESS, &settings.mqtt_host, settings.mqtt_port, PUBLISH_BURST);
    let mut manager = Manager::new(db);

    for pattern in manager.patterns() {
        bus.subscribe(pattern).await?;
    }
    info!(host = %settings.mqtt_host, port = settings.mqtt_port, "manager subscribed");

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    manager
                        .handle(&bus, &p.topic, &p.payload, OffsetDateTime::now_utc())
                        .await
                        .with_context(|| format!("publish failed while handling {}", p.topic))?;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    announce(&bus, PROCESS, Liveness::Online).await?;
                    manager.publish_sensor_info(&bus).await?;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    bail!("broker closed the connection");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt connection lost: {e}");
                    return Err(e).context("mqtt connection lost");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                garden_bus::shutdown(&bus, &mut eventloop, PROCESS).await?;
                return Ok(());
            }
        }
    }
}
