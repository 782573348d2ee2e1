//! Inbound message handling for the manager: one route per subscribed
//! pattern, each decoded and applied against the database.
//!
//! Bad payloads, unknown ids and rejected writes are logged and dropped.
//! Only transport failures are returned, since they end the process.

use anyhow::{bail, Context, Result};
use garden_bus::topic::{self, parse_id};
use garden_bus::{
    decode, publish_json, Bus, BusError, Liveness, PayloadError, PlantRecord, PumpCommand, Router, SampleMsg,
    SensorKind, SensorRecord,
};
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::{ensure_valid, plant_errors, sensor_errors};
use crate::db::{Db, Sample, WateringEvent};
use crate::reconcile;
use crate::watering::WateringEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SensorData,
    SensorConfig,
    PlantConfig,
    PumpControl,
    Status,
}

pub fn router() -> Router<Route> {
    Router::new()
        .on(topic::SENSORS_DATA_ALL, Route::SensorData)
        .on(topic::SENSORS_CONFIG, Route::SensorConfig)
        .on(topic::PLANTS_CONFIG, Route::PlantConfig)
        .on(topic::PUMPS_CONTROL_ALL, Route::PumpControl)
        .on(topic::STATUS_ALL, Route::Status)
}

fn topic_id(captures: &[&str]) -> Result<i64, PayloadError> {
    let segment = captures.first().copied().unwrap_or_default();
    parse_id(segment).ok_or_else(|| PayloadError::TopicId(segment.to_string()))
}

pub struct Manager {
    db: Db,
    router: Router<Route>,
    engine: WateringEngine,
    peers: HashMap<String, Liveness>,
}

impl Manager {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            router: router(),
            engine: WateringEngine::new(),
            peers: HashMap::new(),
        }
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.router.patterns()
    }

    /// Dispatch one publish. `received_at` is the manager's clock at
    /// receipt, used for watering-event timestamps.
    pub async fn handle<B: Bus>(
        &mut self,
        bus: &B,
        topic: &str,
        payload: &[u8],
        received_at: OffsetDateTime,
    ) -> Result<(), BusError> {
        let Some((route, captures)) = self.router.route(topic) else {
            debug!(topic, "unhandled topic");
            return Ok(());
        };

        let outcome = match route {
            Route::SensorData => match topic_id(&captures) {
                Ok(id) => self.on_sample(bus, id, payload).await,
                Err(e) => Err(e.into()),
            },
            Route::SensorConfig => self.on_sensor_config(bus, payload).await,
            Route::PlantConfig => self.on_plant_config(payload).await,
            Route::PumpControl => match topic_id(&captures) {
                Ok(id) => self.on_pump_control(id, payload, received_at).await,
                Err(e) => Err(e.into()),
            },
            Route::Status => {
                self.on_status(captures.first().copied().unwrap_or_default(), payload);
                Ok(())
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => match e.downcast::<BusError>() {
                Ok(fatal) => Err(fatal),
                Err(e) => {
                    warn!(topic, "message dropped: {e:#}");
                    Ok(())
                }
            },
        }
    }

    /// Publish the retained `sensors/info` snapshot.
    pub async fn publish_sensor_info<B: Bus>(&self, bus: &B) -> Result<(), BusError> {
        let sensors = match self.db.load_sensors().await {
            Ok(s) => s,
            Err(e) => {
                warn!("sensors/info not published: {e:#}");
                return Ok(());
            }
        };
        publish_json(bus, topic::SENSORS_INFO, &sensors, true).await?;
        info!(sensors = sensors.len(), "sensors/info published");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    async fn on_sample<B: Bus>(&mut self, bus: &B, sensor_id: i64, payload: &[u8]) -> Result<()> {
        let msg: SampleMsg = decode(payload).context("bad sample payload")?;
        let Some(sensor) = self.db.get_sensor(sensor_id).await? else {
            bail!("unknown sensor {sensor_id}");
        };

        let sample = Sample {
            sensor_id,
            timestamp: msg.timestamp,
            value: msg.value,
        };
        self.db.insert_sample(&sample).await?;
        debug!(sensor_id, value = sample.value, unit = %sensor.unit, "sample stored");

        if sensor.kind == SensorKind::SoilHumidity {
            self.engine.on_sample(&self.db, bus, &sample).await?;
        }
        Ok(())
    }

    async fn on_sensor_config<B: Bus>(&mut self, bus: &B, payload: &[u8]) -> Result<()> {
        let record: SensorRecord = decode(payload).context("bad sensor config")?;
        ensure_valid(sensor_errors(&record))?;

        if self.db.get_sensor(record.id).await?.as_ref() == Some(&record) {
            debug!(sensor_id = record.id, "sensor config unchanged");
            return Ok(());
        }

        self.db.upsert_sensor(&record).await?;
        info!(sensor_id = record.id, kind = %record.kind, name = %record.name, "sensor registered");

        reconcile::ensure_default_plants(&self.db).await?;
        self.publish_sensor_info(bus).await?;
        Ok(())
    }

    async fn on_plant_config(&mut self, payload: &[u8]) -> Result<()> {
        let record: PlantRecord = decode(payload).context("bad plant config")?;
        ensure_valid(plant_errors(&record))?;

        match self.db.get_sensor(record.humidity_sensor_id).await? {
            Some(s) if s.kind == SensorKind::SoilHumidity => {}
            Some(s) => bail!(
                "plant {}: sensor {} is {}, not soil_humidity",
                record.id,
                s.id,
                s.kind
            ),
            None => bail!(
                "plant {}: unknown humidity sensor {}",
                record.id,
                record.humidity_sensor_id
            ),
        }

        let existed = self.db.get_plant(record.id).await?.is_some();
        self.db.upsert_plant(&record).await?;
        info!(
            plant_id = record.id,
            name = %record.name,
            pump_id = record.pump_id,
            updated = existed,
            "plant configured"
        );
        Ok(())
    }

    async fn on_pump_control(
        &mut self,
        pump_id: i64,
        payload: &[u8],
        received_at: OffsetDateTime,
    ) -> Result<()> {
        let cmd: PumpCommand = decode(payload).context("bad pump command")?;
        if !cmd.duration.is_finite() || cmd.duration <= 0.0 {
            bail!("pump {pump_id}: invalid duration {}", cmd.duration);
        }

        let plants = self.db.plants_for_pump(pump_id).await?;
        if plants.is_empty() {
            warn!(pump_id, "pump command for a pump with no plants, nothing logged");
            return Ok(());
        }

        for plant in &plants {
            self.db
                .insert_watering_event(&WateringEvent {
                    plant_id: plant.id,
                    timestamp: received_at,
                    duration: cmd.duration,
                })
                .await?;
            info!(plant_id = plant.id, pump_id, duration = cmd.duration, "watering event logged");
        }
        Ok(())
    }

    fn on_status(&mut self, process: &str, payload: &[u8]) {
        match Liveness::parse(payload) {
            Ok(liveness) => {
                let previous = self.peers.insert(process.to_string(), liveness);
                if previous != Some(liveness) {
                    info!(process, status = liveness.as_str(), "peer status");
                }
            }
            Err(e) => warn!(process, "bad status payload: {e}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
