//! Inbound message handling and sample publishing for the monitor.

use anyhow::{Context, Result};
use garden_bus::topic::{self, parse_id};
use garden_bus::{
    decode, publish_json, Bus, BusError, PayloadError, PumpCommand, Router, SampleMsg,
    SensorRecord,
};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PumpPin;
use crate::pump::{self, PumpGuard};
use crate::reconcile::ConfigCache;
use crate::sensors::{Hardware, Probe, SensorSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SensorsInfo,
    PumpControl,
}

pub fn router() -> Router<Route> {
    Router::new()
        .on(topic::SENSORS_INFO, Route::SensorsInfo)
        .on(topic::PUMPS_CONTROL_ALL, Route::PumpControl)
}

pub struct Monitor {
    router: Router<Route>,
    cache: ConfigCache,
    sensors: SensorSet,
    hardware: Hardware,
    pumps: Vec<PumpPin>,
    guard: PumpGuard,
}

impl Monitor {
    pub fn new(cache: ConfigCache, hardware: Hardware, pumps: Vec<PumpPin>, guard: PumpGuard) -> Self {
        let mut sensors = SensorSet::default();
        sensors.rebuild(&cache, &hardware, Instant::now());
        info!(sensors = sensors.len(), pumps = pumps.len(), "monitor ready");
        Self {
            router: router(),
            cache,
            sensors,
            hardware,
            pumps,
            guard,
        }
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.router.patterns()
    }

    pub async fn handle<B: Bus>(&mut self, bus: &B, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        let Some((route, captures)) = self.router.route(topic) else {
            debug!(topic, "unhandled topic");
            return Ok(());
        };

        let outcome = match route {
            Route::SensorsInfo => self.on_sensors_info(bus, payload).await,
            Route::PumpControl => {
                let segment = captures.first().copied().unwrap_or_default();
                match parse_id(segment) {
                    Some(id) => self.on_pump_control(id, payload),
                    None => Err(PayloadError::TopicId(segment.to_string()).into()),
                }
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

    async fn on_sensors_info<B: Bus>(&mut self, bus: &B, payload: &[u8]) -> Result<()> {
        let info: Vec<SensorRecord> = decode(payload).context("bad sensors/info payload")?;
        let out = self.cache.apply_broadcast(&info);

        for record in &out.announce {
            publish_json(bus, topic::SENSORS_CONFIG, record, true).await?;
            info!(sensor_id = record.id, kind = %record.kind, "announced unknown sensor");
        }
        if !out.updated.is_empty() {
            self.sensors.rebuild(&self.cache, &self.hardware, Instant::now());
            info!(updated = ?out.updated, sensors = self.sensors.len(), "sensor config reconciled");
        }
        Ok(())
    }

    fn on_pump_control(&mut self, pump_id: i64, payload: &[u8]) -> Result<()> {
        let cmd: PumpCommand = decode(payload).context("bad pump command")?;
        let duration = pump::validate(pump_id, &cmd, &self.pumps).map_err(anyhow::Error::msg)?;
        // Completion is only logged by the guard; nothing waits on it here.
        self.guard.activate(pump_id, duration)?;
        info!(pump_id, duration = cmd.duration, "pump request queued");
        Ok(())
    }

    /// Sample every due sensor. Reads run on the blocking pool in a
    /// detached task so the dispatch loop keeps polling the broker.
    pub fn sample_due<B: Bus + Clone + 'static>(&mut self, bus: &B, now: Instant) {
        let due = self.sensors.take_due(now);
        if due.is_empty() {
            return;
        }
        let bus = bus.clone();
        tokio::spawn(async move {
            if let Err(e) = read_and_publish(&bus, due).await {
                warn!("sample publish failed: {e}");
            }
        });
    }

    pub async fn shutdown(self) {
        self.guard.shutdown().await;
    }
}

/// Read each probe and publish its value on `sensors/data/{id}`. A probe
/// with no value this round publishes nothing.
pub async fn read_and_publish<B: Bus>(bus: &B, due: Vec<(i64, String, Probe)>) -> Result<(), BusError> {
    for (sensor_id, unit, probe) in due {
        let value = match tokio::task::spawn_blocking(move || probe.read()).await {
            Ok(Some(v)) => v,
            Ok(None) => continue,
            Err(e) => {
                warn!(sensor_id, "sensor read panicked: {e}");
                continue;
            }
        };

        let msg = SampleMsg {
            value,
            timestamp: OffsetDateTime::now_utc(),
        };
        publish_json(bus, &topic::sensor_data(sensor_id), &msg, false).await?;
        info!(sensor_id, value, unit = %unit, "sample published");
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
