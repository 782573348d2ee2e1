//! Watering decision engine: runs on every soil-humidity sample and
//! publishes a pump command when the plant is both dry and out of
//! cooldown.
//!
//! The engine never writes watering events. It publishes on
//! `pumps/control/<pump_id>`, the manager's own subscription to
//! `pumps/control/+` sees the command, and that handler logs the event
//! with the receipt time. The same path logs manual waterings.
//!
//! ```text
//! sample ──▶ plant for sensor? ──no──▶ (nothing)
//!               │yes
//!               ▼
//!        value < target - tolerance? ──no──▶ Moist
//!               │yes
//!               ▼
//!        elapsed since last watering > cooldown? ──no──▶ Cooling
//!               │yes
//!               ▼
//!        publish pumps/control/<pump_id> {duration}
//! ```
//!
//! A `watering_cooldown` of 0 lets every dry sample trigger again. That is
//! allowed but floods the pump queue when a sensor reads dry persistently.

use anyhow::Result;
use garden_bus::{publish_json, topic, Bus, PlantRecord, PumpCommand};
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::db::{Db, Sample};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// At or above the threshold.
    Moist,
    /// Dry, but the plant was watered too recently.
    Cooling { elapsed_sec: f64 },
    Water(PumpCommand),
}

/// Humidity below which the plant wants water.
pub fn threshold(plant: &PlantRecord) -> f64 {
    (plant.target - plant.humidity_tolerance) as f64
}

/// Pure decision for one sample. `last_watered` is the reference point
/// for the cooldown, `None` if the plant was never watered.
///
/// A sample older than `last_watered` (out of order) has a negative
/// elapsed time and never waters.
pub fn decide(plant: &PlantRecord, last_watered: Option<OffsetDateTime>, sample: &Sample) -> Decision {
    if sample.value >= threshold(plant) {
        return Decision::Moist;
    }

    if let Some(last) = last_watered {
        let elapsed_sec = (sample.timestamp - last).as_seconds_f64();
        if elapsed_sec <= plant.watering_cooldown as f64 {
            return Decision::Cooling { elapsed_sec };
        }
    }

    Decision::Water(PumpCommand {
        duration: plant.watering_duration as f64,
    })
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Remembers, per plant, the sample time of the last command it issued.
/// Until the command's echo is logged as a watering event, that time is
/// the cooldown reference, so a burst of dry samples cannot queue a
/// second watering.
#[derive(Debug, Default)]
pub struct WateringEngine {
    issued: HashMap<i64, OffsetDateTime>,
}

impl WateringEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on_sample<B: Bus>(
        &mut self,
        db: &Db,
        bus: &B,
        sample: &Sample,
    ) -> Result<Decision> {
        let plants = db.plants_for_sensor(sample.sensor_id).await?;
        let Some(plant) = plants.first() else {
            debug!(sensor_id = sample.sensor_id, "no plant bound to sensor");
            return Ok(Decision::Moist);
        };
        if plants.len() > 1 {
            warn!(
                sensor_id = sample.sensor_id,
                plants = plants.len(),
                plant_id = plant.id,
                "several plants bound to one humidity sensor, using the first"
            );
        }

        // Skip the event lookup in the common moist case.
        if sample.value >= threshold(plant) {
            return Ok(Decision::Moist);
        }

        let logged = db
            .last_watering_event(plant.id)
            .await?
            .map(|e| e.timestamp);
        let reference = logged.max(self.issued.get(&plant.id).copied());

        let decision = decide(plant, reference, sample);
        match decision {
            Decision::Water(cmd) => {
                publish_json(bus, &topic::pump_control(plant.pump_id), &cmd, false).await?;
                self.issued.insert(plant.id, sample.timestamp);
                info!(
                    plant_id = plant.id,
                    pump_id = plant.pump_id,
                    value = sample.value,
                    threshold = threshold(plant),
                    duration = cmd.duration,
                    "watering triggered"
                );
            }
            Decision::Cooling { elapsed_sec } => {
                debug!(
                    plant_id = plant.id,
                    value = sample.value,
                    elapsed_sec,
                    cooldown = plant.watering_cooldown,
                    "dry but cooling down"
                );
            }
            Decision::Moist => {}
        }

        Ok(decision)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{memory_db, plant, soil_sensor};
    use crate::db::WateringEvent;
    use garden_bus::MemoryBus;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    fn sample(value: f64, offset_sec: i64) -> Sample {
        Sample {
            sensor_id: 5,
            timestamp: T0 + Duration::seconds(offset_sec),
            value,
        }
    }

    /// Sensor 5 -> plant 1 on pump 3, target 50, tolerance 5, cooldown 300.
    async fn garden() -> Db {
        let db = memory_db().await;
        db.upsert_sensor(&soil_sensor(5)).await.unwrap();
        db.upsert_plant(&plant(1, 5, 3)).await.unwrap();
        db
    }

    // -- decide -------------------------------------------------------------

    #[test]
    fn threshold_is_strict() {
        let p = plant(1, 5, 3);
        assert_eq!(threshold(&p), 45.0);
        assert_eq!(decide(&p, None, &sample(45.0, 0)), Decision::Moist);
        assert_eq!(
            decide(&p, None, &sample(44.99, 0)),
            Decision::Water(PumpCommand { duration: 2.0 })
        );
    }

    #[test]
    fn never_watered_is_out_of_cooldown() {
        let p = plant(1, 5, 3);
        assert!(matches!(decide(&p, None, &sample(10.0, 0)), Decision::Water(_)));
    }

    #[test]
    fn cooldown_is_strict() {
        let p = plant(1, 5, 3);
        assert!(matches!(
            decide(&p, Some(T0), &sample(30.0, 300)),
            Decision::Cooling { .. }
        ));
        assert!(matches!(
            decide(&p, Some(T0), &sample(30.0, 301)),
            Decision::Water(_)
        ));
    }

    #[test]
    fn out_of_order_sample_never_waters() {
        let p = plant(1, 5, 3);
        let d = decide(&p, Some(T0), &sample(10.0, -1000));
        assert!(matches!(d, Decision::Cooling { elapsed_sec } if elapsed_sec < 0.0));
    }

    #[test]
    fn zero_cooldown_retriggers() {
        let mut p = plant(1, 5, 3);
        p.watering_cooldown = 0;
        assert!(matches!(decide(&p, Some(T0), &sample(30.0, 1)), Decision::Water(_)));
    }

    // -- Engine -------------------------------------------------------------

    #[tokio::test]
    async fn dry_sample_publishes_configured_duration() {
        let db = garden().await;
        let bus = MemoryBus::new();
        let mut engine = WateringEngine::new();

        engine.on_sample(&db, &bus, &sample(30.0, 0)).await.unwrap();

        let sent = bus.on_topic("pumps/control/3");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].json()["duration"], 2.0);
        assert!(!sent[0].retain);
        // The engine never logs events itself.
        assert_eq!(db.last_watering_event(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_dry_sample_inside_cooldown_is_suppressed_before_echo() {
        let db = garden().await;
        let bus = MemoryBus::new();
        let mut engine = WateringEngine::new();

        engine.on_sample(&db, &bus, &sample(30.0, 0)).await.unwrap();
        let d = engine.on_sample(&db, &bus, &sample(30.0, 10)).await.unwrap();

        assert!(matches!(d, Decision::Cooling { .. }));
        assert_eq!(bus.on_topic("pumps/control/3").len(), 1);
    }

    #[tokio::test]
    async fn watering_resumes_after_cooldown_with_logged_event() {
        let db = garden().await;
        let bus = MemoryBus::new();
        let mut engine = WateringEngine::new();

        engine.on_sample(&db, &bus, &sample(30.0, 0)).await.unwrap();
        // Echo of the command logged shortly after.
        db.insert_watering_event(&WateringEvent {
            plant_id: 1,
            timestamp: T0 + Duration::milliseconds(50),
            duration: 2.0,
        })
        .await
        .unwrap();

        engine.on_sample(&db, &bus, &sample(30.0, 10)).await.unwrap();
        assert_eq!(bus.on_topic("pumps/control/3").len(), 1);

        engine.on_sample(&db, &bus, &sample(30.0, 301)).await.unwrap();
        assert_eq!(bus.on_topic("pumps/control/3").len(), 2);
    }

    #[tokio::test]
    async fn manual_watering_starts_cooldown() {
        let db = garden().await;
        let bus = MemoryBus::new();
        let mut engine = WateringEngine::new();

        db.insert_watering_event(&WateringEvent {
            plant_id: 1,
            timestamp: T0,
            duration: 4.0,
        })
        .await
        .unwrap();

        engine.on_sample(&db, &bus, &sample(20.0, 60)).await.unwrap();
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn moist_sample_publishes_nothing() {
        let db = garden().await;
        let bus = MemoryBus::new();
        let mut engine = WateringEngine::new();

        let d = engine.on_sample(&db, &bus, &sample(80.0, 0)).await.unwrap();
        assert_eq!(d, Decision::Moist);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn sensor_without_plant_is_ignored() {
        let db = memory_db().await;
        db.upsert_sensor(&soil_sensor(5)).await.unwrap();
        let bus = MemoryBus::new();
        let mut engine = WateringEngine::new();

        engine.on_sample(&db, &bus, &sample(0.0, 0)).await.unwrap();
        assert!(bus.published().is_empty());
    }
}
