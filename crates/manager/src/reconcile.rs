//! Manager side of config reconciliation: every soil-humidity sensor must
//! own exactly one plant.
//!
//! Synthesis is a read-then-create sequence. It runs only from the
//! manager's single dispatch loop, and `plant.humidity_sensor_id` is
//! UNIQUE, so a racing writer gets its insert rejected instead of
//! creating a second plant for the same sensor.

use anyhow::Result;
use garden_bus::{PlantRecord, SensorKind};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::db::Db;

pub const DEFAULT_TARGET: i64 = 50;
pub const DEFAULT_COOLDOWN_SEC: i64 = 300;
pub const DEFAULT_DURATION_SEC: i64 = 1;
pub const DEFAULT_TOLERANCE: i64 = 5;

/// Default plant number `n` (1-based), bound to `sensor_id` and pump `n`.
pub fn default_plant(n: i64, sensor_id: i64) -> PlantRecord {
    PlantRecord {
        id: n,
        name: format!("plant_{n}"),
        humidity_sensor_id: sensor_id,
        pump_id: n,
        target: DEFAULT_TARGET,
        watering_cooldown: DEFAULT_COOLDOWN_SEC,
        watering_duration: DEFAULT_DURATION_SEC,
        humidity_tolerance: DEFAULT_TOLERANCE,
    }
}

/// Create a default plant for every soil-humidity sensor that has none.
/// Returns the plants that were committed.
pub async fn ensure_default_plants(db: &Db) -> Result<Vec<PlantRecord>> {
    let sensors = db.load_sensors().await?;
    let plants = db.load_plants().await?;

    let bound: HashSet<i64> = plants.iter().map(|p| p.humidity_sensor_id).collect();
    let mut n = plants.iter().map(|p| p.id).max().unwrap_or(0);
    let mut created = Vec::new();

    for sensor in sensors
        .iter()
        .filter(|s| s.kind == SensorKind::SoilHumidity && !bound.contains(&s.id))
    {
        let plant = default_plant(n + 1, sensor.id);
        if db.insert_plant_if_absent(&plant).await? {
            info!(
                plant_id = plant.id,
                sensor_id = sensor.id,
                pump_id = plant.pump_id,
                "created default plant"
            );
            n += 1;
            created.push(plant);
        } else {
            warn!(
                sensor_id = sensor.id,
                "default plant rejected: sensor or plant id already taken"
            );
        }
    }

    Ok(created)
}

// ===========================================================================
// Tests
// ===========================================================================
