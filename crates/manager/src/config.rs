//! Process settings from the environment, plus the optional TOML seed file
//! of sensors and plants, and the validation rules shared with inbound
//! `sensors/config` / `plants/config` messages.

use anyhow::{bail, Context, Result};
use garden_bus::{PlantRecord, SensorRecord};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;

use crate::db::Db;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub db_url: String,
    pub seed_path: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            mqtt_host: env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            mqtt_port: env::var("MQTT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883),
            db_url: env::var("DB_URL").unwrap_or_else(|_| "sqlite:garden.db?mode=rwc".to_string()),
            seed_path: env::var("SEED_PATH").unwrap_or_else(|_| "garden.toml".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Seed file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub sensors: Vec<SensorRecord>,
    #[serde(default)]
    pub plants: Vec<PlantRecord>,
}

/// Longest watering a plant may request, seconds.
pub const MAX_WATERING_DURATION: i64 = 5;
pub const MAX_HUMIDITY_TOLERANCE: i64 = 50;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn sensor_errors(s: &SensorRecord) -> Vec<String> {
    let mut errors = Vec::new();
    let ctx = format!("sensor {}", s.id);

    if s.id <= 0 {
        errors.push(format!("{ctx}: id must be positive"));
    }
    if s.name.trim().is_empty() {
        errors.push(format!("{ctx}: name is empty"));
    }
    if s.sample_gap <= 0 {
        errors.push(format!(
            "{ctx}: sample_gap must be positive, got {}",
            s.sample_gap
        ));
    }
    errors
}

pub fn plant_errors(p: &PlantRecord) -> Vec<String> {
    let mut errors = Vec::new();
    let ctx = format!("plant {}", p.id);

    if p.id <= 0 {
        errors.push(format!("{ctx}: id must be positive"));
    }
    if p.name.trim().is_empty() {
        errors.push(format!("{ctx}: name is empty"));
    }
    if p.pump_id <= 0 {
        errors.push(format!("{ctx}: pump_id must be positive, got {}", p.pump_id));
    }
    if !(0..=100).contains(&p.target) {
        errors.push(format!("{ctx}: target {} out of range [0, 100]", p.target));
    }
    if p.watering_cooldown < 0 {
        errors.push(format!(
            "{ctx}: watering_cooldown must not be negative, got {}",
            p.watering_cooldown
        ));
    }
    if p.watering_duration <= 0 || p.watering_duration > MAX_WATERING_DURATION {
        errors.push(format!(
            "{ctx}: watering_duration {} out of range (0, {MAX_WATERING_DURATION}]",
            p.watering_duration
        ));
    }
    if !(0..=MAX_HUMIDITY_TOLERANCE).contains(&p.humidity_tolerance) {
        errors.push(format!(
            "{ctx}: humidity_tolerance {} out of range [0, {MAX_HUMIDITY_TOLERANCE}]",
            p.humidity_tolerance
        ));
    }
    errors
}

/// Fold a list of violations into one error, listing every one of them.
pub fn ensure_valid(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        bail!(
            "validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
    }
}

impl Seed {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let mut sensor_ids: HashSet<i64> = HashSet::new();
        for s in &self.sensors {
            errors.extend(sensor_errors(s));
            if !sensor_ids.insert(s.id) {
                errors.push(format!("sensor {}: duplicate id", s.id));
            }
        }

        let mut plant_ids: HashSet<i64> = HashSet::new();
        let mut bound_sensors: HashSet<i64> = HashSet::new();
        for p in &self.plants {
            errors.extend(plant_errors(p));
            if !plant_ids.insert(p.id) {
                errors.push(format!("plant {}: duplicate id", p.id));
            }
            if !sensor_ids.contains(&p.humidity_sensor_id) {
                errors.push(format!(
                    "plant {}: humidity_sensor_id {} does not match any defined sensor",
                    p.id, p.humidity_sensor_id
                ));
            } else if !bound_sensors.insert(p.humidity_sensor_id) {
                errors.push(format!(
                    "plant {}: humidity_sensor_id {} is already bound to another plant",
                    p.id, p.humidity_sensor_id
                ));
            }
        }

        ensure_valid(errors)
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML seed file. A missing file is not an
/// error: sensors can register themselves over the bus.
pub fn load(path: &str) -> Result<Option<Seed>> {
    if !Path::new(path).exists() {
        return Ok(None);
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read seed: {path}"))?;
    let seed: Seed =
        toml::from_str(&contents).with_context(|| format!("failed to parse seed: {path}"))?;
    seed.validate()
        .with_context(|| format!("invalid seed: {path}"))?;
    Ok(Some(seed))
}

/// Upsert all sensors and plants from the seed into the database.
pub async fn apply(seed: &Seed, db: &Db) -> Result<()> {
    for s in &seed.sensors {
        db.upsert_sensor(s)
            .await
            .with_context(|| format!("failed to upsert sensor {}", s.id))?;
    }

    for p in &seed.plants {
        db.upsert_plant(p)
            .await
            .with_context(|| format!("failed to upsert plant {}", p.id))?;
    }

    tracing::info!(
        sensors = seed.sensors.len(),
        plants = seed.plants.len(),
        "seed applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
