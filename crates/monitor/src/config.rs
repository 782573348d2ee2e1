//! Monitor settings from the environment and the local static hardware
//! description (`sensor_config.toml`): sensors with their calibration,
//! pump relay pins, and bus addresses of the ADC and DHT-22.

use anyhow::{bail, Context, Result};
use garden_bus::{SensorKind, SensorRecord};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;

/// The ADS7830 has eight single-ended inputs.
pub const ADC_CHANNELS: u8 = 8;

#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub sensor_config: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            mqtt_host: env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            mqtt_port: env::var("MQTT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883),
            sensor_config: env::var("SENSOR_CONFIG")
                .unwrap_or_else(|_| "sensor_config.toml".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// I2C address of the ADS7830.
    #[serde(default = "default_adc_address")]
    pub adc_address: u16,
    /// BCM pin of the DHT-22 data line.
    #[serde(default = "default_dht_pin")]
    pub dht_pin: u8,
    /// Most relay boards switch on a low level.
    #[serde(default = "default_active_low")]
    pub active_low: bool,
    #[serde(default = "default_pumps")]
    pub pumps: Vec<PumpPin>,
    #[serde(default)]
    pub sensors: Vec<LocalSensor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PumpPin {
    pub id: i64,
    pub gpio: u8,
}

/// One locally attached sensor. The first five fields mirror the
/// manager's registry; the rest is calibration only the monitor knows.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalSensor {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: SensorKind,
    pub name: String,
    pub unit: String,
    pub sample_gap: i64,
    pub adc_index: Option<u8>,
    pub dry_value: Option<f64>,
    pub wet_value: Option<f64>,
    pub dark_value: Option<f64>,
    pub light_value: Option<f64>,
}

fn default_adc_address() -> u16 {
    0x4b
}

fn default_dht_pin() -> u8 {
    17
}

fn default_active_low() -> bool {
    true
}

fn default_pumps() -> Vec<PumpPin> {
    [(1, 26), (2, 19), (3, 13), (4, 6)]
        .into_iter()
        .map(|(id, gpio)| PumpPin { id, gpio })
        .collect()
}

impl LocalSensor {
    /// The fields shared with the manager's registry.
    pub fn record(&self) -> SensorRecord {
        SensorRecord {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            unit: self.unit.clone(),
            sample_gap: self.sample_gap,
        }
    }

    /// Overwrite the registry fields, keeping calibration. Returns true if
    /// anything changed.
    pub fn adopt(&mut self, record: &SensorRecord) -> bool {
        let before = self.record();
        self.kind = record.kind;
        self.name = record.name.clone();
        self.unit = record.unit.clone();
        self.sample_gap = record.sample_gap;
        before != *record
    }

    /// Calibration problems for the sensor's current type. Also used after
    /// a broadcast changes a sensor's type.
    pub fn calibration_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let ctx = format!("sensor {}", self.id);

        let bounds = match self.kind {
            SensorKind::SoilHumidity => Some((("dry_value", self.dry_value), ("wet_value", self.wet_value))),
            SensorKind::Light => Some((("dark_value", self.dark_value), ("light_value", self.light_value))),
            SensorKind::AmbientHumidity | SensorKind::AmbientTemperature => None,
        };

        if let Some(((low_name, low), (high_name, high))) = bounds {
            match self.adc_index {
                None => errors.push(format!("{ctx}: adc_index is required for {}", self.kind)),
                Some(ch) if ch >= ADC_CHANNELS => errors.push(format!(
                    "{ctx}: adc_index {ch} out of range (0-{})",
                    ADC_CHANNELS - 1
                )),
                Some(_) => {}
            }
            match (low, high) {
                (Some(a), Some(b)) if a == b => {
                    errors.push(format!("{ctx}: {low_name} and {high_name} must differ"))
                }
                (Some(_), Some(_)) => {}
                _ => errors.push(format!(
                    "{ctx}: {low_name} and {high_name} are required for {}",
                    self.kind
                )),
            }
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl LocalConfig {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let mut ids: HashSet<i64> = HashSet::new();
        for s in &self.sensors {
            if !ids.insert(s.id) {
                errors.push(format!("sensor {}: duplicate id", s.id));
            }
            if s.id <= 0 {
                errors.push(format!("sensor {}: id must be positive", s.id));
            }
            if s.sample_gap <= 0 {
                errors.push(format!(
                    "sensor {}: sample_gap must be positive, got {}",
                    s.id, s.sample_gap
                ));
            }
            errors.extend(s.calibration_errors());
        }

        let mut pump_ids: HashSet<i64> = HashSet::new();
        let mut pins: HashSet<u8> = HashSet::new();
        for p in &self.pumps {
            if !pump_ids.insert(p.id) {
                errors.push(format!("pump {}: duplicate id", p.id));
            }
            if !pins.insert(p.gpio) {
                errors.push(format!("pump {}: gpio {} already used", p.id, p.gpio));
            }
        }
        if pins.contains(&self.dht_pin) {
            errors.push(format!("dht_pin {} is also a pump pin", self.dht_pin));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

/// Read, parse, and validate the local configuration file.
pub fn load(path: &str) -> Result<LocalConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<LocalConfig> {
    let cfg: LocalConfig = toml::from_str(contents).context("failed to parse TOML")?;
    cfg.validate()?;
    Ok(cfg)
}

// ===========================================================================
// Tests
// ===========================================================================
