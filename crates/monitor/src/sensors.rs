//! Logical sensors: each one pairs the registry fields with a probe that
//! knows how to turn raw hardware output into a published value.

use anyhow::{bail, Result};
use garden_bus::SensorKind;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::adc::SharedAdc;
use crate::config::LocalSensor;
use crate::dht::Dht22;
use crate::reconcile::ConfigCache;

pub const ANALOG_ATTEMPTS: u32 = 3;
pub const ANALOG_BACKOFF: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

pub fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// Linear map of `raw` between two calibration points onto 0-100 %.
fn percent_between(raw: f64, zero: f64, full: f64) -> f64 {
    round_to((raw - zero) / (full - zero) * 100.0, 2).clamp(0.0, 100.0)
}

/// Capacitive probes read lower when wetter.
pub fn soil_percent(raw: u8, dry: f64, wet: f64) -> f64 {
    percent_between(raw as f64, dry, wet)
}

/// Photoresistor reads higher when brighter.
pub fn light_percent(raw: u8, dark: f64, light: f64) -> f64 {
    percent_between(raw as f64, dark, light)
}

pub fn to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Units such as `°F` or `F` select Fahrenheit; anything else is Celsius.
pub fn wants_fahrenheit(unit: &str) -> bool {
    unit.chars().any(|c| c == 'F' || c == 'f')
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Hardware {
    pub adc: SharedAdc,
    pub dht: Arc<Dht22>,
}

#[derive(Clone)]
pub enum Probe {
    SoilHumidity { adc: SharedAdc, channel: u8, dry: f64, wet: f64 },
    Light { adc: SharedAdc, channel: u8, dark: f64, light: f64 },
    AmbientHumidity { dht: Arc<Dht22> },
    AmbientTemperature { dht: Arc<Dht22>, fahrenheit: bool },
}

/// Read `channel`, retrying with a fixed backoff. `None` once every
/// attempt has failed.
pub fn read_with_retry(adc: &SharedAdc, channel: u8, attempts: u32, backoff: Duration) -> Option<u8> {
    for attempt in 1..=attempts {
        let result = match adc.lock() {
            Ok(mut a) => a.read(channel),
            Err(poisoned) => poisoned.into_inner().read(channel),
        };
        match result {
            Ok(raw) => return Some(raw),
            Err(e) => {
                warn!(channel, attempt, "adc read failed: {e:#}");
                if attempt < attempts {
                    thread::sleep(backoff);
                }
            }
        }
    }
    None
}

impl Probe {
    fn build(cfg: &LocalSensor, hw: &Hardware) -> Result<Self> {
        // The type may have come from a broadcast after the file was validated.
        let errors = cfg.calibration_errors();
        if !errors.is_empty() {
            bail!("{}", errors.join("; "));
        }
        let analog = |low: Option<f64>, high: Option<f64>| match (cfg.adc_index, low, high) {
            (Some(ch), Some(l), Some(h)) => Ok((ch, l, h)),
            _ => bail!("sensor {}: missing calibration for {}", cfg.id, cfg.kind),
        };

        Ok(match cfg.kind {
            SensorKind::SoilHumidity => {
                let (channel, dry, wet) = analog(cfg.dry_value, cfg.wet_value)?;
                Self::SoilHumidity { adc: Arc::clone(&hw.adc), channel, dry, wet }
            }
            SensorKind::Light => {
                let (channel, dark, light) = analog(cfg.dark_value, cfg.light_value)?;
                Self::Light { adc: Arc::clone(&hw.adc), channel, dark, light }
            }
            SensorKind::AmbientHumidity => Self::AmbientHumidity { dht: Arc::clone(&hw.dht) },
            SensorKind::AmbientTemperature => Self::AmbientTemperature {
                dht: Arc::clone(&hw.dht),
                fahrenheit: wants_fahrenheit(&cfg.unit),
            },
        })
    }

    /// Blocking read. `None` means no value this round; the failure has
    /// already been logged.
    pub fn read(&self) -> Option<f64> {
        self.read_with(ANALOG_BACKOFF)
    }

    fn read_with(&self, backoff: Duration) -> Option<f64> {
        match self {
            Self::SoilHumidity { adc, channel, dry, wet } => {
                read_with_retry(adc, *channel, ANALOG_ATTEMPTS, backoff)
                    .map(|raw| soil_percent(raw, *dry, *wet))
            }
            Self::Light { adc, channel, dark, light } => {
                read_with_retry(adc, *channel, ANALOG_ATTEMPTS, backoff)
                    .map(|raw| light_percent(raw, *dark, *light))
            }
            Self::AmbientHumidity { dht } => dht.humidity().map(|h| round_to(h, 1)),
            Self::AmbientTemperature { dht, fahrenheit } => dht.celsius().map(|c| {
                let value = if *fahrenheit { to_fahrenheit(c) } else { c };
                round_to(value, 1)
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Sensor {
    pub id: i64,
    pub unit: String,
    pub sample_gap: Duration,
    pub last_sample: Instant,
    pub probe: Probe,
}

impl Sensor {
    /// Strictly more than `sample_gap` since the last sample.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sample) > self.sample_gap
    }
}

/// Owned set of live sensors, rebuilt from the config cache after every
/// reconciliation.
#[derive(Default)]
pub struct SensorSet {
    sensors: BTreeMap<i64, Sensor>,
}

impl SensorSet {
    /// Build from `cache`. Sensors that already exist keep their
    /// `last_sample`; new ones start their first gap at `now`. A sensor
    /// whose calibration does not fit its type is logged and skipped.
    pub fn rebuild(&mut self, cache: &ConfigCache, hw: &Hardware, now: Instant) {
        let mut next = BTreeMap::new();
        for cfg in cache.sensors() {
            let probe = match Probe::build(cfg, hw) {
                Ok(p) => p,
                Err(e) => {
                    warn!("sensor not sampled: {e:#}");
                    continue;
                }
            };
            let last_sample = self
                .sensors
                .get(&cfg.id)
                .map_or(now, |s| s.last_sample);
            next.insert(
                cfg.id,
                Sensor {
                    id: cfg.id,
                    unit: cfg.unit.clone(),
                    sample_gap: Duration::from_secs(cfg.sample_gap.max(0) as u64),
                    last_sample,
                    probe,
                },
            );
        }
        self.sensors = next;
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    #[cfg(test)]
    pub fn get(&self, id: i64) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    /// Sensors due at `now`, stamped as sampled before any read happens.
    pub fn take_due(&mut self, now: Instant) -> Vec<(i64, String, Probe)> {
        self.sensors
            .values_mut()
            .filter(|s| s.is_due(now))
            .map(|s| {
                s.last_sample = now;
                (s.id, s.unit.clone(), s.probe.clone())
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adc::AnalogInput;
    use crate::config::tests::{ambient, soil};
    use crate::dht::tests::scripted;
    use crate::dht::DhtReading;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves queued raw values; an empty queue is a read error.
    pub(crate) struct FixedAdc(pub(crate) VecDeque<Option<u8>>);

    impl AnalogInput for FixedAdc {
        fn read(&mut self, channel: u8) -> Result<u8> {
            match self.0.pop_front().flatten() {
                Some(raw) => Ok(raw),
                None => bail!("no ack on channel {channel}"),
            }
        }
    }

    pub(crate) fn fixed_adc(values: &[Option<u8>]) -> SharedAdc {
        Arc::new(Mutex::new(FixedAdc(values.iter().copied().collect())))
    }

    pub(crate) fn hardware(values: &[Option<u8>]) -> Hardware {
        let (dht, _) = scripted(vec![Some(DhtReading {
            celsius: 20.0,
            humidity: 48.26,
        })]);
        Hardware {
            adc: fixed_adc(values),
            dht: Arc::new(dht),
        }
    }

    // -- Calibration --------------------------------------------------------

    #[test]
    fn soil_maps_dry_to_zero_and_wet_to_hundred() {
        assert_eq!(soil_percent(200, 200.0, 80.0), 0.0);
        assert_eq!(soil_percent(80, 200.0, 80.0), 100.0);
        assert_eq!(soil_percent(140, 200.0, 80.0), 50.0);
        assert_eq!(soil_percent(130, 200.0, 80.0), 58.33);
    }

    #[test]
    fn readings_outside_calibration_clamp() {
        assert_eq!(soil_percent(250, 200.0, 80.0), 0.0);
        assert_eq!(soil_percent(10, 200.0, 80.0), 100.0);
        assert_eq!(light_percent(255, 10.0, 240.0), 100.0);
        assert_eq!(light_percent(0, 10.0, 240.0), 0.0);
    }

    #[test]
    fn light_rises_with_brightness() {
        assert_eq!(light_percent(125, 10.0, 240.0), 50.0);
    }

    #[test]
    fn temperature_units() {
        assert!(wants_fahrenheit("°F"));
        assert!(wants_fahrenheit("Â°f"));
        assert!(!wants_fahrenheit("°C"));
        assert_eq!(to_fahrenheit(20.0), 68.0);
    }

    // -- Probes -------------------------------------------------------------

    #[test]
    fn analog_read_retries_then_succeeds() {
        let adc = fixed_adc(&[None, None, Some(7)]);
        assert_eq!(read_with_retry(&adc, 0, 3, Duration::ZERO), Some(7));
    }

    #[test]
    fn analog_read_gives_up_after_attempts() {
        let adc = fixed_adc(&[None, None, None, Some(7)]);
        assert_eq!(read_with_retry(&adc, 0, 3, Duration::ZERO), None);
    }

    #[test]
    fn dht_probes_round_to_one_decimal() {
        let hw = hardware(&[]);
        let humidity = Probe::build(&ambient(1, SensorKind::AmbientHumidity, "%"), &hw).unwrap();
        let temp_f = Probe::build(&ambient(2, SensorKind::AmbientTemperature, "°F"), &hw).unwrap();
        let temp_c = Probe::build(&ambient(3, SensorKind::AmbientTemperature, "°C"), &hw).unwrap();

        assert_eq!(humidity.read_with(Duration::ZERO), Some(48.3));
        assert_eq!(temp_f.read_with(Duration::ZERO), Some(68.0));
        assert_eq!(temp_c.read_with(Duration::ZERO), Some(20.0));
    }

    #[test]
    fn soil_probe_converts_raw() {
        let hw = hardware(&[Some(140)]);
        let probe = Probe::build(&soil(1, 0), &hw).unwrap();
        assert_eq!(probe.read_with(Duration::ZERO), Some(50.0));
    }

    // -- Registry -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn sensors_become_due_strictly_after_gap() {
        let hw = hardware(&[]);
        let cache = ConfigCache::new(vec![soil(1, 0)]);
        let mut set = SensorSet::default();
        let t0 = Instant::now();
        set.rebuild(&cache, &hw, t0);

        assert!(set.take_due(t0 + Duration::from_secs(60)).is_empty());
        let due = set.take_due(t0 + Duration::from_millis(60_250));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 1);
        // Stamped on take, so the next gap starts now.
        assert!(set.take_due(t0 + Duration::from_secs(61)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_keeps_sample_clock_and_drops_uncalibrated() {
        let hw = hardware(&[]);
        let t0 = Instant::now();
        let mut set = SensorSet::default();
        set.rebuild(&ConfigCache::new(vec![soil(1, 0)]), &hw, t0);

        let mut broken = ambient(2, SensorKind::Light, "%");
        broken.adc_index = Some(1);
        let cache = ConfigCache::new(vec![soil(1, 0), broken]);
        set.rebuild(&cache, &hw, t0 + Duration::from_secs(30));

        assert_eq!(set.len(), 1);
        assert_eq!(set.get(1).unwrap().last_sample, t0);
    }

    #[tokio::test(start_paused = true)]
    async fn retyped_sensor_with_equal_bounds_is_not_sampled() {
        let hw = hardware(&[Some(100)]);
        let mut sensor = soil(1, 0);
        sensor.dark_value = Some(50.0);
        sensor.light_value = Some(50.0);
        let mut cache = ConfigCache::new(vec![sensor]);
        let mut set = SensorSet::default();
        set.rebuild(&cache, &hw, Instant::now());
        assert_eq!(set.len(), 1);

        let mut record = cache.get(1).unwrap().record();
        record.kind = SensorKind::Light;
        assert_eq!(cache.apply_broadcast(&[record]).updated, vec![1]);
        set.rebuild(&cache, &hw, Instant::now());

        assert!(set.get(1).is_none());
    }
}
