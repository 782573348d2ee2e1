//! JSON payloads carried on the topics in [`crate::topic`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

use crate::error::{BusError, PayloadError};

// ---------------------------------------------------------------------------
// Sensor kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    SoilHumidity,
    AmbientHumidity,
    AmbientTemperature,
    Light,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SoilHumidity => "soil_humidity",
            Self::AmbientHumidity => "ambient_humidity",
            Self::AmbientTemperature => "ambient_temperature",
            Self::Light => "light",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "soil_humidity" => Some(Self::SoilHumidity),
            "ambient_humidity" => Some(Self::AmbientHumidity),
            "ambient_temperature" => Some(Self::AmbientTemperature),
            "light" => Some(Self::Light),
            _ => None,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `sensors/data/{sensor_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMsg {
    pub value: f64,
    #[serde(with = "iso8601")]
    pub timestamp: OffsetDateTime,
}

/// `sensors/config`, and each element of the `sensors/info` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: SensorKind,
    pub name: String,
    pub unit: String,
    /// Seconds between samples.
    pub sample_gap: i64,
}

/// `plants/config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlantRecord {
    pub id: i64,
    pub name: String,
    pub humidity_sensor_id: i64,
    pub pump_id: i64,
    /// Target soil humidity, percent.
    pub target: i64,
    /// Minimum seconds between two waterings.
    pub watering_cooldown: i64,
    /// Seconds the pump runs per watering.
    pub watering_duration: i64,
    /// Percentage points below `target` tolerated before watering.
    pub humidity_tolerance: i64,
}

/// `pumps/control/{pump_id}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpCommand {
    /// Seconds to run the pump.
    pub duration: f64,
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Raw (non-JSON) payload of `status/{process}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Offline,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        match std::str::from_utf8(payload)?.trim() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(PayloadError::Liveness(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, PayloadError> {
    let text = std::str::from_utf8(payload)?;
    Ok(serde_json::from_str(text)?)
}

pub fn encode<T: Serialize + ?Sized>(msg: &T) -> Result<Vec<u8>, BusError> {
    Ok(serde_json::to_vec(msg)?)
}

/// RFC 3339 on the way out (always UTC). On the way in, RFC 3339 or a
/// naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` which is taken as UTC.
pub mod iso8601 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::macros::format_description;
    use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

    pub fn serialize<S: Serializer>(ts: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        let text = ts
            .to_offset(UtcOffset::UTC)
            .format(&Rfc3339)
            .map_err(serde::ser::Error::custom)?;
        s.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
        let text = String::deserialize(d)?;
        parse(&text).map_err(serde::de::Error::custom)
    }

    pub fn parse(text: &str) -> Result<OffsetDateTime, time::error::Parse> {
        if let Ok(ts) = OffsetDateTime::parse(text, &Rfc3339) {
            return Ok(ts);
        }
        let naive = format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
        );
        PrimitiveDateTime::parse(text, naive).map(PrimitiveDateTime::assume_utc)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
