//! Monitor side of config reconciliation.
//!
//! The manager's retained `sensors/info` array is authoritative for the
//! registry fields (type, name, unit, sample_gap). Calibration stays
//! local. Sensors the manager has never heard of are announced upstream on
//! `sensors/config`, once per distinct record.

use garden_bus::SensorRecord;
use std::collections::{BTreeMap, HashMap};

use crate::config::LocalSensor;

#[derive(Debug, Default, PartialEq)]
pub struct Reconciled {
    /// Local sensors whose registry fields changed.
    pub updated: Vec<i64>,
    /// Records to publish on `sensors/config`.
    pub announce: Vec<SensorRecord>,
}

#[derive(Debug)]
pub struct ConfigCache {
    sensors: BTreeMap<i64, LocalSensor>,
    /// Last record announced for each id the manager did not know.
    announced: HashMap<i64, SensorRecord>,
}

impl ConfigCache {
    pub fn new(sensors: Vec<LocalSensor>) -> Self {
        Self {
            sensors: sensors.into_iter().map(|s| (s.id, s)).collect(),
            announced: HashMap::new(),
        }
    }

    pub fn sensors(&self) -> impl Iterator<Item = &LocalSensor> {
        self.sensors.values()
    }

    #[cfg(test)]
    pub fn get(&self, id: i64) -> Option<&LocalSensor> {
        self.sensors.get(&id)
    }

    /// Merge one `sensors/info` snapshot. Broadcast ids with no local
    /// hardware are ignored.
    pub fn apply_broadcast(&mut self, info: &[SensorRecord]) -> Reconciled {
        let mut out = Reconciled::default();
        let known: HashMap<i64, &SensorRecord> = info.iter().map(|r| (r.id, r)).collect();

        for (id, local) in &mut self.sensors {
            match known.get(id) {
                Some(record) => {
                    self.announced.remove(id);
                    if local.adopt(record) {
                        out.updated.push(*id);
                    }
                }
                None => {
                    let record = local.record();
                    if self.announced.get(id) != Some(&record) {
                        self.announced.insert(*id, record.clone());
                        out.announce.push(record);
                    }
                }
            }
        }
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================
