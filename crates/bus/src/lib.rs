//! Message-bus contract shared by `garden-manager` and `garden-monitor`:
//! topic names and routing, JSON payloads, and the publish seam.

pub mod client;
pub mod error;
pub mod messages;
pub mod topic;

pub use client::{announce, connect, publish_json, shutdown, Bus, MqttBus, CLIENT_CAPACITY, QOS};
#[cfg(any(test, feature = "test-util"))]
pub use client::{MemoryBus, Published};
pub use error::{BusError, PayloadError};
pub use messages::{
    decode, Liveness, PlantRecord, PumpCommand, SampleMsg, SensorKind, SensorRecord,
};
pub use topic::Router;
