//! Publishing side of the bus, and MQTT connection setup with the
//! retained last-will both processes use for liveness.

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, QoS};
use std::future::Future;
#[cfg(any(test, feature = "test-util"))]
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::error::BusError;
use crate::messages::{encode, Liveness};
use crate::topic;

/// Every topic in the garden contract is exchanged at QoS 2.
pub const QOS: QoS = QoS::ExactlyOnce;

/// Base capacity of the request channel between `AsyncClient` and
/// `EventLoop`.
pub const CLIENT_CAPACITY: usize = 32;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// How long a clean shutdown waits for the offline flag to reach the broker.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Bus trait
// ---------------------------------------------------------------------------

pub trait Bus: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> impl Future<Output = Result<(), BusError>> + Send;
}

/// Serialize `msg` as JSON and publish it.
pub async fn publish_json<B, T>(bus: &B, topic: &str, msg: &T, retain: bool) -> Result<(), BusError>
where
    B: Bus,
    T: serde::Serialize + ?Sized,
{
    let payload = encode(msg)?;
    bus.publish(topic, payload, retain).await
}

/// Publish the retained liveness flag for `process`.
pub async fn announce<B: Bus>(bus: &B, process: &str, liveness: Liveness) -> Result<(), BusError> {
    bus.publish(
        &topic::status(process),
        liveness.as_str().as_bytes().to_vec(),
        true,
    )
    .await
}

// ---------------------------------------------------------------------------
// MQTT implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    pub async fn subscribe(&self, pattern: &str) -> Result<(), BusError> {
        self.client.subscribe(pattern, QOS).await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        self.client.publish(topic, QOS, retain, payload).await?;
        Ok(())
    }
}

/// Build a client for `process` whose broker-side last-will marks it
/// `offline` (retained) if the connection drops uncleanly.
///
/// Handlers publish while the event loop is not being polled, so a publish
/// only completes if the request channel has room. `burst` is the most
/// publishes a single handler can issue; the channel holds that many on top
/// of `CLIENT_CAPACITY`.
pub fn connect(process: &str, host: &str, port: u16, burst: usize) -> (MqttBus, EventLoop) {
    let mut options = MqttOptions::new(process, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_last_will(LastWill::new(
        topic::status(process),
        Liveness::Offline.as_str(),
        QOS,
        true,
    ));

    let (client, eventloop) = AsyncClient::new(options, CLIENT_CAPACITY + burst);
    (MqttBus::new(client), eventloop)
}

/// Clean shutdown: mark `process` offline (retained), disconnect, and keep
/// polling the event loop until the disconnect has gone out.
pub async fn shutdown(bus: &MqttBus, eventloop: &mut EventLoop, process: &str) -> Result<(), BusError> {
    announce(bus, process, Liveness::Offline).await?;
    bus.disconnect().await?;

    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(process, "disconnect not flushed before shutdown grace elapsed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[cfg(any(test, feature = "test-util"))]
impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Records publishes instead of sending them. Used by handler tests.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    sent: Arc<Mutex<Vec<Published>>>,
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Published {
                topic: topic.to_string(),
                payload,
                retain,
            });
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
