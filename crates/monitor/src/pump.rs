//! Pump relays and the guard that keeps at most one of them running.
//!
//! Every activation goes through one FIFO queue drained by a single
//! actuation task that owns the board. Requests never block the caller;
//! they get a completion handle instead. The shared power budget covers
//! all pumps, so the queue is global rather than per pump.

use anyhow::Result;
use garden_bus::PumpCommand;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::config::PumpPin;

/// Longest single activation the monitor accepts, seconds.
pub const MAX_RUN_SECONDS: f64 = 30.0;

/// Check an inbound command against the local pump map and the run limit.
pub fn validate(pump_id: i64, cmd: &PumpCommand, pumps: &[PumpPin]) -> Result<Duration, String> {
    if !pumps.iter().any(|p| p.id == pump_id) {
        return Err(format!("unknown pump {pump_id}"));
    }
    let secs = cmd.duration;
    if !secs.is_finite() || secs <= 0.0 || secs > MAX_RUN_SECONDS {
        return Err(format!(
            "pump {pump_id}: duration {secs} outside (0, {MAX_RUN_SECONDS}]"
        ));
    }
    Ok(Duration::from_secs_f64(secs))
}

pub trait Actuator: Send + 'static {
    fn set(&mut self, pump_id: i64, on: bool);
    fn all_off(&mut self);
}

// ---------------------------------------------------------------------------
// Real relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct PumpBoard {
    pins: HashMap<i64, OutputPin>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl PumpBoard {
    pub fn new(pumps: &[PumpPin], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut board = Self {
            pins: HashMap::new(),
            active_low,
        };
        for p in pumps {
            let pin = gpio.get(p.gpio)?.into_output();
            board.pins.insert(p.id, pin);
        }
        board.all_off();
        Ok(board)
    }
}

#[cfg(feature = "gpio")]
impl Actuator for PumpBoard {
    fn set(&mut self, pump_id: i64, on: bool) {
        let Some(pin) = self.pins.get_mut(&pump_id) else {
            warn!(pump_id, "unknown pump");
            return;
        };
        // Active-low relay: LOW = ON.
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }

    fn all_off(&mut self) {
        let ids: Vec<i64> = self.pins.keys().copied().collect();
        for id in ids {
            self.set(id, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct PumpBoard {
    pub(crate) pumps: HashMap<i64, bool>,
}

#[cfg(not(feature = "gpio"))]
impl PumpBoard {
    pub fn new(pumps: &[PumpPin], _active_low: bool) -> Result<Self> {
        let mut states = HashMap::new();
        for p in pumps {
            info!(pump_id = p.id, gpio = p.gpio, "mock pump registered (not wired)");
            states.insert(p.id, false);
        }
        Ok(Self { pumps: states })
    }
}

#[cfg(not(feature = "gpio"))]
impl Actuator for PumpBoard {
    fn set(&mut self, pump_id: i64, on: bool) {
        match self.pumps.get_mut(&pump_id) {
            Some(state) => *state = on,
            None => warn!(pump_id, "unknown pump"),
        }
    }

    fn all_off(&mut self) {
        for state in self.pumps.values_mut() {
            *state = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

struct Request {
    pump_id: i64,
    duration: Duration,
    done: oneshot::Sender<()>,
}

pub struct PumpGuard {
    queue: mpsc::UnboundedSender<Request>,
    stop: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

impl PumpGuard {
    /// Switch every pump off and start the actuation task.
    pub fn spawn<A: Actuator>(mut board: A) -> Self {
        board.all_off();
        let (queue, rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(actuate(board, rx, stop_rx));
        Self {
            queue,
            stop,
            worker,
        }
    }

    /// Queue an activation. The returned handle resolves once the pump has
    /// been switched off again.
    pub fn activate(&self, pump_id: i64, duration: Duration) -> Result<oneshot::Receiver<()>> {
        let (done, handle) = oneshot::channel();
        self.queue
            .send(Request {
                pump_id,
                duration,
                done,
            })
            .map_err(|_| anyhow::anyhow!("pump worker has stopped"))?;
        Ok(handle)
    }

    /// Stop the worker. An activation already running is finished, queued
    /// requests are discarded, and every pump ends up off.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        drop(self.queue);
        if let Err(e) = self.worker.await {
            warn!("pump worker ended abnormally: {e}");
        }
    }
}

async fn actuate<A: Actuator>(
    mut board: A,
    mut queue: mpsc::UnboundedReceiver<Request>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let req = tokio::select! {
            biased;
            _ = &mut stop => break,
            req = queue.recv() => match req {
                Some(r) => r,
                None => break,
            },
        };

        board.set(req.pump_id, true);
        info!(pump_id = req.pump_id, duration = req.duration.as_secs_f64(), "pump on");
        // Runs to completion, shutdown included.
        tokio::time::sleep(req.duration).await;
        board.set(req.pump_id, false);
        info!(pump_id = req.pump_id, "pump off");
        let _ = req.done.send(());

        if !matches!(stop.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            break;
        }
    }

    queue.close();
    while let Ok(req) = queue.try_recv() {
        warn!(
            pump_id = req.pump_id,
            duration = req.duration.as_secs_f64(),
            "queued pump request discarded at shutdown"
        );
    }
    board.all_off();
}

// ===========================================================================
// Tests
// ===========================================================================
