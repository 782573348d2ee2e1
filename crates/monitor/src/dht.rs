//! DHT-22 temperature/humidity transducer.
//!
//! One physical device backs two logical sensors. [`Dht22`] owns the
//! driver and a cache: the device is queried at most once per
//! [`MIN_QUERY_INTERVAL`], and both accessors serve the cached reading in
//! between. A failed query sleeps for the backoff and leaves the previous
//! reading in place.

use anyhow::{ensure, Result};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

pub const MIN_QUERY_INTERVAL: Duration = Duration::from_millis(2500);
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhtReading {
    pub celsius: f64,
    pub humidity: f64,
}

pub trait DhtDriver: Send {
    fn read(&mut self) -> Result<DhtReading>;
}

/// Decode the 40-bit frame: humidity x10, temperature x10 with a sign bit,
/// and a checksum byte.
pub fn decode_frame(frame: &[u8; 5]) -> Result<DhtReading> {
    let sum = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    ensure!(sum == frame[4], "dht22 checksum mismatch");

    let humidity = u16::from_be_bytes([frame[0], frame[1]]) as f64 / 10.0;
    let magnitude = u16::from_be_bytes([frame[2] & 0x7f, frame[3]]) as f64 / 10.0;
    let celsius = if frame[2] & 0x80 != 0 { -magnitude } else { magnitude };
    Ok(DhtReading { celsius, humidity })
}

// ---------------------------------------------------------------------------
// Shared, rate-limited device
// ---------------------------------------------------------------------------

struct State {
    driver: Box<dyn DhtDriver>,
    cached: Option<DhtReading>,
    last_query: Option<Instant>,
}

pub struct Dht22 {
    state: Mutex<State>,
    backoff: Duration,
}

impl Dht22 {
    pub fn new(driver: Box<dyn DhtDriver>) -> Self {
        Self::with_backoff(driver, FAILURE_BACKOFF)
    }

    pub fn with_backoff(driver: Box<dyn DhtDriver>, backoff: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                driver,
                cached: None,
                last_query: None,
            }),
            backoff,
        }
    }

    pub fn celsius(&self) -> Option<f64> {
        self.reading(Instant::now()).map(|r| r.celsius)
    }

    pub fn humidity(&self) -> Option<f64> {
        self.reading(Instant::now()).map(|r| r.humidity)
    }

    /// Latest reading as of `now`, refreshing the cache if it is stale.
    /// `None` until the first successful query.
    pub fn reading(&self, now: Instant) -> Option<DhtReading> {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };

        let stale = state
            .last_query
            .map_or(true, |t| now.saturating_duration_since(t) > MIN_QUERY_INTERVAL);
        if stale {
            state.last_query = Some(now);
            match state.driver.read() {
                Ok(r) => state.cached = Some(r),
                Err(e) => {
                    warn!("dht22 read failed, serving cached value: {e:#}");
                    thread::sleep(self.backoff);
                }
            }
        }
        state.cached
    }
}

/// Open the DHT-22 on BCM `pin`.
pub fn open(pin: u8) -> Result<Dht22> {
    #[cfg(feature = "gpio")]
    let driver: Box<dyn DhtDriver> = Box::new(gpio::GpioDht::new(pin)?);
    #[cfg(not(feature = "gpio"))]
    let driver: Box<dyn DhtDriver> = Box::new(SimDht::new(pin));
    Ok(Dht22::new(driver))
}

// ---------------------------------------------------------------------------
// Real driver: bit-banged single-wire protocol over rppal
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
mod gpio {
    use super::{decode_frame, DhtDriver, DhtReading};
    use anyhow::{bail, Result};
    use rppal::gpio::{Gpio, IoPin, Level, Mode};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Host start signal: hold the line low for at least 1 ms.
    const START_LOW: Duration = Duration::from_micros(1100);
    /// A high pulse longer than this is a 1 bit (0 is ~27 us, 1 is ~70 us).
    const ONE_THRESHOLD: Duration = Duration::from_micros(48);
    const EDGE_TIMEOUT: Duration = Duration::from_micros(200);

    pub struct GpioDht {
        pin: IoPin,
    }

    impl GpioDht {
        pub fn new(pin: u8) -> Result<Self> {
            let pin = Gpio::new()?.get(pin)?.into_io(Mode::Input);
            tracing::info!(pin = pin.pin(), "dht22 initialised");
            Ok(Self { pin })
        }

        /// Busy-wait until the line reaches `level`; returns the time spent.
        fn wait_for(&self, level: Level) -> Result<Duration> {
            let start = Instant::now();
            while self.pin.read() != level {
                if start.elapsed() > EDGE_TIMEOUT {
                    bail!("dht22 timed out waiting for {level:?}");
                }
            }
            Ok(start.elapsed())
        }
    }

    impl DhtDriver for GpioDht {
        fn read(&mut self) -> Result<DhtReading> {
            self.pin.set_mode(Mode::Output);
            self.pin.set_low();
            thread::sleep(START_LOW);
            self.pin.set_high();
            self.pin.set_mode(Mode::Input);

            // Sensor response: pull low ~80 us, then high ~80 us.
            self.wait_for(Level::Low)?;
            self.wait_for(Level::High)?;
            self.wait_for(Level::Low)?;

            let mut frame = [0u8; 5];
            for bit in 0..40 {
                self.wait_for(Level::High)?;
                let high = self.wait_for(Level::Low)?;
                if high > ONE_THRESHOLD {
                    frame[bit / 8] |= 1 << (7 - bit % 8);
                }
            }
            decode_frame(&frame)
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct SimDht {
    celsius: f64,
    humidity: f64,
}

impl SimDht {
    pub fn new(pin: u8) -> Self {
        tracing::info!(pin, "simulated dht22 (no hardware)");
        Self {
            celsius: 22.0,
            humidity: 45.0,
        }
    }
}

impl DhtDriver for SimDht {
    fn read(&mut self) -> Result<DhtReading> {
        // The real sensor fails now and then; mimic that.
        if fastrand::f32() < 0.05 {
            anyhow::bail!("simulated dht22 checksum error");
        }
        self.celsius = (self.celsius + (fastrand::f64() - 0.5) * 0.4).clamp(10.0, 35.0);
        self.humidity = (self.humidity + (fastrand::f64() - 0.5) * 2.0).clamp(20.0, 90.0);
        Ok(DhtReading {
            celsius: self.celsius,
            humidity: self.humidity,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Replays scripted results and counts device queries.
    pub(crate) struct ScriptedDht {
        pub(crate) results: Vec<Option<DhtReading>>,
        pub(crate) queries: Arc<AtomicUsize>,
    }

    impl DhtDriver for ScriptedDht {
        fn read(&mut self) -> Result<DhtReading> {
            let n = self.queries.fetch_add(1, Ordering::SeqCst);
            match self.results.get(n).copied().flatten() {
                Some(r) => Ok(r),
                None => bail!("no response"),
            }
        }
    }

    pub(crate) fn scripted(results: Vec<Option<DhtReading>>) -> (Dht22, Arc<AtomicUsize>) {
        let queries = Arc::new(AtomicUsize::new(0));
        let driver = ScriptedDht {
            results,
            queries: Arc::clone(&queries),
        };
        (Dht22::with_backoff(Box::new(driver), Duration::ZERO), queries)
    }

    const WARM: DhtReading = DhtReading {
        celsius: 21.5,
        humidity: 40.2,
    };
    const COOL: DhtReading = DhtReading {
        celsius: 18.0,
        humidity: 55.0,
    };

    // -- Frame decoding -----------------------------------------------------

    #[test]
    fn decodes_datasheet_example() {
        // 65.2 %RH, 35.1 C
        let r = decode_frame(&[0x02, 0x8c, 0x01, 0x5f, 0xee]).unwrap();
        assert_eq!(r.humidity, 65.2);
        assert_eq!(r.celsius, 35.1);
    }

    #[test]
    fn decodes_negative_temperature() {
        // -10.1 C
        let r = decode_frame(&[0x02, 0x8c, 0x80, 0x65, 0x73]).unwrap();
        assert_eq!(r.celsius, -10.1);
    }

    #[test]
    fn rejects_bad_checksum() {
        assert!(decode_frame(&[0x02, 0x8c, 0x01, 0x5f, 0x00]).is_err());
    }

    // -- Cache --------------------------------------------------------------

    #[test]
    fn both_accessors_share_one_query() {
        let (dht, queries) = scripted(vec![Some(WARM)]);
        let now = Instant::now();

        assert_eq!(dht.reading(now).map(|r| r.celsius), Some(21.5));
        assert_eq!(dht.reading(now + Duration::from_secs(1)).map(|r| r.humidity), Some(40.2));
        assert_eq!(queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refreshes_after_the_interval() {
        let (dht, queries) = scripted(vec![Some(WARM), Some(COOL)]);
        let now = Instant::now();

        dht.reading(now);
        assert_eq!(dht.reading(now + Duration::from_millis(2500)), Some(WARM));
        assert_eq!(dht.reading(now + Duration::from_millis(2600)), Some(COOL));
        assert_eq!(queries.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_refresh_serves_cached_value() {
        let (dht, _) = scripted(vec![Some(WARM), None]);
        let now = Instant::now();

        dht.reading(now);
        assert_eq!(dht.reading(now + Duration::from_secs(3)), Some(WARM));
    }

    #[test]
    fn nothing_before_first_success() {
        let (dht, _) = scripted(vec![None]);
        assert_eq!(dht.reading(Instant::now()), None);
    }
}
