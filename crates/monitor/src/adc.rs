//! ADS7830 8-bit, 8-channel ADC over I2C for the soil and light probes.
//!
//! Single-ended reads only: the command byte selects the channel, the
//! device answers with one byte (0 = 0 V, 255 = Vref). Without the `gpio`
//! feature a random-walk simulator stands in for the chip.

use anyhow::Result;
use std::sync::{Arc, Mutex};

use crate::config::ADC_CHANNELS;

/// One converter shared by every analog probe. Reads happen on the
/// blocking pool, so a std mutex is enough.
pub type SharedAdc = Arc<Mutex<dyn AnalogInput>>;

pub trait AnalogInput: Send {
    /// Raw 8-bit reading of `channel` (0-7).
    fn read(&mut self, channel: u8) -> Result<u8>;
}

// ── Command byte ────────────────────────────────────────────────────────────
//
// Layout (MSB first):
//   [7]     SD   1 = single-ended
//   [6:4]   C2-C0 channel select, interleaved: CH0,CH2,CH4,CH6,CH1,CH3,CH5,CH7
//   [3:2]   PD   01 = internal reference off, A/D converter on
//   [1:0]   unused

const SINGLE_ENDED: u8 = 0x80;
const PD_ADC_ON: u8 = 0x04;

/// Command byte for a single-ended read on `channel`.
pub fn command_for_channel(channel: u8) -> u8 {
    let select = ((channel << 2) | (channel >> 1)) & 0x07;
    SINGLE_ENDED | PD_ADC_ON | (select << 4)
}

/// Open the converter at `addr` and wrap it for sharing.
pub fn open(addr: u16) -> Result<SharedAdc> {
    #[cfg(feature = "gpio")]
    let adc = Ads7830::new(addr)?;
    #[cfg(not(feature = "gpio"))]
    let adc = SimAdc::new(addr);
    let shared: SharedAdc = Arc::new(Mutex::new(adc));
    Ok(shared)
}

// ---------------------------------------------------------------------------
// Real ADS7830 (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct Ads7830 {
    i2c: rppal::i2c::I2c,
}

#[cfg(feature = "gpio")]
impl Ads7830 {
    /// Open I2C bus 1 and address the ADS7830 at `addr`.
    pub fn new(addr: u16) -> Result<Self> {
        let mut i2c = rppal::i2c::I2c::new()?;
        i2c.set_slave_address(addr)?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "ads7830 initialised");
        Ok(Self { i2c })
    }
}

#[cfg(feature = "gpio")]
impl AnalogInput for Ads7830 {
    fn read(&mut self, channel: u8) -> Result<u8> {
        anyhow::ensure!(channel < ADC_CHANNELS, "ads7830 has no channel {channel}");
        Ok(self.i2c.smbus_read_byte(command_for_channel(channel))?)
    }
}

// ---------------------------------------------------------------------------
// Simulator (development, no hardware)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Each channel wanders around mid-scale with mean reversion and a little
/// conversion noise.
pub struct SimAdc {
    levels: [f64; ADC_CHANNELS as usize],
}

const SIM_CENTER: f64 = 128.0;
const SIM_WALK_SIGMA: f64 = 3.0;
const SIM_REVERSION: f64 = 0.05;
const SIM_NOISE_SIGMA: f64 = 1.5;

impl SimAdc {
    pub fn new(addr: u16) -> Self {
        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            "simulated ads7830 (no hardware)"
        );
        let mut levels = [SIM_CENTER; ADC_CHANNELS as usize];
        for level in &mut levels {
            *level += 40.0 * approx_std_normal();
        }
        Self { levels }
    }
}

impl AnalogInput for SimAdc {
    fn read(&mut self, channel: u8) -> Result<u8> {
        let Some(level) = self.levels.get_mut(channel as usize) else {
            anyhow::bail!("ads7830 has no channel {channel}");
        };
        *level += SIM_WALK_SIGMA * approx_std_normal() + SIM_REVERSION * (SIM_CENTER - *level);
        *level = level.clamp(0.0, 255.0);
        let noisy = *level + SIM_NOISE_SIGMA * approx_std_normal();
        Ok(noisy.round().clamp(0.0, 255.0) as u8)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- Command byte -------------------------------------------------------

    #[test]
    fn command_bytes_follow_interleaved_channel_order() {
        let cmds: Vec<u8> = (0..8).map(command_for_channel).collect();
        assert_eq!(cmds, vec![0x84, 0xc4, 0x94, 0xd4, 0xa4, 0xe4, 0xb4, 0xf4]);
    }

    // -- Simulator ----------------------------------------------------------

    #[test]
    fn sim_reads_every_channel() {
        let mut adc = SimAdc::new(0x4b);
        for ch in 0..ADC_CHANNELS {
            adc.read(ch).unwrap();
        }
    }

    #[test]
    fn sim_rejects_missing_channel() {
        let mut adc = SimAdc::new(0x4b);
        assert!(adc.read(8).is_err());
    }

    #[test]
    fn sim_stays_coherent_between_reads() {
        let mut adc = SimAdc::new(0x4b);
        let a = adc.read(3).unwrap() as i32;
        let b = adc.read(3).unwrap() as i32;
        assert!((a - b).abs() < 60, "jumped from {a} to {b}");
    }
}
