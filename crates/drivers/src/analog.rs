//! MCP3008 10-bit ADC over SPI, feeding a pH probe board and an LM35
//! temperature probe.
//!
//! Both probes hang off the same front-end, so a single driver serves the
//! `ph` and `ph_temp` sensor kinds.

#[cfg(feature = "hardware")]
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use crate::DriverError;

// ── MCP3008 framing ─────────────────────────────────────────────────────────
//
// A single-ended read is three bytes on the wire:
//   [0] 0x01           start bit
//   [1] 1 D2 D1 D0 x x x x   (SGL/DIFF=1, channel select)
//   [2] don't care
// The reply carries the 10-bit result in the low 2 bits of byte 1 and all
// of byte 2.

const START_BIT: u8 = 0x01;
const SINGLE_ENDED: u8 = 0x08;
const MAX_CHANNEL: u8 = 7;
const FULL_SCALE: f64 = 1023.0;
const VREF: f64 = 3.3;

/// Probe board output at pH 7 and its slope (V per pH unit). The board
/// output falls as pH rises.
const PH_NEUTRAL_V: f64 = 2.5;
const PH_SLOPE_V: f64 = 0.18;
const PH_NEUTRAL: f64 = 7.0;

/// LM35: 10 mV per °C.
const LM35_C_PER_V: f64 = 100.0;

/// Command bytes for a single-ended read of `channel`.
fn command_for_channel(channel: u8) -> [u8; 3] {
    [START_BIT, (SINGLE_ENDED + channel) << 4, 0]
}

/// Extract the 10-bit conversion result from a reply frame.
fn decode_reply(reply: [u8; 3]) -> u16 {
    (u16::from(reply[1] & 0b11) << 8) | u16::from(reply[2])
}

fn raw_to_volts(raw: u16) -> f64 {
    f64::from(raw) / FULL_SCALE * VREF
}

pub fn volts_to_ph(v: f64) -> f64 {
    PH_NEUTRAL + (PH_NEUTRAL_V - v) / PH_SLOPE_V
}

pub fn volts_to_celsius(v: f64) -> f64 {
    v * LM35_C_PER_V
}

fn check_channel(channel: u8) -> Result<(), DriverError> {
    if channel > MAX_CHANNEL {
        return Err(DriverError::Malformed(format!(
            "MCP3008 channel {channel} out of range (0-{MAX_CHANNEL})"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Real front-end
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
pub struct AnalogFrontEnd {
    spi: Spi,
    ph_channel: u8,
    temperature_channel: u8,
}

#[cfg(feature = "hardware")]
impl AnalogFrontEnd {
    pub fn new(
        bus: u8,
        device: u8,
        clock_hz: u32,
        ph_channel: u8,
        temperature_channel: u8,
    ) -> Result<Self, DriverError> {
        check_channel(ph_channel)?;
        check_channel(temperature_channel)?;

        let bus = match bus {
            0 => Bus::Spi0,
            1 => Bus::Spi1,
            other => return Err(DriverError::Malformed(format!("unknown SPI bus {other}"))),
        };
        let ss = match device {
            0 => SlaveSelect::Ss0,
            1 => SlaveSelect::Ss1,
            2 => SlaveSelect::Ss2,
            other => {
                return Err(DriverError::Malformed(format!("unknown SPI device {other}")))
            }
        };
        let spi = Spi::new(bus, ss, clock_hz, Mode::Mode0)?;

        tracing::info!(clock_hz, ph_channel, temperature_channel, "mcp3008 initialised");
        Ok(Self {
            spi,
            ph_channel,
            temperature_channel,
        })
    }

    fn read_channel(&mut self, channel: u8) -> Result<u16, DriverError> {
        let mut reply = [0u8; 3];
        self.spi.transfer(&mut reply, &command_for_channel(channel))?;
        Ok(decode_reply(reply))
    }

    pub fn read_ph(&mut self) -> Result<Option<f64>, DriverError> {
        let raw = self.read_channel(self.ph_channel)?;
        Ok(Some(volts_to_ph(raw_to_volts(raw))))
    }

    pub fn read_temperature(&mut self) -> Result<Option<f64>, DriverError> {
        let raw = self.read_channel(self.temperature_channel)?;
        Ok(Some(volts_to_celsius(raw_to_volts(raw))))
    }
}

// ---------------------------------------------------------------------------
// Simulated front-end
// ---------------------------------------------------------------------------

#[cfg(not(feature = "hardware"))]
pub struct AnalogFrontEnd;

#[cfg(not(feature = "hardware"))]
impl AnalogFrontEnd {
    pub fn new(
        _bus: u8,
        _device: u8,
        _clock_hz: u32,
        ph_channel: u8,
        temperature_channel: u8,
    ) -> Result<Self, DriverError> {
        check_channel(ph_channel)?;
        check_channel(temperature_channel)?;
        tracing::info!("[sim] mcp3008 registered");
        Ok(Self)
    }

    /// Raw counts near the neutral point of the probe board (pH ≈ 7.0).
    fn simulated_raw(mean: f64, sigma: f64) -> u16 {
        crate::sim::bounded(mean, sigma, 0.0, FULL_SCALE).round() as u16
    }

    pub fn read_ph(&mut self) -> Result<Option<f64>, DriverError> {
        let raw = Self::simulated_raw(775.0, 4.0);
        Ok(Some(volts_to_ph(raw_to_volts(raw))))
    }

    pub fn read_temperature(&mut self) -> Result<Option<f64>, DriverError> {
        let raw = Self::simulated_raw(74.0, 1.0);
        Ok(Some(volts_to_celsius(raw_to_volts(raw))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_channel_0() {
        assert_eq!(command_for_channel(0), [0x01, 0x80, 0x00]);
    }

    #[test]
    fn command_channel_7() {
        assert_eq!(command_for_channel(7), [0x01, 0xF0, 0x00]);
    }

    #[test]
    fn decode_masks_upper_bits() {
        // Garbage in the high bits of byte 1 must be ignored.
        assert_eq!(decode_reply([0xFF, 0b1111_1110, 0x34]), 0x234);
        assert_eq!(decode_reply([0x00, 0x03, 0xFF]), 1023);
    }

    #[test]
    fn neutral_voltage_is_ph_seven() {
        assert!((volts_to_ph(2.5) - 7.0).abs() < 1e-9);
        // One slope step above neutral is one pH unit more acidic.
        assert!((volts_to_ph(2.5 + 0.18) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn lm35_scaling() {
        assert!((volts_to_celsius(0.25) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn full_scale_is_vref() {
        assert!((raw_to_volts(1023) - 3.3).abs() < 1e-9);
    }

    #[test]
    fn channel_out_of_range_rejected() {
        assert!(check_channel(8).is_err());
        assert!(check_channel(7).is_ok());
    }
}
