//! BH1750 ambient light sensor on I2C.

#[cfg(feature = "hardware")]
use rppal::i2c::I2c;
#[cfg(feature = "hardware")]
use std::{thread, time::Duration};

use crate::DriverError;

const POWER_DOWN: u8 = 0x00;
const POWER_ON: u8 = 0x01;
/// One-time high resolution mode (1 lx, ~120 ms conversion); the chip
/// powers itself down after the measurement.
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
const ONE_TIME_HIGH_RES: u8 = 0x20;
#[cfg(feature = "hardware")]
const CONVERSION_TIME: Duration = Duration::from_millis(180);

/// Datasheet scale: counts / 1.2 = lux.
pub fn raw_to_lux(msb: u8, lsb: u8) -> f64 {
    f64::from(u16::from_be_bytes([msb, lsb])) / 1.2
}

// ---------------------------------------------------------------------------
// Real sensor
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
pub struct LightSensor {
    i2c: I2c,
}

#[cfg(feature = "hardware")]
impl LightSensor {
    pub fn new(bus: u8, address: u16) -> Result<Self, DriverError> {
        let mut i2c = I2c::with_bus(bus)?;
        i2c.set_slave_address(address)?;
        tracing::info!(bus, address = format_args!("{address:#04x}"), "bh1750 initialised");
        Ok(Self { i2c })
    }

    pub fn power_on(&mut self) -> Result<(), DriverError> {
        self.i2c.write(&[POWER_ON])?;
        Ok(())
    }

    pub fn power_down(&mut self) -> Result<(), DriverError> {
        self.i2c.write(&[POWER_DOWN])?;
        Ok(())
    }

    pub fn read_lux(&mut self) -> Result<Option<f64>, DriverError> {
        self.i2c.write(&[ONE_TIME_HIGH_RES])?;
        thread::sleep(CONVERSION_TIME);
        let mut buf = [0u8; 2];
        self.i2c.read(&mut buf)?;
        Ok(Some(raw_to_lux(buf[0], buf[1])))
    }
}

// ---------------------------------------------------------------------------
// Simulated sensor
// ---------------------------------------------------------------------------

#[cfg(not(feature = "hardware"))]
pub struct LightSensor {
    powered: bool,
}

#[cfg(not(feature = "hardware"))]
impl LightSensor {
    pub fn new(bus: u8, address: u16) -> Result<Self, DriverError> {
        tracing::info!(bus, address = format_args!("{address:#04x}"), "[sim] bh1750 registered");
        Ok(Self { powered: false })
    }

    pub fn power_on(&mut self) -> Result<(), DriverError> {
        tracing::debug!(opcode = POWER_ON, "[sim] bh1750 power on");
        self.powered = true;
        Ok(())
    }

    pub fn power_down(&mut self) -> Result<(), DriverError> {
        tracing::debug!(opcode = POWER_DOWN, "[sim] bh1750 power down");
        self.powered = false;
        Ok(())
    }

    /// Greenhouse daylight around 500 lx. Reads as absent while powered down.
    pub fn read_lux(&mut self) -> Result<Option<f64>, DriverError> {
        if !self.powered {
            return Ok(None);
        }
        let counts = crate::sim::bounded(600.0, 30.0, 0.0, 65535.0).round() as u16;
        let [msb, lsb] = counts.to_be_bytes();
        Ok(Some(raw_to_lux(msb, lsb)))
    }
}
