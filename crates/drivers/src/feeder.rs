//! Servo-gated fish feeder: swing the gate open, hold, swing it shut.

use std::thread;
use std::time::Duration;

#[cfg(feature = "hardware")]
use rppal::gpio::{Gpio, OutputPin};

use crate::DriverError;

const OPEN_DEG: f64 = 90.0;
const CLOSED_DEG: f64 = 0.0;
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
const SERVO_HZ: f64 = 50.0;
/// Time for the horn to reach its position before the pulse train stops.
const SETTLE: Duration = Duration::from_millis(500);

/// Duty cycle (percent) for a hobby servo at 50 Hz: 2 % at 0°, 12 % at 180°.
pub fn duty_for_angle(angle: f64) -> f64 {
    2.0 + angle.clamp(0.0, 180.0) / 18.0
}

#[cfg(feature = "hardware")]
pub struct Feeder {
    pin: OutputPin,
    gpio: u8,
}

#[cfg(feature = "hardware")]
impl Feeder {
    pub fn new(gpio: u8) -> Result<Self, DriverError> {
        let mut pin = Gpio::new()?.get(gpio)?.into_output();
        pin.set_low();
        tracing::info!(gpio, "feeder servo initialised");
        Ok(Self { pin, gpio })
    }

    fn set_angle(&mut self, angle: f64) -> Result<(), DriverError> {
        self.pin
            .set_pwm_frequency(SERVO_HZ, duty_for_angle(angle) / 100.0)?;
        thread::sleep(SETTLE);
        // Stop pulsing so the servo does not jitter while idle.
        self.pin.clear_pwm()?;
        self.pin.set_low();
        tracing::debug!(gpio = self.gpio, angle, "feeder servo moved");
        Ok(())
    }
}

#[cfg(not(feature = "hardware"))]
pub struct Feeder {
    gpio: u8,
    angle: f64,
}

#[cfg(not(feature = "hardware"))]
impl Feeder {
    pub fn new(gpio: u8) -> Result<Self, DriverError> {
        tracing::info!(gpio, "[sim] feeder servo registered");
        Ok(Self {
            gpio,
            angle: CLOSED_DEG,
        })
    }

    fn set_angle(&mut self, angle: f64) -> Result<(), DriverError> {
        tracing::debug!(duty = duty_for_angle(angle), "[sim] servo pulse");
        thread::sleep(SETTLE / 10);
        self.angle = angle;
        tracing::debug!(gpio = self.gpio, angle, "[sim] feeder servo moved");
        Ok(())
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }
}

impl Feeder {
    /// Open the gate, hold it for `hold`, close it again. Blocks throughout.
    pub fn dispense(&mut self, hold: Duration) -> Result<(), DriverError> {
        tracing::info!(hold_secs = hold.as_secs_f64(), "feeder opening");
        self.set_angle(OPEN_DEG)?;
        thread::sleep(hold);
        self.set_angle(CLOSED_DEG)?;
        tracing::info!("feeder closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_endpoints() {
        assert_eq!(duty_for_angle(0.0), 2.0);
        assert_eq!(duty_for_angle(90.0), 7.0);
        assert_eq!(duty_for_angle(180.0), 12.0);
        assert_eq!(duty_for_angle(270.0), 12.0);
    }

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn dispense_leaves_gate_closed() {
        let mut f = Feeder::new(6).unwrap();
        f.dispense(Duration::from_millis(5)).unwrap();
        assert_eq!(f.angle(), CLOSED_DEG);
    }
}
