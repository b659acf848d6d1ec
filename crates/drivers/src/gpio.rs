//! Relay-driven outputs: pumps and mains relays. The `hardware` feature
//! gates the real rppal pin; without it a mock keeps the state in memory
//! and logs every change.

use std::thread;
use std::time::Duration;

#[cfg(feature = "hardware")]
use rppal::gpio::{Gpio, OutputPin};

use crate::DriverError;

// ---------------------------------------------------------------------------
// Real relay (Raspberry Pi GPIO)
// ---------------------------------------------------------------------------
#[cfg(feature = "hardware")]
pub struct Relay {
    pin: OutputPin,
    gpio: u8,
    active_low: bool, // many relay boards are active-low
    on: bool,
}

#[cfg(feature = "hardware")]
impl Relay {
    pub fn new(gpio: u8, active_low: bool) -> Result<Self, DriverError> {
        let pin = Gpio::new()?.get(gpio)?.into_output();
        let mut relay = Self {
            pin,
            gpio,
            active_low,
            on: true,
        };
        // Fail-safe: OFF at startup.
        relay.set(false);
        tracing::info!(gpio, active_low, "relay initialised");
        Ok(relay)
    }

    pub fn set(&mut self, on: bool) {
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        if on != self.on {
            tracing::info!(gpio = self.gpio, "relay {}", if on { "ON" } else { "OFF" });
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "hardware"))]
pub struct Relay {
    gpio: u8,
    on: bool,
}

#[cfg(not(feature = "hardware"))]
impl Relay {
    pub fn new(gpio: u8, _active_low: bool) -> Result<Self, DriverError> {
        tracing::info!(gpio, "[sim] relay registered (not wired)");
        Ok(Self { gpio, on: false })
    }

    pub fn set(&mut self, on: bool) {
        if on != self.on {
            tracing::info!(gpio = self.gpio, "[sim] relay {}", if on { "ON" } else { "OFF" });
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

/// A pump is a relay that is only ever switched on for a bounded time.
pub struct Pump {
    relay: Relay,
}

impl Pump {
    pub fn new(gpio: u8, active_low: bool) -> Result<Self, DriverError> {
        Ok(Self {
            relay: Relay::new(gpio, active_low)?,
        })
    }

    /// Run the pump for `duration`, blocking the calling thread.
    pub fn actuate(&mut self, duration: Duration) -> Result<(), DriverError> {
        tracing::info!(secs = duration.as_secs_f64(), "pump on");
        self.relay.set(true);
        thread::sleep(duration);
        self.relay.set(false);
        tracing::info!("pump off");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.relay.set(false);
    }
}

#[cfg(all(test, not(feature = "hardware")))]
mod tests {
    use super::*;

    #[test]
    fn relay_starts_off() {
        let r = Relay::new(16, true).unwrap();
        assert!(!r.is_on());
    }

    #[test]
    fn relay_set_on_then_off() {
        let mut r = Relay::new(16, true).unwrap();
        r.set(true);
        assert!(r.is_on());
        r.set(false);
        assert!(!r.is_on());
    }

    #[test]
    fn pump_is_off_after_actuation() {
        let mut p = Pump::new(20, false).unwrap();
        let started = std::time::Instant::now();
        p.actuate(Duration::from_millis(30)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!p.relay.is_on());
    }
}
