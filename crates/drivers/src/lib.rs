//! Hardware shims for the aquaponics rig.
//!
//! Every sensor "map" name resolves to a [`SensorKind`]; [`SensorDriver`]
//! opens the matching device once and exposes a single blocking
//! [`SensorDriver::sample`] call. Building with the `hardware` feature talks
//! to real Raspberry Pi peripherals through rppal; without it each device
//! is simulated.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod analog;
pub mod camera;
pub mod dht;
pub mod distance;
mod error;
pub mod feeder;
pub mod gpio;
pub mod light;
#[cfg(not(feature = "hardware"))]
mod sim;
pub mod thermo;

pub use error::DriverError;

use analog::AnalogFrontEnd;
use camera::Camera;
use dht::{Dht22, Quantity};
use distance::DistanceSensor;
use gpio::Pump;
use light::LightSensor;
use thermo::{TankSlot, TankThermometers};

// ---------------------------------------------------------------------------
// Sensor kinds
// ---------------------------------------------------------------------------

/// Closed set of sensor types, keyed by the `map` value stored in each
/// sensor's JSON config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    #[serde(rename = "ultrasonic", alias = "distance")]
    Distance,
    #[serde(rename = "ph")]
    Ph,
    #[serde(rename = "ph_temp")]
    PhTemperature,
    #[serde(rename = "tank1")]
    Tank1,
    #[serde(rename = "tank2")]
    Tank2,
    #[serde(rename = "light")]
    Light,
    #[serde(rename = "env_temp")]
    EnvTemperature,
    #[serde(rename = "humidity")]
    Humidity,
    #[serde(rename = "camera")]
    Camera,
    #[serde(rename = "pump_tank")]
    PumpTank,
    #[serde(rename = "pump_2")]
    Pump2,
}

impl SensorKind {
    pub const ALL: [SensorKind; 11] = [
        Self::Distance,
        Self::Ph,
        Self::PhTemperature,
        Self::Tank1,
        Self::Tank2,
        Self::Light,
        Self::EnvTemperature,
        Self::Humidity,
        Self::Camera,
        Self::PumpTank,
        Self::Pump2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Distance => "ultrasonic",
            Self::Ph => "ph",
            Self::PhTemperature => "ph_temp",
            Self::Tank1 => "tank1",
            Self::Tank2 => "tank2",
            Self::Light => "light",
            Self::EnvTemperature => "env_temp",
            Self::Humidity => "humidity",
            Self::Camera => "camera",
            Self::PumpTank => "pump_tank",
            Self::Pump2 => "pump_2",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sensor map '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for SensorKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("distance") {
            return Ok(Self::Distance);
        }
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Pin map, bus numbers and device paths for the rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub ultrasonic_trig_pin: u8,
    pub ultrasonic_echo_pin: u8,
    pub ultrasonic_samples: usize,

    pub spi_bus: u8,
    pub spi_device: u8,
    pub spi_clock_hz: u32,
    pub ph_channel: u8,
    pub ph_temperature_channel: u8,

    pub one_wire_dir: PathBuf,
    pub tank1_probe: String,
    pub tank2_probe: String,
    pub tank_sample_period_secs: u64,

    pub i2c_bus: u8,
    pub light_address: u16,

    pub dht_iio_dir: PathBuf,

    pub camera_command: Vec<String>,
    pub camera_upload_url: String,

    pub pump_tank_pin: u8,
    pub pump_2_pin: u8,
    pub relay_active_low: bool,

    pub feeder_open_secs: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            ultrasonic_trig_pin: 18,
            ultrasonic_echo_pin: 15,
            ultrasonic_samples: 5,
            spi_bus: 0,
            spi_device: 0,
            spi_clock_hz: 1_350_000,
            ph_channel: 0,
            ph_temperature_channel: 1,
            one_wire_dir: PathBuf::from("/sys/bus/w1/devices"),
            tank1_probe: "28-000000856211".into(),
            tank2_probe: "28-00000085aff4".into(),
            tank_sample_period_secs: 1,
            i2c_bus: 1,
            light_address: 0x23,
            dht_iio_dir: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
            camera_command: ["fswebcam", "-q", "--no-banner", "-r", "1280x720", "--jpeg", "85", "-"]
                .into_iter()
                .map(String::from)
                .collect(),
            camera_upload_url: "https://lettuce.ebasura.online/api/detect".into(),
            pump_tank_pin: 16,
            pump_2_pin: 20,
            relay_active_low: false,
            feeder_open_secs: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver dispatch
// ---------------------------------------------------------------------------

/// One opened device, selected by [`SensorKind`] when a sensor comes up.
pub enum SensorDriver {
    Distance(DistanceSensor),
    Ph(AnalogFrontEnd),
    PhTemperature(AnalogFrontEnd),
    Tank {
        monitor: TankThermometers,
        slot: TankSlot,
    },
    Light(LightSensor),
    Dht {
        sensor: Dht22,
        quantity: Quantity,
    },
    Camera(Camera),
    Pump(Pump),
}

impl SensorDriver {
    /// Open the device behind `kind`. Blocking: some devices need a settle
    /// period before the first read.
    pub fn open(kind: SensorKind, hw: &HardwareConfig) -> Result<Self, DriverError> {
        let analog = || {
            AnalogFrontEnd::new(
                hw.spi_bus,
                hw.spi_device,
                hw.spi_clock_hz,
                hw.ph_channel,
                hw.ph_temperature_channel,
            )
        };
        let tanks = || {
            TankThermometers::new(
                &hw.one_wire_dir,
                &hw.tank1_probe,
                &hw.tank2_probe,
                Duration::from_secs(hw.tank_sample_period_secs.max(1)),
            )
        };

        let driver = match kind {
            SensorKind::Distance => Self::Distance(DistanceSensor::new(
                hw.ultrasonic_trig_pin,
                hw.ultrasonic_echo_pin,
                hw.ultrasonic_samples,
            )?),
            SensorKind::Ph => Self::Ph(analog()?),
            SensorKind::PhTemperature => Self::PhTemperature(analog()?),
            SensorKind::Tank1 => Self::Tank {
                monitor: tanks()?,
                slot: TankSlot::Tank1,
            },
            SensorKind::Tank2 => Self::Tank {
                monitor: tanks()?,
                slot: TankSlot::Tank2,
            },
            SensorKind::Light => {
                let mut light = LightSensor::new(hw.i2c_bus, hw.light_address)?;
                light.power_on()?;
                Self::Light(light)
            }
            SensorKind::EnvTemperature => Self::Dht {
                sensor: Dht22::new(&hw.dht_iio_dir)?,
                quantity: Quantity::Temperature,
            },
            SensorKind::Humidity => Self::Dht {
                sensor: Dht22::new(&hw.dht_iio_dir)?,
                quantity: Quantity::Humidity,
            },
            SensorKind::Camera => Self::Camera(Camera::new(
                hw.camera_command.clone(),
                hw.camera_upload_url.clone(),
            )?),
            SensorKind::PumpTank => Self::Pump(Pump::new(hw.pump_tank_pin, hw.relay_active_low)?),
            SensorKind::Pump2 => Self::Pump(Pump::new(hw.pump_2_pin, hw.relay_active_low)?),
        };
        Ok(driver)
    }

    /// Perform the cycle action once. Measurement kinds return the value
    /// (or `None` when the device produced nothing this time); actuator
    /// kinds return `None` after acting. Pumps run for `interval`.
    pub fn sample(&mut self, interval: Duration) -> Result<Option<f64>, DriverError> {
        match self {
            Self::Distance(s) => s.read_median(),
            Self::Ph(adc) => adc.read_ph(),
            Self::PhTemperature(adc) => adc.read_temperature(),
            Self::Tank { monitor, slot } => monitor.read(*slot),
            Self::Light(s) => s.read_lux(),
            Self::Dht { sensor, quantity } => sensor.read(*quantity),
            Self::Camera(cam) => cam.capture_and_upload().map(|()| None),
            Self::Pump(pump) => pump.actuate(interval).map(|()| None),
        }
    }

    /// Put the device into its idle state before it is dropped.
    pub fn power_down(&mut self) -> Result<(), DriverError> {
        match self {
            Self::Light(s) => s.power_down(),
            Self::Tank { monitor, .. } => {
                monitor.shutdown();
                Ok(())
            }
            Self::Pump(pump) => {
                pump.stop();
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
