//! HC-SR04 style ultrasonic ranging: trigger a 10 µs pulse, time the echo,
//! and report the median of several samples in centimetres.

use std::time::Duration;

#[cfg(feature = "hardware")]
use rppal::gpio::{Gpio, InputPin, OutputPin};
#[cfg(feature = "hardware")]
use std::{thread, time::Instant};

#[cfg(feature = "hardware")]
use crate::DriverError;

/// Speed of sound at ~20 °C in cm/s.
const SPEED_OF_SOUND_CM_S: f64 = 34_300.0;

/// Give up on an echo edge after this long.
#[cfg(feature = "hardware")]
const ECHO_TIMEOUT: Duration = Duration::from_secs(1);

/// Gap between consecutive samples so echoes do not overlap.
#[cfg(feature = "hardware")]
const SAMPLE_GAP: Duration = Duration::from_millis(50);

/// Sensor settle time after the trigger line is pulled low at startup.
#[cfg(feature = "hardware")]
const SETTLE: Duration = Duration::from_secs(2);

/// Convert a round-trip echo time to a one-way distance in cm.
pub fn echo_to_cm(round_trip: Duration) -> f64 {
    round_trip.as_secs_f64() * SPEED_OF_SOUND_CM_S / 2.0
}

/// Upper median of the successful samples; `None` when every sample failed.
pub fn median(mut samples: Vec<f64>) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    Some(samples[samples.len() / 2])
}

// ---------------------------------------------------------------------------
// Real sensor (Raspberry Pi GPIO)
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
pub struct DistanceSensor {
    trig: OutputPin,
    echo: InputPin,
    samples: usize,
}

#[cfg(feature = "hardware")]
impl DistanceSensor {
    pub fn new(trig_pin: u8, echo_pin: u8, samples: usize) -> Result<Self, DriverError> {
        let gpio = Gpio::new()?;
        let mut trig = gpio.get(trig_pin)?.into_output();
        let echo = gpio.get(echo_pin)?.into_input();

        trig.set_low();
        thread::sleep(SETTLE);

        tracing::info!(trig_pin, echo_pin, "ultrasonic sensor initialised");
        Ok(Self {
            trig,
            echo,
            samples: samples.max(1),
        })
    }

    fn single(&mut self) -> Result<f64, DriverError> {
        self.trig.set_high();
        thread::sleep(Duration::from_micros(10));
        self.trig.set_low();

        let wait_from = Instant::now();
        while self.echo.is_low() {
            if wait_from.elapsed() > ECHO_TIMEOUT {
                return Err(DriverError::Timeout("echo start"));
            }
        }

        let pulse_start = Instant::now();
        while self.echo.is_high() {
            if pulse_start.elapsed() > ECHO_TIMEOUT {
                return Err(DriverError::Timeout("echo end"));
            }
        }

        Ok(echo_to_cm(pulse_start.elapsed()))
    }

    /// Median of `samples` echo measurements. Failed samples are skipped.
    pub fn read_median(&mut self) -> Result<Option<f64>, DriverError> {
        let mut ok = Vec::with_capacity(self.samples);
        for i in 0..self.samples {
            match self.single() {
                Ok(cm) => ok.push(cm),
                Err(e) => tracing::debug!(sample = i + 1, "distance sample failed: {e}"),
            }
            thread::sleep(SAMPLE_GAP);
        }
        Ok(median(ok))
    }
}

// ---------------------------------------------------------------------------
// Simulated sensor
// ---------------------------------------------------------------------------

#[cfg(not(feature = "hardware"))]
pub struct DistanceSensor {
    samples: usize,
}

#[cfg(not(feature = "hardware"))]
impl DistanceSensor {
    pub fn new(trig_pin: u8, echo_pin: u8, samples: usize) -> Result<Self, crate::DriverError> {
        tracing::info!(trig_pin, echo_pin, "[sim] ultrasonic sensor registered");
        Ok(Self {
            samples: samples.max(1),
        })
    }

    pub fn read_median(&mut self) -> Result<Option<f64>, crate::DriverError> {
        // Water surface ~25 cm below the sensor, ripple noise per echo.
        let samples = (0..self.samples)
            .map(|_| {
                let echo = crate::sim::bounded(0.00146, 0.00002, 0.0001, 0.02);
                echo_to_cm(Duration::from_secs_f64(echo))
            })
            .collect();
        Ok(median(samples))
    }
}
