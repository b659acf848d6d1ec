//! DHT22 ambient temperature / humidity through the kernel `dht11` IIO
//! driver (`dtoverlay=dht11,gpiopin=17`), which handles the bit-banged
//! protocol and exposes milli-unit values under sysfs.

use std::path::{Path, PathBuf};

use crate::DriverError;

const TEMPERATURE_FILE: &str = "in_temp_input";
const HUMIDITY_FILE: &str = "in_humidityrelative_input";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Temperature,
    Humidity,
}

impl Quantity {
    fn file(self) -> &'static str {
        match self {
            Self::Temperature => TEMPERATURE_FILE,
            Self::Humidity => HUMIDITY_FILE,
        }
    }
}

/// IIO values are integers in thousandths of the unit.
pub fn parse_milli(raw: &str) -> Result<f64, DriverError> {
    let milli: i64 = raw
        .trim()
        .parse()
        .map_err(|_| DriverError::Malformed(format!("bad iio value {raw:?}")))?;
    Ok(milli as f64 / 1000.0)
}

enum Backend {
    Iio(PathBuf),
    #[cfg(not(feature = "hardware"))]
    Simulated,
}

pub struct Dht22 {
    backend: Backend,
}

impl Dht22 {
    #[cfg(feature = "hardware")]
    pub fn new(iio_dir: &Path) -> Result<Self, DriverError> {
        Self::iio(iio_dir)
    }

    #[cfg(not(feature = "hardware"))]
    pub fn new(iio_dir: &Path) -> Result<Self, DriverError> {
        tracing::info!(dir = %iio_dir.display(), "[sim] dht22 registered");
        Ok(Self {
            backend: Backend::Simulated,
        })
    }

    /// Read from an IIO device directory such as
    /// `/sys/bus/iio/devices/iio:device0`.
    pub fn iio(iio_dir: &Path) -> Result<Self, DriverError> {
        if !iio_dir.join(TEMPERATURE_FILE).exists() {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no dht iio device at {}", iio_dir.display()),
            )));
        }
        tracing::info!(dir = %iio_dir.display(), "dht22 initialised");
        Ok(Self {
            backend: Backend::Iio(iio_dir.to_path_buf()),
        })
    }

    /// The kernel driver fails individual reads with EIO on checksum
    /// errors; those surface as `Io` and the next interval tries again.
    pub fn read(&mut self, quantity: Quantity) -> Result<Option<f64>, DriverError> {
        match &self.backend {
            Backend::Iio(dir) => {
                let raw = std::fs::read_to_string(dir.join(quantity.file()))?;
                parse_milli(&raw).map(Some)
            }
            #[cfg(not(feature = "hardware"))]
            Backend::Simulated => Ok(Some(match quantity {
                Quantity::Temperature => crate::sim::bounded(27.0, 0.3, -40.0, 80.0),
                Quantity::Humidity => crate::sim::bounded(65.0, 2.0, 0.0, 100.0),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_milli_units() {
        assert_eq!(parse_milli("23400\n").unwrap(), 23.4);
        assert_eq!(parse_milli("-500").unwrap(), -0.5);
        assert!(parse_milli("n/a").is_err());
    }

    #[test]
    fn iio_device_reads_both_quantities() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TEMPERATURE_FILE), "26100\n").unwrap();
        std::fs::write(dir.path().join(HUMIDITY_FILE), "71500\n").unwrap();

        let mut dht = Dht22::iio(dir.path()).unwrap();
        assert_eq!(dht.read(Quantity::Temperature).unwrap(), Some(26.1));
        assert_eq!(dht.read(Quantity::Humidity).unwrap(), Some(71.5));
    }

    #[test]
    fn missing_device_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Dht22::iio(dir.path()).is_err());
    }
}
