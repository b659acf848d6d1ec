use thiserror::Error;

/// Failure of a single driver operation.
///
/// Every variant is recoverable from the caller's point of view: a cycle
/// logs it and moves on to the next interval.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The device is still busy with a previous request (camera uploads).
    #[error("device busy")]
    Busy,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("malformed reading: {0}")]
    Malformed(String),

    #[error("{op} is not supported by a {kind} driver")]
    Unsupported { op: &'static str, kind: &'static str },

    #[error("driver lock poisoned")]
    Poisoned,

    #[error("upload failed: {0}")]
    Upload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "hardware")]
    #[error("gpio: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[cfg(feature = "hardware")]
    #[error("i2c: {0}")]
    I2c(#[from] rppal::i2c::Error),

    #[cfg(feature = "hardware")]
    #[error("spi: {0}")]
    Spi(#[from] rppal::spi::Error),
}

impl DriverError {
    /// True for conditions that are part of normal operation and should
    /// be logged quietly.
    pub fn is_routine(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_routine() {
        assert!(DriverError::Busy.is_routine());
        assert!(!DriverError::Timeout("echo").is_routine());
    }

    #[test]
    fn display_includes_context() {
        let e = DriverError::Unsupported {
            op: "actuate",
            kind: "light",
        };
        assert_eq!(e.to_string(), "actuate is not supported by a light driver");
    }
}
