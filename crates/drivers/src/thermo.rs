//! DS18B20 tank thermometers on the 1-Wire bus.
//!
//! Two probes (tank 1, tank 2) are read by a free-running background
//! sampler thread; callers only ever see the latest value for a slot. The
//! sampler stops when the monitor is shut down or dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::DriverError;

/// Attempts to get a CRC-valid frame out of `w1_slave` before giving up on
/// this sampling pass.
const CRC_RETRIES: usize = 5;
const CRC_RETRY_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TankSlot {
    Tank1,
    Tank2,
}

impl TankSlot {
    fn index(self) -> usize {
        match self {
            Self::Tank1 => 0,
            Self::Tank2 => 1,
        }
    }
}

/// Parse the kernel's `w1_slave` text:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
///
/// Returns `Ok(None)` when the CRC line does not end in `YES` (conversion
/// still in progress).
pub fn parse_w1_slave(contents: &str) -> Result<Option<f64>, DriverError> {
    let mut lines = contents.lines();
    let crc = lines
        .next()
        .ok_or_else(|| DriverError::Malformed("empty w1_slave".into()))?;
    if !crc.trim_end().ends_with("YES") {
        return Ok(None);
    }

    let data = lines
        .next()
        .ok_or_else(|| DriverError::Malformed("w1_slave missing data line".into()))?;
    let pos = data
        .find("t=")
        .ok_or_else(|| DriverError::Malformed(format!("no t= in {data:?}")))?;
    let milli: i64 = data[pos + 2..]
        .trim()
        .parse()
        .map_err(|_| DriverError::Malformed(format!("bad temperature in {data:?}")))?;
    Ok(Some(milli as f64 / 1000.0))
}

fn read_probe(device_dir: &Path) -> Result<Option<f64>, DriverError> {
    let file = device_dir.join("w1_slave");
    for _ in 0..CRC_RETRIES {
        let contents = std::fs::read_to_string(&file)?;
        if let Some(c) = parse_w1_slave(&contents)? {
            return Ok(Some(c));
        }
        thread::sleep(CRC_RETRY_WAIT);
    }
    Ok(None)
}

enum Source {
    OneWire { probes: [PathBuf; 2] },
    #[cfg(not(feature = "hardware"))]
    Simulated,
}

impl Source {
    fn sample(&self, slot: TankSlot) -> Option<f64> {
        match self {
            Self::OneWire { probes } => {
                let dir = &probes[slot.index()];
                match read_probe(dir) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(probe = %dir.display(), "1-wire read failed: {e}");
                        None
                    }
                }
            }
            #[cfg(not(feature = "hardware"))]
            Self::Simulated => {
                let mean = match slot {
                    TankSlot::Tank1 => 24.5,
                    TankSlot::Tank2 => 23.0,
                };
                Some(crate::sim::bounded(mean, 0.1, 0.0, 40.0))
            }
        }
    }

    fn sample_all(&self) -> [Option<f64>; 2] {
        [self.sample(TankSlot::Tank1), self.sample(TankSlot::Tank2)]
    }
}

pub struct TankThermometers {
    latest: Arc<Mutex<[Option<f64>; 2]>>,
    stop: Arc<AtomicBool>,
    sampler: Option<JoinHandle<()>>,
}

impl TankThermometers {
    /// Build the monitor for the current target: real 1-Wire probes with the
    /// `hardware` feature, simulated water temperatures otherwise.
    #[cfg(feature = "hardware")]
    pub fn new(
        one_wire_dir: &Path,
        tank1_id: &str,
        tank2_id: &str,
        period: Duration,
    ) -> Result<Self, DriverError> {
        Self::one_wire(one_wire_dir, tank1_id, tank2_id, period)
    }

    #[cfg(not(feature = "hardware"))]
    pub fn new(
        _one_wire_dir: &Path,
        _tank1_id: &str,
        _tank2_id: &str,
        period: Duration,
    ) -> Result<Self, DriverError> {
        tracing::info!("[sim] tank thermometers registered");
        Ok(Self::start(Source::Simulated, period))
    }

    /// Sample DS18B20 probes found under `one_wire_dir` (normally
    /// `/sys/bus/w1/devices`).
    pub fn one_wire(
        one_wire_dir: &Path,
        tank1_id: &str,
        tank2_id: &str,
        period: Duration,
    ) -> Result<Self, DriverError> {
        if !one_wire_dir.is_dir() {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("1-wire bus not found at {}", one_wire_dir.display()),
            )));
        }
        for id in [tank1_id, tank2_id] {
            if !one_wire_dir.join(id).is_dir() {
                tracing::warn!(probe = id, "tank probe not present on the 1-wire bus");
            }
        }
        let probes = [one_wire_dir.join(tank1_id), one_wire_dir.join(tank2_id)];
        tracing::info!(tank1 = tank1_id, tank2 = tank2_id, "tank thermometers initialised");
        Ok(Self::start(Source::OneWire { probes }, period))
    }

    fn start(source: Source, period: Duration) -> Self {
        // First pass runs inline so a read straight after startup has data.
        let latest = Arc::new(Mutex::new(source.sample_all()));
        let stop = Arc::new(AtomicBool::new(false));

        let sampler = {
            let latest = Arc::clone(&latest);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("tank-thermometers".into())
                .spawn(move || {
                    loop {
                        thread::park_timeout(period);
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let fresh = source.sample_all();
                        if let Ok(mut slots) = latest.lock() {
                            *slots = fresh;
                        }
                    }
                })
        };

        let sampler = match sampler {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::error!("failed to spawn tank sampler, values will not refresh: {e}");
                None
            }
        };

        Self {
            latest,
            stop,
            sampler,
        }
    }

    /// Latest sampled value for `slot`, `None` if the last pass failed.
    pub fn read(&self, slot: TankSlot) -> Result<Option<f64>, DriverError> {
        let slots = self.latest.lock().map_err(|_| DriverError::Poisoned)?;
        Ok(slots[slot.index()])
    }

    /// Stop the sampler thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.sampler.take() {
            h.thread().unpark();
            let _ = h.join();
        }
    }
}

impl Drop for TankThermometers {
    fn drop(&mut self) {
        self.shutdown();
    }
}
