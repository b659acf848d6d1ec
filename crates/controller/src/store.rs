//! The primary store as the rest of the controller sees it.
//!
//! [`crate::db::Db`] is the production implementation; tests use the
//! in-memory [`memory::MemoryStore`] with a switchable outage.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::schedule::{Schedule, Target};

/// One measurement. Append-only once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: i64,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub reading_time: OffsetDateTime,
}

impl Reading {
    pub fn now(sensor_id: i64, value: f64) -> Self {
        Self {
            sensor_id,
            value,
            reading_time: OffsetDateTime::now_utc(),
        }
    }
}

/// A declared measurement cycle: read every `interval_seconds` for
/// `duration_minutes`, then rest for `pause_seconds`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CycleDef {
    pub cycle_id: i64,
    pub sensor_id: i64,
    pub cycle_number: i64,
    pub interval_seconds: i64,
    pub duration_minutes: i64,
    pub pause_seconds: i64,
}

impl CycleDef {
    pub fn is_valid(&self) -> bool {
        self.interval_seconds > 0 && self.duration_minutes > 0 && self.pause_seconds >= 0
    }
}

/// An active sensor row. `config` is the raw JSON column; its `map` key
/// names the driver.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SensorRow {
    pub id: i64,
    pub sensor_name: String,
    pub config: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Relay,
    Feeder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Follow the stored `relay_status` flag.
    Manual,
    /// Follow the device's schedules.
    Schedule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_id: i64,
    pub device_name: String,
    pub kind: DeviceKind,
    pub gpio: u8,
    pub control_mode: ControlMode,
    pub relay_status: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_reading(&self, reading: &Reading) -> Result<()>;

    /// Active cycles of a sensor, ordered by cycle id.
    async fn active_cycles(&self, sensor_id: i64) -> Result<Vec<CycleDef>>;

    /// Flip every inactive cycle of the sensor to active. Returns how many
    /// changed.
    async fn activate_dormant_cycles(&self, sensor_id: i64) -> Result<u64>;

    async fn deactivate_cycle(&self, cycle_id: i64) -> Result<()>;

    async fn active_sensors(&self) -> Result<Vec<SensorRow>>;

    async fn schedules_for(&self, target: Target) -> Result<Vec<Schedule>>;

    async fn active_devices(&self) -> Result<Vec<Device>>;
}

#[cfg(test)]
pub mod memory {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::bail;

    use super::*;

    #[derive(Default)]
    struct State {
        readings: Vec<Reading>,
        cycles: Vec<(CycleDef, bool)>,
        sensors: Vec<SensorRow>,
        schedules: Vec<Schedule>,
        devices: Vec<Device>,
    }

    /// Store double. While `down` is set every call fails.
    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<State>,
        down: AtomicBool,
        insert_calls: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                bail!("store unavailable");
            }
            Ok(())
        }

        pub fn add_sensor(&self, id: i64, map: &str) {
            self.state.lock().unwrap().sensors.push(SensorRow {
                id,
                sensor_name: format!("sensor-{id}"),
                config: format!(r#"{{"map":"{map}"}}"#),
            });
        }

        pub fn add_raw_sensor(&self, row: SensorRow) {
            self.state.lock().unwrap().sensors.push(row);
        }

        pub fn add_cycle(&self, def: CycleDef, active: bool) {
            self.state.lock().unwrap().cycles.push((def, active));
        }

        pub fn set_cycle_active(&self, cycle_id: i64, active: bool) {
            let mut st = self.state.lock().unwrap();
            for (c, a) in st.cycles.iter_mut() {
                if c.cycle_id == cycle_id {
                    *a = active;
                }
            }
        }

        pub fn cycle_active(&self, cycle_id: i64) -> bool {
            self.state
                .lock()
                .unwrap()
                .cycles
                .iter()
                .any(|(c, a)| c.cycle_id == cycle_id && *a)
        }

        pub fn add_schedule(&self, s: Schedule) {
            self.state.lock().unwrap().schedules.push(s);
        }

        pub fn add_device(&self, d: Device) {
            self.state.lock().unwrap().devices.push(d);
        }

        pub fn remove_device(&self, device_id: i64) {
            self.state.lock().unwrap().devices.retain(|d| d.device_id != device_id);
        }

        pub fn set_device_gpio(&self, device_id: i64, gpio: u8) {
            let mut st = self.state.lock().unwrap();
            for d in st.devices.iter_mut().filter(|d| d.device_id == device_id) {
                d.gpio = gpio;
            }
        }

        pub fn set_relay_status(&self, device_id: i64, on: bool) {
            let mut st = self.state.lock().unwrap();
            for d in st.devices.iter_mut().filter(|d| d.device_id == device_id) {
                d.relay_status = on;
            }
        }

        pub fn readings(&self) -> Vec<Reading> {
            self.state.lock().unwrap().readings.clone()
        }

        pub fn insert_calls(&self) -> usize {
            self.insert_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn insert_reading(&self, reading: &Reading) -> Result<()> {
            self.insert_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.state.lock().unwrap().readings.push(reading.clone());
            Ok(())
        }

        async fn active_cycles(&self, sensor_id: i64) -> Result<Vec<CycleDef>> {
            self.check()?;
            let mut out: Vec<CycleDef> = self
                .state
                .lock()
                .unwrap()
                .cycles
                .iter()
                .filter(|(c, a)| *a && c.sensor_id == sensor_id)
                .map(|(c, _)| c.clone())
                .collect();
            out.sort_by_key(|c| c.cycle_id);
            Ok(out)
        }

        async fn activate_dormant_cycles(&self, sensor_id: i64) -> Result<u64> {
            self.check()?;
            let mut n = 0;
            for (c, a) in self.state.lock().unwrap().cycles.iter_mut() {
                if c.sensor_id == sensor_id && !*a {
                    *a = true;
                    n += 1;
                }
            }
            Ok(n)
        }

        async fn deactivate_cycle(&self, cycle_id: i64) -> Result<()> {
            self.check()?;
            self.set_cycle_active(cycle_id, false);
            Ok(())
        }

        async fn active_sensors(&self) -> Result<Vec<SensorRow>> {
            self.check()?;
            Ok(self.state.lock().unwrap().sensors.clone())
        }

        async fn schedules_for(&self, target: Target) -> Result<Vec<Schedule>> {
            self.check()?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .schedules
                .iter()
                .filter(|s| s.target == target)
                .cloned()
                .collect())
        }

        async fn active_devices(&self) -> Result<Vec<Device>> {
            self.check()?;
            Ok(self.state.lock().unwrap().devices.clone())
        }
    }
}
