//! TOML config file loading, validation, and database seeding for sensors,
//! cycles, devices and schedules.

use anyhow::{bail, Context, Result};
use aquaponics_drivers::{HardwareConfig, SensorKind};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use time::UtcOffset;

use crate::db::{Db, DeviceSeed, SensorSeed};
use crate::logging::LoggingConfig;
use crate::retry::RetryPolicy;
use crate::schedule::{self, Recurrence, Schedule, Target};
use crate::store::{ControlMode, CycleDef, DeviceKind};
use crate::supervisor::SupervisorSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    /// Retry policy for reading inserts.
    pub store: RetryPolicy,
    pub queue: QueueConfig,
    pub fallback: FallbackConfig,
    pub supervisor: SupervisorConfig,
    pub fleet: FleetConfig,
    pub device_monitor: DeviceMonitorConfig,
    pub schedule: ScheduleConfig,
    pub hardware: HardwareConfig,
    pub logging: LoggingConfig,

    pub sensors: Vec<SensorEntry>,
    pub cycles: Vec<CycleEntry>,
    pub devices: Vec<DeviceEntry>,
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_retry: RetryPolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:aquaponics.db?mode=rwc".to_string(),
            max_connections: 5,
            connect_retry: RetryPolicy {
                attempts: 5,
                first_delay_ms: 500,
                max_delay_ms: 10_000,
                factor: 2.0,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub path: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sensor_data_queue.json"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub path: PathBuf,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sensors.json"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            stop_grace_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub join_timeout_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            join_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceMonitorConfig {
    pub poll_interval_secs: u64,
}

impl Default for DeviceMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Offset of the local clock schedule windows are written in.
    pub utc_offset_hours: i8,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub id: i64,
    pub name: String,
    /// Driver name, e.g. `tank1` or `ultrasonic`.
    pub map: String,
    #[serde(default = "yes")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct CycleEntry {
    pub cycle_id: i64,
    pub sensor_id: i64,
    pub cycle_number: i64,
    pub interval_seconds: i64,
    pub duration_minutes: i64,
    #[serde(default)]
    pub pause_seconds: i64,
    /// Only used when the cycle is first inserted.
    #[serde(default = "yes")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: i64,
    pub name: String,
    pub kind: DeviceKind,
    pub gpio: i64,
    #[serde(default = "manual")]
    pub control_mode: ControlMode,
    #[serde(default = "yes")]
    pub active: bool,
}

fn manual() -> ControlMode {
    ControlMode::Manual
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEntry {
    pub id: i64,
    /// `sensor` or `device`.
    pub target: String,
    pub target_id: i64,
    #[serde(default)]
    pub recurrence: String,
    /// `YYYY-MM-DD HH:MM:SS`, local time.
    pub starts_at: String,
    pub ends_at: String,
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            poll_interval: Duration::from_secs(self.supervisor.poll_interval_secs),
            stop_grace: Duration::from_secs(self.supervisor.stop_grace_secs),
        }
    }

    pub fn fleet_join_timeout(&self) -> Duration {
        Duration::from_secs(self.fleet.join_timeout_secs)
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_secs(self.device_monitor.poll_interval_secs)
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_hms(self.schedule.utc_offset_hours, 0, 0)
            .with_context(|| format!("utc_offset_hours {} out of range", self.schedule.utc_offset_hours))
    }

    pub fn feeder_hold(&self) -> Duration {
        Duration::from_secs(self.hardware.feeder_open_secs)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_settings(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_cycles(&mut errors);
        self.validate_devices(&mut errors);
        self.validate_schedules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_settings(&self, errors: &mut Vec<String>) {
        if self.database.url.trim().is_empty() {
            errors.push("database.url is empty".into());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".into());
        }
        for (name, policy) in [
            ("database.connect_retry", &self.database.connect_retry),
            ("store", &self.store),
        ] {
            if policy.attempts == 0 {
                errors.push(format!("{name}.attempts must be at least 1"));
            }
            if !(policy.factor.is_finite() && policy.factor >= 1.0) {
                errors.push(format!("{name}.factor must be >= 1.0, got {}", policy.factor));
            }
        }
        if self.queue.path.as_os_str().is_empty() {
            errors.push("queue.path is empty".into());
        }
        if self.fallback.path.as_os_str().is_empty() {
            errors.push("fallback.path is empty".into());
        }

        // ── Timing ──────────────────────────────────────────
        for (name, secs) in [
            ("supervisor.poll_interval_secs", self.supervisor.poll_interval_secs),
            ("device_monitor.poll_interval_secs", self.device_monitor.poll_interval_secs),
            ("fleet.join_timeout_secs", self.fleet.join_timeout_secs),
        ] {
            if secs == 0 {
                errors.push(format!("{name} must be positive"));
            }
        }
        if !(-12..=14).contains(&self.schedule.utc_offset_hours) {
            errors.push(format!(
                "schedule.utc_offset_hours {} out of range [-12, 14]",
                self.schedule.utc_offset_hours
            ));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || format!("sensors[{i}] (id {})", s.id);

            if s.id <= 0 {
                errors.push(format!("{}: id must be positive", ctx()));
            } else if !seen_ids.insert(s.id) {
                errors.push(format!("{}: duplicate sensor id", ctx()));
            }
            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if let Err(e) = s.map.parse::<SensorKind>() {
                errors.push(format!("{}: {e}", ctx()));
            }
        }
    }

    fn validate_cycles(&self, errors: &mut Vec<String>) {
        let sensor_ids: HashSet<i64> = self.sensors.iter().map(|s| s.id).collect();
        let mut seen_ids: HashSet<i64> = HashSet::new();
        let mut seen_numbers: HashSet<(i64, i64)> = HashSet::new();

        for (i, c) in self.cycles.iter().enumerate() {
            let ctx = || format!("cycles[{i}] (cycle_id {})", c.cycle_id);

            if !seen_ids.insert(c.cycle_id) {
                errors.push(format!("{}: duplicate cycle_id", ctx()));
            }
            if !sensor_ids.contains(&c.sensor_id) {
                errors.push(format!("{}: references unknown sensor {}", ctx(), c.sensor_id));
            }
            if !seen_numbers.insert((c.sensor_id, c.cycle_number)) {
                errors.push(format!(
                    "{}: cycle_number {} already used for sensor {}",
                    ctx(),
                    c.cycle_number,
                    c.sensor_id
                ));
            }
            if c.interval_seconds <= 0 {
                errors.push(format!("{}: interval_seconds must be positive, got {}", ctx(), c.interval_seconds));
            }
            if c.duration_minutes <= 0 {
                errors.push(format!("{}: duration_minutes must be positive, got {}", ctx(), c.duration_minutes));
            }
            if c.pause_seconds < 0 {
                errors.push(format!("{}: pause_seconds must not be negative, got {}", ctx(), c.pause_seconds));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<i64> = HashSet::new();
        let hw = &self.hardware;
        let mut seen_pins: HashSet<i64> = [
            hw.ultrasonic_trig_pin,
            hw.ultrasonic_echo_pin,
            hw.pump_tank_pin,
            hw.pump_2_pin,
        ]
        .into_iter()
        .map(i64::from)
        .collect();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || format!("devices[{i}] (device_id {})", d.device_id);

            if !seen_ids.insert(d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }
            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&d.gpio) {
                errors.push(format!(
                    "{}: gpio {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    d.gpio
                ));
            } else if !seen_pins.insert(d.gpio) {
                errors.push(format!("{}: gpio {} is already in use", ctx(), d.gpio));
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = || format!("schedules[{i}] (id {})", s.id);

            if !seen_ids.insert(s.id) {
                errors.push(format!("{}: duplicate schedule id", ctx()));
            }
            match s.to_schedule() {
                Ok(parsed) => {
                    let known = match parsed.target {
                        Target::Sensor(id) => self.sensors.iter().any(|x| x.id == id),
                        Target::Device(id) => self.devices.iter().any(|x| x.device_id == id),
                    };
                    if !known {
                        errors.push(format!("{}: references unknown {}", ctx(), parsed.target));
                    }
                    if parsed.recurrence == Recurrence::None && parsed.ends_at <= parsed.starts_at {
                        errors.push(format!("{}: ends_at must be after starts_at", ctx()));
                    }
                }
                Err(e) => errors.push(format!("{}: {e:#}", ctx())),
            }
        }
    }
}

impl ScheduleEntry {
    fn to_schedule(&self) -> Result<Schedule> {
        Ok(Schedule {
            id: self.id,
            target: Target::from_parts(&self.target, self.target_id)?,
            recurrence: self.recurrence.parse()?,
            starts_at: schedule::parse_datetime(&self.starts_at)?,
            ends_at: schedule::parse_datetime(&self.ends_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all seed tables from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for s in &config.sensors {
        db.upsert_sensor(&SensorSeed {
            id: s.id,
            sensor_name: s.name.clone(),
            config: serde_json::json!({ "map": s.map }).to_string(),
            is_active: s.active,
        })
        .await
        .with_context(|| format!("failed to upsert sensor {}", s.id))?;
    }

    for c in &config.cycles {
        let def = CycleDef {
            cycle_id: c.cycle_id,
            sensor_id: c.sensor_id,
            cycle_number: c.cycle_number,
            interval_seconds: c.interval_seconds,
            duration_minutes: c.duration_minutes,
            pause_seconds: c.pause_seconds,
        };
        db.upsert_cycle(&def, c.active)
            .await
            .with_context(|| format!("failed to upsert cycle {}", c.cycle_id))?;
    }

    for d in &config.devices {
        db.upsert_device(&DeviceSeed {
            device_id: d.device_id,
            device_name: d.name.clone(),
            kind: d.kind,
            gpio: d.gpio,
            control_mode: d.control_mode,
            is_active: d.active,
        })
        .await
        .with_context(|| format!("failed to upsert device {}", d.device_id))?;
    }

    for s in &config.schedules {
        let parsed = s.to_schedule()?;
        db.upsert_schedule(&parsed)
            .await
            .with_context(|| format!("failed to upsert schedule {}", s.id))?;
    }

    tracing::info!(
        sensors = config.sensors.len(),
        cycles = config.cycles.len(),
        devices = config.devices.len(),
        schedules = config.schedules.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
