use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use crate::retry::RetryPolicy;
use crate::schedule::{self, Recurrence, Schedule, Target};
use crate::store::{ControlMode, CycleDef, Device, DeviceKind, Reading, SensorRow, Store};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
    writes: RetryPolicy,
}

/// Seed rows, upserted from the config file at startup.
#[derive(Debug, Clone)]
pub struct SensorSeed {
    pub id: i64,
    pub sensor_name: String,
    pub config: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceSeed {
    pub device_id: i64,
    pub device_name: String,
    pub kind: DeviceKind,
    pub gpio: i64,
    pub control_mode: ControlMode,
    pub is_active: bool,
}

#[derive(FromRow)]
struct DeviceDbRow {
    device_id: i64,
    device_name: String,
    kind: String,
    gpio: i64,
    control_mode: String,
    relay_status: bool,
}

#[derive(FromRow)]
struct ScheduleDbRow {
    id: i64,
    target_kind: String,
    target_id: i64,
    recurrence: String,
    starts_at: String,
    ends_at: String,
}

fn parse_device(r: DeviceDbRow) -> Result<Device> {
    let kind = match r.kind.as_str() {
        "relay" => DeviceKind::Relay,
        "feeder" => DeviceKind::Feeder,
        other => anyhow::bail!("unknown device kind '{other}'"),
    };
    let control_mode = match r.control_mode.as_str() {
        "manual" => ControlMode::Manual,
        "schedule" => ControlMode::Schedule,
        other => anyhow::bail!("unknown control mode '{other}'"),
    };
    let gpio = u8::try_from(r.gpio).with_context(|| format!("gpio {} out of range", r.gpio))?;
    Ok(Device {
        device_id: r.device_id,
        device_name: r.device_name,
        kind,
        gpio,
        control_mode,
        relay_status: r.relay_status,
    })
}

fn parse_schedule(r: ScheduleDbRow) -> Result<Schedule> {
    Ok(Schedule {
        id: r.id,
        target: Target::from_parts(&r.target_kind, r.target_id)?,
        recurrence: r.recurrence.parse::<Recurrence>()?,
        starts_at: schedule::parse_datetime(&r.starts_at)?,
        ends_at: schedule::parse_datetime(&r.ends_at)?,
    })
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/aquaponics/aquaponics.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self {
            pool,
            writes: RetryPolicy::once(),
        })
    }

    /// Connect, retrying with backoff. Failure after the last attempt is
    /// returned to the caller, which treats it as fatal.
    pub async fn connect_with_retry(
        db_url: &str,
        max_connections: u32,
        policy: &RetryPolicy,
    ) -> Result<Self> {
        policy
            .run("connect", || Self::connect(db_url, max_connections))
            .await
            .map_err(|e| e.context(format!("giving up on {db_url} after {} attempt(s)", policy.attempts.max(1))))
    }

    /// Retry policy for reading inserts.
    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.writes = policy;
        self
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("store connection pool closed");
    }

    // ----------------------------
    // Seeding
    // ----------------------------

    pub async fn upsert_sensor(&self, s: &SensorSeed) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (id, sensor_name, config, is_active)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              sensor_name=excluded.sensor_name,
              config=excluded.config,
              is_active=excluded.is_active
            "#,
        )
        .bind(s.id)
        .bind(&s.sensor_name)
        .bind(&s.config)
        .bind(s.is_active)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    /// Insert or update a cycle definition. The activation flag is only set
    /// on insert; an existing row keeps whatever state the system left it in.
    pub async fn upsert_cycle(&self, c: &CycleDef, initially_active: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cycles (
              cycle_id, sensor_id, cycle_number,
              interval_seconds, duration_minutes, pause_seconds,
              is_active
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(cycle_id) DO UPDATE SET
              sensor_id=excluded.sensor_id,
              cycle_number=excluded.cycle_number,
              interval_seconds=excluded.interval_seconds,
              duration_minutes=excluded.duration_minutes,
              pause_seconds=excluded.pause_seconds
            "#,
        )
        .bind(c.cycle_id)
        .bind(c.sensor_id)
        .bind(c.cycle_number)
        .bind(c.interval_seconds)
        .bind(c.duration_minutes)
        .bind(c.pause_seconds)
        .bind(initially_active)
        .execute(&self.pool)
        .await
        .context("upsert_cycle failed")?;
        Ok(())
    }

    pub async fn upsert_device(&self, d: &DeviceSeed) -> Result<()> {
        let kind = match d.kind {
            DeviceKind::Relay => "relay",
            DeviceKind::Feeder => "feeder",
        };
        let mode = match d.control_mode {
            ControlMode::Manual => "manual",
            ControlMode::Schedule => "schedule",
        };
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, device_name, kind, gpio, control_mode, is_active)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              device_name=excluded.device_name,
              kind=excluded.kind,
              gpio=excluded.gpio,
              control_mode=excluded.control_mode,
              is_active=excluded.is_active
            "#,
        )
        .bind(d.device_id)
        .bind(&d.device_name)
        .bind(kind)
        .bind(d.gpio)
        .bind(mode)
        .bind(d.is_active)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn upsert_schedule(&self, s: &Schedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, target_kind, target_id, recurrence, starts_at, ends_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              target_kind=excluded.target_kind,
              target_id=excluded.target_id,
              recurrence=excluded.recurrence,
              starts_at=excluded.starts_at,
              ends_at=excluded.ends_at
            "#,
        )
        .bind(s.id)
        .bind(s.target.kind())
        .bind(s.target.id())
        .bind(s.recurrence.as_str())
        .bind(schedule::format_datetime(s.starts_at)?)
        .bind(schedule::format_datetime(s.ends_at)?)
        .execute(&self.pool)
        .await
        .context("upsert_schedule failed")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn set_relay_status(&self, device_id: i64, on: bool) -> Result<()> {
        sqlx::query("UPDATE devices SET relay_status = ? WHERE device_id = ?")
            .bind(on)
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("set_relay_status failed")?;
        Ok(())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    async fn insert_reading_once(&self, r: &Reading) -> Result<()> {
        let ts = r
            .reading_time
            .format(&Rfc3339)
            .context("failed to format reading_time")?;
        sqlx::query("INSERT INTO sensor_data (sensor_id, value, reading_time) VALUES (?, ?, ?)")
            .bind(r.sensor_id)
            .bind(r.value)
            .bind(ts)
            .execute(&self.pool)
            .await
            .context("insert_reading failed")?;
        Ok(())
    }

    /// Values stored for a sensor, oldest first.
    #[cfg(test)]
    pub async fn readings_for_sensor(&self, sensor_id: i64) -> Result<Vec<(f64, String)>> {
        let rows: Vec<(f64, String)> = sqlx::query_as(
            r#"
            SELECT value, reading_time
            FROM sensor_data
            WHERE sensor_id = ?
            ORDER BY id
            "#,
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await
        .context("readings_for_sensor failed")?;
        Ok(rows)
    }

    #[cfg(test)]
    pub async fn cycle_is_active(&self, cycle_id: i64) -> Result<Option<bool>> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT is_active FROM cycles WHERE cycle_id = ?")
            .bind(cycle_id)
            .fetch_optional(&self.pool)
            .await
            .context("cycle_is_active failed")?;
        Ok(row.map(|(a,)| a))
    }
}

#[async_trait]
impl Store for Db {
    async fn insert_reading(&self, reading: &Reading) -> Result<()> {
        self.writes
            .run("insert_reading", || self.insert_reading_once(reading))
            .await
    }

    async fn active_cycles(&self, sensor_id: i64) -> Result<Vec<CycleDef>> {
        let rows = sqlx::query_as::<_, CycleDef>(
            r#"
            SELECT cycle_id, sensor_id, cycle_number,
                   interval_seconds, duration_minutes, pause_seconds
            FROM cycles
            WHERE sensor_id = ? AND is_active = 1
            ORDER BY cycle_id
            "#,
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await
        .context("active_cycles failed")?;
        Ok(rows)
    }

    async fn activate_dormant_cycles(&self, sensor_id: i64) -> Result<u64> {
        let res = sqlx::query("UPDATE cycles SET is_active = 1 WHERE sensor_id = ? AND is_active = 0")
            .bind(sensor_id)
            .execute(&self.pool)
            .await
            .context("activate_dormant_cycles failed")?;
        Ok(res.rows_affected())
    }

    async fn deactivate_cycle(&self, cycle_id: i64) -> Result<()> {
        sqlx::query("UPDATE cycles SET is_active = 0 WHERE cycle_id = ?")
            .bind(cycle_id)
            .execute(&self.pool)
            .await
            .context("deactivate_cycle failed")?;
        Ok(())
    }

    async fn active_sensors(&self) -> Result<Vec<SensorRow>> {
        let rows = sqlx::query_as::<_, SensorRow>(
            r#"
            SELECT id, sensor_name, config
            FROM sensors
            WHERE is_active = 1
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("active_sensors failed")?;
        Ok(rows)
    }

    async fn schedules_for(&self, target: Target) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleDbRow>(
            r#"
            SELECT id, target_kind, target_id, recurrence, starts_at, ends_at
            FROM schedules
            WHERE target_kind = ? AND target_id = ?
            ORDER BY id
            "#,
        )
        .bind(target.kind())
        .bind(target.id())
        .fetch_all(&self.pool)
        .await
        .context("schedules_for failed")?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let id = r.id;
                parse_schedule(r)
                    .map_err(|e| warn!(schedule_id = id, "skipping schedule: {e:#}"))
                    .ok()
            })
            .collect())
    }

    async fn active_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceDbRow>(
            r#"
            SELECT device_id, device_name, kind, gpio, control_mode, relay_status
            FROM devices
            WHERE is_active = 1
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("active_devices failed")?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let id = r.device_id;
                parse_device(r)
                    .map_err(|e| warn!(device_id = id, "skipping device: {e:#}"))
                    .ok()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:", 1).await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn sensor(id: i64, map: &str) -> SensorSeed {
        SensorSeed {
            id,
            sensor_name: format!("sensor {id}"),
            config: format!(r#"{{"map":"{map}"}}"#),
            is_active: true,
        }
    }

    fn cycle(cycle_id: i64, sensor_id: i64) -> CycleDef {
        CycleDef {
            cycle_id,
            sensor_id,
            cycle_number: cycle_id,
            interval_seconds: 5,
            duration_minutes: 1,
            pause_seconds: 2,
        }
    }

    #[tokio::test]
    async fn active_cycles_are_filtered_and_ordered() {
        let db = test_db().await;
        db.upsert_sensor(&sensor(3, "tank1")).await.unwrap();
        db.upsert_cycle(&cycle(12, 3), true).await.unwrap();
        db.upsert_cycle(&cycle(10, 3), true).await.unwrap();
        db.upsert_cycle(&cycle(11, 3), false).await.unwrap();

        let ids: Vec<i64> = db.active_cycles(3).await.unwrap().iter().map(|c| c.cycle_id).collect();
        assert_eq!(ids, vec![10, 12]);
    }

    #[tokio::test]
    async fn activate_and_deactivate_cycles() {
        let db = test_db().await;
        db.upsert_sensor(&sensor(3, "tank1")).await.unwrap();
        db.upsert_cycle(&cycle(1, 3), false).await.unwrap();
        db.upsert_cycle(&cycle(2, 3), false).await.unwrap();

        assert_eq!(db.activate_dormant_cycles(3).await.unwrap(), 2);
        assert_eq!(db.activate_dormant_cycles(3).await.unwrap(), 0);

        db.deactivate_cycle(1).await.unwrap();
        assert_eq!(db.cycle_is_active(1).await.unwrap(), Some(false));
        assert_eq!(db.cycle_is_active(2).await.unwrap(), Some(true));
        assert_eq!(db.cycle_is_active(99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reseeding_keeps_activation_flag() {
        let db = test_db().await;
        db.upsert_sensor(&sensor(3, "tank1")).await.unwrap();
        db.upsert_cycle(&cycle(1, 3), true).await.unwrap();
        db.deactivate_cycle(1).await.unwrap();

        let mut changed = cycle(1, 3);
        changed.interval_seconds = 30;
        db.upsert_cycle(&changed, true).await.unwrap();

        assert_eq!(db.cycle_is_active(1).await.unwrap(), Some(false));
        db.activate_dormant_cycles(3).await.unwrap();
        assert_eq!(db.active_cycles(3).await.unwrap()[0].interval_seconds, 30);
    }

    #[tokio::test]
    async fn readings_keep_insert_order() {
        let db = test_db().await;
        for v in [1.0, 2.5, 3.0] {
            db.insert_reading(&Reading::now(7, v)).await.unwrap();
        }
        let values: Vec<f64> = db
            .readings_for_sensor(7)
            .await
            .unwrap()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(values, vec![1.0, 2.5, 3.0]);
    }

    #[tokio::test]
    async fn reading_time_is_stored_as_rfc3339() {
        let db = test_db().await;
        let r = Reading {
            sensor_id: 7,
            value: 22.5,
            reading_time: datetime!(2024-05-01 06:30:00 UTC),
        };
        db.insert_reading(&r).await.unwrap();
        let rows = db.readings_for_sensor(7).await.unwrap();
        assert_eq!(rows[0].1, "2024-05-01T06:30:00Z");
    }

    #[tokio::test]
    async fn only_active_sensors_listed() {
        let db = test_db().await;
        db.upsert_sensor(&sensor(1, "ph")).await.unwrap();
        db.upsert_sensor(&SensorSeed {
            is_active: false,
            ..sensor(2, "light")
        })
        .await
        .unwrap();

        let rows = db.active_sensors().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[0].config, r#"{"map":"ph"}"#);
    }

    #[tokio::test]
    async fn schedules_round_trip_by_target() {
        let db = test_db().await;
        let s = Schedule {
            id: 1,
            target: Target::Device(4),
            recurrence: Recurrence::Weekly,
            starts_at: datetime!(2024-05-01 06:00:00),
            ends_at: datetime!(2024-05-01 07:00:00),
        };
        db.upsert_schedule(&s).await.unwrap();

        assert_eq!(db.schedules_for(Target::Device(4)).await.unwrap(), vec![s]);
        assert!(db.schedules_for(Target::Sensor(4)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn devices_parse_kind_and_mode() {
        let db = test_db().await;
        db.upsert_device(&DeviceSeed {
            device_id: 1,
            device_name: "grow light".into(),
            kind: DeviceKind::Relay,
            gpio: 21,
            control_mode: ControlMode::Schedule,
            is_active: true,
        })
        .await
        .unwrap();
        db.set_relay_status(1, true).await.unwrap();

        let devices = db.active_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kind, DeviceKind::Relay);
        assert_eq!(devices[0].control_mode, ControlMode::Schedule);
        assert_eq!(devices[0].gpio, 21);
        assert!(devices[0].relay_status);
    }

    #[tokio::test]
    async fn connect_with_retry_gives_up() {
        let policy = RetryPolicy {
            attempts: 2,
            first_delay_ms: 1,
            max_delay_ms: 1,
            factor: 1.0,
        };
        let err = Db::connect_with_retry("sqlite:/nonexistent/dir/aquaponics.db", 1, &policy)
            .await
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("giving up"));
    }
}
