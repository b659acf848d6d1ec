//! Fleet coordinator: one supervisor per active sensor under a shared
//! shutdown token.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aquaponics_drivers::SensorKind;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::cycles::FallbackFile;
use crate::store::{SensorRow, Store};
use crate::supervisor::{SensorSupervisor, Services, SupervisorSettings};

/// The part of a sensor's JSON `config` column the controller reads.
#[derive(Debug, Deserialize)]
struct SensorConfig {
    map: Option<String>,
}

fn kind_of(row: &SensorRow) -> Option<SensorKind> {
    let config: SensorConfig = match serde_json::from_str(&row.config) {
        Ok(c) => c,
        Err(e) => {
            warn!(sensor_id = row.id, sensor = %row.sensor_name, "sensor config is not valid JSON, skipping: {e}");
            return None;
        }
    };
    let Some(map) = config.map else {
        warn!(sensor_id = row.id, sensor = %row.sensor_name, "sensor config has no map, skipping");
        return None;
    };
    parse_kind(row.id, &map)
}

fn parse_kind(sensor_id: i64, map: &str) -> Option<SensorKind> {
    match map.parse() {
        Ok(kind) => Some(kind),
        Err(e) => {
            warn!(sensor_id, "{e}, skipping");
            None
        }
    }
}

pub struct Fleet {
    store: Arc<dyn Store>,
    fallback_path: PathBuf,
    services: Services,
    settings: SupervisorSettings,
    join_timeout: Duration,
    shutdown: CancellationToken,
    supervisors: Vec<(i64, JoinHandle<()>)>,
}

impl Fleet {
    pub fn new(
        store: Arc<dyn Store>,
        fallback_path: impl Into<PathBuf>,
        services: Services,
        settings: SupervisorSettings,
        join_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            fallback_path: fallback_path.into(),
            services,
            settings,
            join_timeout,
            shutdown,
            supervisors: Vec::new(),
        }
    }

    /// Active sensors and their driver kinds, ordered by id. Rows that do
    /// not name a known driver are skipped. Falls back to the static file
    /// when the store is unreachable.
    pub async fn discover(&self) -> Vec<(i64, SensorKind)> {
        let mut found: Vec<(i64, SensorKind)> = match self.store.active_sensors().await {
            Ok(rows) => rows.iter().filter_map(|r| Some((r.id, kind_of(r)?))).collect(),
            Err(e) => {
                warn!("sensor lookup failed, using fallback file: {e:#}");
                match FallbackFile::load(&self.fallback_path).await {
                    Ok(Some(file)) => file
                        .active_sensors()
                        .into_iter()
                        .filter_map(|(id, map)| Some((id, parse_kind(id, &map)?)))
                        .collect(),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        warn!("{e:#}");
                        Vec::new()
                    }
                }
            }
        };
        found.sort_by_key(|(id, _)| *id);
        found.dedup_by_key(|(id, _)| *id);
        found
    }

    /// Launch a supervisor for every discovered sensor. Returns how many
    /// were started.
    pub async fn start(&mut self) -> usize {
        let sensors = self.discover().await;
        if sensors.is_empty() {
            warn!("no active sensors found, idling until shutdown");
        }

        for (sensor_id, kind) in sensors {
            let supervisor = SensorSupervisor::new(
                sensor_id,
                kind,
                self.services.clone(),
                self.settings,
                self.shutdown.child_token(),
            );
            let span = info_span!("sensor", sensor_id, kind = %kind);
            let handle = tokio::spawn(supervisor.run().instrument(span));
            self.supervisors.push((sensor_id, handle));
        }
        info!(sensors = self.supervisors.len(), "fleet started");
        self.supervisors.len()
    }

    /// Signal shutdown and wait for every supervisor, aborting any still
    /// running when the join timeout runs out. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if self.supervisors.is_empty() {
            return;
        }

        let deadline = tokio::time::Instant::now() + self.join_timeout;
        let mut forced = 0usize;
        for (sensor_id, mut handle) in std::mem::take(&mut self.supervisors) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(sensor_id, "sensor supervisor failed: {e}"),
                Err(_) => {
                    warn!(sensor_id, "sensor supervisor did not stop in time, aborting");
                    handle.abort();
                    forced += 1;
                }
            }
        }
        info!(forced, "fleet stopped");
    }

    /// Start, wait for the shutdown token, then stop.
    pub async fn run(mut self) {
        self.start().await;
        self.shutdown.cancelled().await;
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycles::CycleSource;
    use crate::schedule::ScheduleEvaluator;
    use crate::sink::ReadingSink;
    use crate::store::memory::MemoryStore;
    use crate::store::CycleDef;
    use crate::supervisor::ProbeFactory;
    use crate::worker::tests::FakeProbe;
    use crate::worker::{share, Probe, SharedProbe};
    use aquaponics_drivers::DriverError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use time::UtcOffset;
    use tokio::time::Instant;

    struct Factory {
        make: Box<dyn Fn() -> SharedProbe + Send + Sync>,
        opened: Mutex<Vec<SensorKind>>,
    }

    impl ProbeFactory for Factory {
        fn open(&self, kind: SensorKind) -> Result<SharedProbe, DriverError> {
            self.opened.lock().unwrap().push(kind);
            Ok((self.make)())
        }
    }

    struct SlowProbe;

    impl Probe for SlowProbe {
        fn sample(&mut self, _interval: Duration) -> Result<Option<f64>, DriverError> {
            std::thread::sleep(Duration::from_millis(800));
            Ok(None)
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        factory: Arc<Factory>,
        dir: tempfile::TempDir,
    }

    fn rig(make: Box<dyn Fn() -> SharedProbe + Send + Sync>) -> Rig {
        Rig {
            store: Arc::new(MemoryStore::new()),
            factory: Arc::new(Factory {
                make,
                opened: Mutex::new(Vec::new()),
            }),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn counting_rig(calls: Arc<AtomicUsize>) -> Rig {
        rig(Box::new(move || {
            let mut probe = FakeProbe::reading(7.0);
            probe.calls = Arc::clone(&calls);
            share(probe)
        }))
    }

    fn fleet(rig: &Rig, settings: SupervisorSettings, join_timeout: Duration) -> Fleet {
        let store: Arc<dyn Store> = rig.store.clone();
        let fallback = rig.dir.path().join("sensors.json");
        let services = Services {
            sink: Arc::new(ReadingSink::new(store.clone(), rig.dir.path().join("queue.json"))),
            cycles: CycleSource::new(store.clone(), &fallback),
            schedule: ScheduleEvaluator::new(store.clone(), UtcOffset::UTC),
            drivers: rig.factory.clone(),
        };
        Fleet::new(store, fallback, services, settings, join_timeout, CancellationToken::new())
    }

    fn cycle(cycle_id: i64, sensor_id: i64) -> CycleDef {
        CycleDef {
            cycle_id,
            sensor_id,
            cycle_number: 1,
            interval_seconds: 5,
            duration_minutes: 10,
            pause_seconds: 0,
        }
    }

    #[tokio::test]
    async fn discovery_skips_unusable_rows() {
        let rig = counting_rig(Arc::default());
        rig.store.add_sensor(7, "distance");
        rig.store.add_sensor(3, "tank1");
        for (id, config) in [(4, "not json"), (5, "{}"), (6, r#"{"map":"sonar"}"#)] {
            rig.store.add_raw_sensor(SensorRow {
                id,
                sensor_name: format!("sensor-{id}"),
                config: config.into(),
            });
        }
        let fleet = fleet(&rig, SupervisorSettings::default(), Duration::from_secs(15));

        assert_eq!(
            fleet.discover().await,
            vec![(3, SensorKind::Tank1), (7, SensorKind::Distance)]
        );
    }

    #[tokio::test]
    async fn discovery_uses_fallback_file_during_outage() {
        let rig = counting_rig(Arc::default());
        std::fs::write(
            rig.dir.path().join("sensors.json"),
            r#"{ "sensors": {
                "2": { "map": "ph" },
                "9": { "map": "camera", "active": false },
                "4": { "map": "humidity" }
            } }"#,
        )
        .unwrap();
        rig.store.set_down(true);
        let fleet = fleet(&rig, SupervisorSettings::default(), Duration::from_secs(15));

        assert_eq!(
            fleet.discover().await,
            vec![(2, SensorKind::Ph), (4, SensorKind::Humidity)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn runs_every_sensor_and_stops_on_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let rig = counting_rig(calls.clone());
        rig.store.add_sensor(3, "tank1");
        rig.store.add_sensor(4, "ph");
        rig.store.add_cycle(cycle(10, 3), true);
        rig.store.add_cycle(cycle(20, 4), true);

        let fleet = fleet(&rig, SupervisorSettings::default(), Duration::from_secs(15));
        let shutdown = fleet.shutdown.clone();
        let handle = tokio::spawn(fleet.run());

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(rig.store.cycle_active(10) && rig.store.cycle_active(20));
        let mut opened = rig.factory.opened.lock().unwrap().clone();
        opened.sort_by_key(|k| k.as_str());
        assert_eq!(opened, vec![SensorKind::Ph, SensorKind::Tank1]);

        let started = Instant::now();
        shutdown.cancel();
        handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!rig.store.cycle_active(10) && !rig.store.cycle_active(20));

        let reads = calls.load(Ordering::SeqCst);
        assert!(reads >= 4);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn no_sensors_idles_until_shutdown() {
        let rig = counting_rig(Arc::default());
        let mut fleet = fleet(&rig, SupervisorSettings::default(), Duration::from_secs(15));

        assert_eq!(fleet.start().await, 0);
        fleet.stop().await;
        fleet.stop().await;
        assert!(fleet.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn stragglers_are_aborted_at_join_timeout() {
        let rig = rig(Box::new(|| share(SlowProbe)));
        rig.store.add_sensor(3, "pump_tank");
        rig.store.add_cycle(cycle(10, 3), true);
        let settings = SupervisorSettings {
            poll_interval: Duration::from_millis(50),
            stop_grace: Duration::from_secs(2),
        };
        let mut fleet = fleet(&rig, settings, Duration::from_millis(100));

        assert_eq!(fleet.start().await, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        fleet.stop().await;
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(fleet.supervisors.is_empty());
    }
}
