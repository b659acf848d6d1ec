//! Cycle worker: runs one declared cycle to completion.
//!
//! ```text
//! Running ──[duration elapsed]──▶ Pausing ──[pause elapsed]──▶ Done
//!    │                               │
//!    └─────────[cancelled]───────────┴──────────────────────────▶ Done
//! ```
//!
//! While running, the sensor's driver is invoked once per interval on the
//! blocking pool and any value is handed to the sink. The worker sleeps the
//! full interval after every invocation, however long the call took. A
//! failing invocation is logged and never ends the cycle. On every exit path
//! the cycle is marked inactive in the store.
//!
//! Sibling cycles of one sensor share its driver handle. A worker waits at
//! most one interval for the handle and skips the interval when another
//! cycle still holds it. Cancellation is observed while waiting for the
//! handle and while a driver call is in flight; an abandoned call finishes
//! on the blocking pool and its result is dropped.

use std::sync::Arc;
use std::time::Duration;

use aquaponics_drivers::{DriverError, SensorDriver};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cycles::CycleSource;
use crate::sink::ReadingSink;
use crate::store::CycleDef;

// ---------------------------------------------------------------------------
// Driver seam
// ---------------------------------------------------------------------------

/// Blocking device access as seen by workers and supervisors.
pub trait Probe: Send {
    /// Perform the cycle action once; see [`SensorDriver::sample`].
    fn sample(&mut self, interval: Duration) -> Result<Option<f64>, DriverError>;

    fn power_down(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

impl Probe for SensorDriver {
    fn sample(&mut self, interval: Duration) -> Result<Option<f64>, DriverError> {
        SensorDriver::sample(self, interval)
    }

    fn power_down(&mut self) -> Result<(), DriverError> {
        SensorDriver::power_down(self)
    }
}

/// One opened device, shared by every cycle of its sensor. Calls are
/// serialized by the mutex and only ever made from the blocking pool, with
/// the owned guard moved onto the blocking thread.
pub type SharedProbe = Arc<Mutex<dyn Probe>>;

pub fn share(probe: impl Probe + 'static) -> SharedProbe {
    share(probe)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Running,
    Pausing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleExit {
    /// Ran for its full duration.
    Completed,
    /// Cancelled before the duration elapsed.
    Stopped,
}

pub struct CycleWorker {
    cycle: CycleDef,
    probe: SharedProbe,
    sink: Arc<ReadingSink>,
    cycles: CycleSource,
    cancel: CancellationToken,
    phase: watch::Sender<CyclePhase>,
}

impl CycleWorker {
    pub fn new(
        cycle: CycleDef,
        probe: SharedProbe,
        sink: Arc<ReadingSink>,
        cycles: CycleSource,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<CyclePhase>) {
        let (phase, phase_rx) = watch::channel(CyclePhase::Running);
        (
            Self {
                cycle,
                probe,
                sink,
                cycles,
                cancel,
                phase,
            },
            phase_rx,
        )
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.cycle.interval_seconds.max(1) as u64)
    }

    fn duration(&self) -> Duration {
        Duration::from_secs((self.cycle.duration_minutes.max(0) as u64).saturating_mul(60))
    }

    fn pause(&self) -> Duration {
        Duration::from_secs(self.cycle.pause_seconds.max(0) as u64)
    }

    pub async fn run(self) -> CycleExit {
        let CycleDef {
            cycle_id,
            cycle_number,
            ..
        } = self.cycle;
        info!(
            cycle_number,
            interval_seconds = self.cycle.interval_seconds,
            duration_minutes = self.cycle.duration_minutes,
            pause_seconds = self.cycle.pause_seconds,
            "cycle started"
        );

        let exit = self.run_phases().await;

        let _ = self.phase.send(CyclePhase::Done);
        self.cycles.mark_inactive(cycle_id).await;
        info!(cycle_number, ?exit, "cycle finished");
        exit
    }

    async fn run_phases(&self) -> CycleExit {
        let started = Instant::now();
        let (interval, duration) = (self.interval(), self.duration());
        let mut reads: u32 = 0;

        while !self.cancel.is_cancelled() && started.elapsed() < duration {
            if self.sample_once().await {
                reads += 1;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if self.cancel.is_cancelled() {
            info!(reads, "cycle stopped");
            return CycleExit::Stopped;
        }
        info!(reads, elapsed_secs = started.elapsed().as_secs(), "cycle duration reached");

        let pause = self.pause();
        if !pause.is_zero() {
            let _ = self.phase.send(CyclePhase::Pausing);
            info!(pause_seconds = pause.as_secs(), "cycle pausing");
            tokio::select! {
                _ = self.cancel.cancelled() => debug!("pause cut short"),
                _ = tokio::time::sleep(pause) => {}
            }
        }
        CycleExit::Completed
    }

    /// One driver invocation. Returns true when a value was produced.
    async fn sample_once(&self) -> bool {
        let interval = self.interval();
        let sensor_id = self.cycle.sensor_id;

        let mut probe = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            guard = Arc::clone(&self.probe).lock_owned() => guard,
            _ = tokio::time::sleep(interval) => {
                info!("driver held by another cycle, skipping this interval");
                return false;
            }
        };
        let call = tokio::task::spawn_blocking(move || probe.sample(interval));

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("cancelled during a driver call, result will be dropped");
                return false;
            }
            result = call => result,
        };

        match result {
            Ok(Ok(Some(value))) => {
                self.sink.record(sensor_id, value).await;
                true
            }
            Ok(Ok(None)) => {
                debug!("no reading this interval");
                false
            }
            Ok(Err(e)) if e.is_routine() => {
                info!("{e}, skipping this interval");
                false
            }
            Ok(Err(e)) => {
                warn!("driver error: {e}");
                false
            }
            Err(e) => {
                error!("driver call panicked: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test probe: returns `value` and counts calls.
    pub(crate) struct FakeProbe {
        pub calls: Arc<AtomicUsize>,
        pub value: Option<f64>,
        pub fail: Option<fn() -> DriverError>,
        pub powered_down: Arc<AtomicUsize>,
    }

    impl FakeProbe {
        pub(crate) fn reading(value: f64) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                value: Some(value),
                fail: None,
                powered_down: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Probe for FakeProbe {
        fn sample(&mut self, _interval: Duration) -> Result<Option<f64>, DriverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                Some(f) => Err(f()),
                None => Ok(self.value),
            }
        }

        fn power_down(&mut self) -> Result<(), DriverError> {
            self.powered_down.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Blocks its thread on the first call only.
    struct WedgeOnce(Option<Duration>);

    impl Probe for WedgeOnce {
        fn sample(&mut self, _interval: Duration) -> Result<Option<f64>, DriverError> {
            if let Some(wedge) = self.0.take() {
                std::thread::sleep(wedge);
            }
            Ok(Some(7.0))
        }
    }

    pub(crate) fn tank1_cycle() -> CycleDef {
        CycleDef {
            cycle_id: 10,
            sensor_id: 3,
            cycle_number: 1,
            interval_seconds: 5,
            duration_minutes: 1,
            pause_seconds: 2,
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        sink: Arc<ReadingSink>,
        cycles: CycleSource,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(ReadingSink::new(store.clone(), dir.path().join("queue.json")));
        let cycles = CycleSource::new(store.clone(), dir.path().join("sensors.json"));
        Rig {
            store,
            sink,
            cycles,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tank_cycle_runs_full_duration_then_pauses() {
        let rig = rig();
        rig.store.add_cycle(tank1_cycle(), true);
        let probe = FakeProbe::reading(24.5);
        let calls = probe.calls.clone();

        let (worker, phase) = CycleWorker::new(
            tank1_cycle(),
            share(probe),
            rig.sink.clone(),
            rig.cycles.clone(),
            CancellationToken::new(),
        );

        let started = Instant::now();
        let exit = worker.run().await;

        assert_eq!(exit, CycleExit::Completed);
        // 60 s at a 5 s interval: about 12 reads.
        let n = calls.load(Ordering::SeqCst);
        assert!((11..=13).contains(&n), "unexpected read count {n}");
        assert_eq!(rig.store.readings().len(), n);
        assert!(rig.store.readings().iter().all(|r| r.sensor_id == 3 && r.value == 24.5));
        // Duration plus the 2 s pause.
        assert!(started.elapsed() >= Duration::from_secs(62));
        assert!(!rig.store.cycle_active(10));
        assert_eq!(*phase.borrow(), CyclePhase::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn read_count_tracks_duration_over_interval() {
        let rig = rig();
        let cycle = CycleDef {
            interval_seconds: 7,
            duration_minutes: 2,
            pause_seconds: 0,
            ..tank1_cycle()
        };
        let probe = FakeProbe::reading(1.0);
        let calls = probe.calls.clone();
        let (worker, _) = CycleWorker::new(
            cycle,
            share(probe),
            rig.sink.clone(),
            rig.cycles.clone(),
            CancellationToken::new(),
        );

        let started = Instant::now();
        worker.run().await;

        // ceil(120 / 7) = 18
        let n = calls.load(Ordering::SeqCst);
        assert!((17..=19).contains(&n), "unexpected read count {n}");
        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_early_and_marks_inactive() {
        let rig = rig();
        rig.store.add_cycle(tank1_cycle(), true);
        let cancel = CancellationToken::new();
        let (worker, _) = CycleWorker::new(
            tank1_cycle(),
            share(FakeProbe::reading(24.5)),
            rig.sink.clone(),
            rig.cycles.clone(),
            cancel.clone(),
        );

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();

        let exit = handle.await.unwrap();
        assert_eq!(exit, CycleExit::Stopped);
        assert!(rig.store.readings().len() <= 4);
        assert!(!rig.store.cycle_active(10));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_errors_do_not_end_the_cycle() {
        let rig = rig();
        let mut probe = FakeProbe::reading(0.0);
        probe.fail = Some(|| DriverError::Timeout("echo start"));
        let calls = probe.calls.clone();
        let (worker, _) = CycleWorker::new(
            tank1_cycle(),
            share(probe),
            rig.sink.clone(),
            rig.cycles.clone(),
            CancellationToken::new(),
        );

        assert_eq!(worker.run().await, CycleExit::Completed);
        assert!(calls.load(Ordering::SeqCst) >= 11);
        assert!(rig.store.readings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_and_absent_results_store_nothing() {
        let rig = rig();
        let mut busy = FakeProbe::reading(0.0);
        busy.fail = Some(|| DriverError::Busy);
        let mut absent = FakeProbe::reading(0.0);
        absent.value = None;

        for probe in [busy, absent] {
            let (worker, _) = CycleWorker::new(
                CycleDef {
                    pause_seconds: 0,
                    ..tank1_cycle()
                },
                share(probe),
                rig.sink.clone(),
                rig.cycles.clone(),
                CancellationToken::new(),
            );
            assert_eq!(worker.run().await, CycleExit::Completed);
        }
        assert!(rig.store.readings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_during_cycle_queues_readings() {
        let rig = rig();
        rig.store.set_down(true);
        let (worker, _) = CycleWorker::new(
            CycleDef {
                pause_seconds: 0,
                ..tank1_cycle()
            },
            share(FakeProbe::reading(24.5)),
            rig.sink.clone(),
            rig.cycles.clone(),
            CancellationToken::new(),
        );
        worker.run().await;

        let queued = rig.sink.queue().len().await.unwrap();
        assert!((11..=13).contains(&queued), "unexpected queue length {queued}");
    }

    #[tokio::test]
    async fn wedged_call_neither_stalls_siblings_nor_delays_stop() {
        let rig = rig();
        let probe = share(WedgeOnce(Some(Duration::from_millis(1500))));
        let fast = CycleDef {
            interval_seconds: 1,
            pause_seconds: 0,
            ..tank1_cycle()
        };

        let wedged_cancel = CancellationToken::new();
        let (wedged, _) = CycleWorker::new(
            fast.clone(),
            probe.clone(),
            rig.sink.clone(),
            rig.cycles.clone(),
            wedged_cancel.clone(),
        );
        let wedged = tokio::spawn(wedged.run());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sibling_cancel = CancellationToken::new();
        let (sibling, _) = CycleWorker::new(
            CycleDef { cycle_id: 11, ..fast },
            probe,
            rig.sink.clone(),
            rig.cycles.clone(),
            sibling_cancel.clone(),
        );
        let sibling = tokio::spawn(sibling.run());
        tokio::time::sleep(Duration::from_millis(250)).await;

        // The stuck call is still running; stopping its cycle does not wait for it.
        let started = Instant::now();
        wedged_cancel.cancel();
        assert_eq!(wedged.await.unwrap(), CycleExit::Stopped);
        assert!(started.elapsed() < Duration::from_millis(200));

        // The sibling skips one interval, then reads once the handle is free.
        tokio::time::sleep(Duration::from_millis(3300)).await;
        let reads = rig.store.readings().len();
        assert!(reads >= 2, "sibling produced {reads} readings");
        assert!(rig.store.readings().iter().all(|r| r.value == 7.0));

        let started = Instant::now();
        sibling_cancel.cancel();
        assert_eq!(sibling.await.unwrap(), CycleExit::Stopped);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn huge_duration_saturates() {
        let rig = rig();
        let (worker, _) = CycleWorker::new(
            CycleDef {
                duration_minutes: i64::MAX,
                ..tank1_cycle()
            },
            share(FakeProbe::reading(1.0)),
            rig.sink.clone(),
            rig.cycles.clone(),
            CancellationToken::new(),
        );
        assert_eq!(worker.duration(), Duration::from_secs(u64::MAX));
    }
}
