//! Sensor supervisor: owns one sensor's driver and its running cycles.
//!
//! Every poll the supervisor reconciles the cycles the store declares
//! active against the workers it is running. New cycles get a worker,
//! cycles that disappeared are stopped (cooperatively, then by abort after
//! the grace period). On shutdown every worker is stopped the same way and
//! the driver is powered down.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use aquaponics_drivers::{DriverError, HardwareConfig, SensorDriver, SensorKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cycles::{CycleSource, Origin};
use crate::schedule::{ScheduleEvaluator, Target};
use crate::sink::ReadingSink;
use crate::store::CycleDef;
use crate::worker::{share, CycleExit, CyclePhase, CycleWorker, SharedProbe};

// ---------------------------------------------------------------------------
// Driver factory
// ---------------------------------------------------------------------------

/// Opens the device for a sensor kind. Called from the blocking pool.
pub trait ProbeFactory: Send + Sync {
    fn open(&self, kind: SensorKind) -> Result<SharedProbe, DriverError>;
}

/// Opens real (or simulated, without the `hardware` feature) drivers.
pub struct DriverFactory {
    hw: HardwareConfig,
}

impl DriverFactory {
    pub fn new(hw: HardwareConfig) -> Self {
        Self { hw }
    }
}

impl ProbeFactory for DriverFactory {
    fn open(&self, kind: SensorKind) -> Result<SharedProbe, DriverError> {
        Ok(share(SensorDriver::open(kind, &self.hw)?))
    }
}

// ---------------------------------------------------------------------------
// Shared services + settings
// ---------------------------------------------------------------------------

/// Everything a supervisor needs from the rest of the process.
#[derive(Clone)]
pub struct Services {
    pub sink: Arc<ReadingSink>,
    pub cycles: CycleSource,
    pub schedule: ScheduleEvaluator,
    pub drivers: Arc<dyn ProbeFactory>,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct RunningCycle {
    cancel: CancellationToken,
    handle: JoinHandle<CycleExit>,
    phase: watch::Receiver<CyclePhase>,
}

// A supervisor aborted by the fleet must not leave its workers behind.
impl Drop for RunningCycle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct SensorSupervisor {
    sensor_id: i64,
    kind: SensorKind,
    services: Services,
    settings: SupervisorSettings,
    cancel: CancellationToken,
    probe: Option<SharedProbe>,
    running: HashMap<i64, RunningCycle>,
    // Cycles that ran to completion while only the fallback file was
    // available. The file cannot record completion, so these are not
    // restarted until the store answers again.
    completed: HashSet<i64>,
}

impl SensorSupervisor {
    pub fn new(
        sensor_id: i64,
        kind: SensorKind,
        services: Services,
        settings: SupervisorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sensor_id,
            kind,
            services,
            settings,
            cancel,
            probe: None,
            running: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    /// Ids of cycles with a live worker, sorted.
    pub fn running_cycles(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn run(mut self) {
        info!(kind = %self.kind, "sensor supervisor starting");

        let Some(probe) = self.open_probe().await else {
            info!("shutdown before the driver opened");
            return;
        };
        self.probe = Some(probe);

        loop {
            self.reconcile().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        self.shutdown().await;
    }

    /// Retry opening the driver every poll until it works or shutdown.
    async fn open_probe(&self) -> Option<SharedProbe> {
        loop {
            let drivers = Arc::clone(&self.services.drivers);
            let kind = self.kind;
            match tokio::task::spawn_blocking(move || drivers.open(kind)).await {
                Ok(Ok(probe)) => {
                    debug!("driver opened");
                    return Some(probe);
                }
                Ok(Err(e)) => warn!("failed to open {} driver, retrying: {e}", self.kind),
                Err(e) => error!("driver open panicked: {e}"),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    /// One reconciliation pass.
    pub async fn reconcile(&mut self) {
        self.reap_finished().await;

        if self
            .services
            .schedule
            .is_active(Target::Sensor(self.sensor_id))
            .await
        {
            self.services.cycles.activate_dormant(self.sensor_id).await;
        }

        let listing = self.services.cycles.list_active(self.sensor_id).await;
        if listing.origin == Origin::Store {
            self.completed.clear();
        }
        let desired: HashSet<i64> = listing.cycles.iter().map(|c| c.cycle_id).collect();

        let removed: Vec<i64> = self
            .running
            .keys()
            .filter(|id| !desired.contains(id))
            .copied()
            .collect();
        for cycle_id in removed {
            info!(cycle_id, "cycle no longer active, stopping");
            self.stop_cycle(cycle_id).await;
        }

        for cycle in listing.cycles {
            if self.running.contains_key(&cycle.cycle_id) || self.completed.contains(&cycle.cycle_id) {
                continue;
            }
            self.start_cycle(cycle);
        }

        if self.running.is_empty() {
            info!("no active cycles");
        } else {
            let pausing = self
                .running
                .values()
                .filter(|r| *r.phase.borrow() == CyclePhase::Pausing)
                .count();
            info!(
                running = ?self.running_cycles(),
                pausing,
                origin = ?listing.origin,
                "cycles active"
            );
        }
    }

    fn start_cycle(&mut self, cycle: CycleDef) {
        let Some(probe) = self.probe.clone() else {
            return;
        };
        let cycle_id = cycle.cycle_id;
        let span = info_span!("cycle", cycle_id, cycle_number = cycle.cycle_number);
        let cancel = self.cancel.child_token();
        let (worker, phase) = CycleWorker::new(
            cycle,
            probe,
            Arc::clone(&self.services.sink),
            self.services.cycles.clone(),
            cancel.clone(),
        );
        let handle = tokio::spawn(worker.run().instrument(span));
        self.running.insert(
            cycle_id,
            RunningCycle {
                cancel,
                handle,
                phase,
            },
        );
    }

    /// Drop bookkeeping for workers that already exited on their own.
    async fn reap_finished(&mut self) {
        let finished: Vec<i64> = self
            .running
            .iter()
            .filter(|(_, r)| r.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for cycle_id in finished {
            let Some(mut rc) = self.running.remove(&cycle_id) else {
                continue;
            };
            match (&mut rc.handle).await {
                Ok(CycleExit::Completed) => {
                    debug!(cycle_id, "cycle completed");
                    self.completed.insert(cycle_id);
                }
                Ok(CycleExit::Stopped) => debug!(cycle_id, "cycle stopped"),
                Err(e) => {
                    error!(cycle_id, "cycle worker failed: {e}");
                    self.services.cycles.mark_inactive(cycle_id).await;
                }
            }
        }
    }

    /// Cancel a worker and wait up to the grace period, then abort it.
    async fn stop_cycle(&mut self, cycle_id: i64) {
        let Some(mut rc) = self.running.remove(&cycle_id) else {
            return;
        };
        rc.cancel.cancel();

        match tokio::time::timeout(self.settings.stop_grace, &mut rc.handle).await {
            Ok(Ok(exit)) => debug!(cycle_id, ?exit, "cycle worker exited"),
            Ok(Err(e)) => {
                error!(cycle_id, "cycle worker failed: {e}");
                self.services.cycles.mark_inactive(cycle_id).await;
            }
            Err(_) => {
                warn!(
                    cycle_id,
                    grace_secs = self.settings.stop_grace.as_secs_f64(),
                    "cycle worker did not stop in time, aborting"
                );
                rc.handle.abort();
                self.services.cycles.mark_inactive(cycle_id).await;
            }
        }
    }

    async fn shutdown(&mut self) {
        for rc in self.running.values() {
            rc.cancel.cancel();
        }
        let ids: Vec<i64> = self.running.keys().copied().collect();
        for cycle_id in ids {
            self.stop_cycle(cycle_id).await;
        }

        if let Some(probe) = self.probe.take() {
            self.power_down(probe).await;
        }
        info!("sensor supervisor stopped, store handle released");
    }

    /// Idle the device, giving up after the grace period. A driver call
    /// abandoned by an aborted worker may still hold the handle.
    async fn power_down(&self, probe: SharedProbe) {
        let grace = self.settings.stop_grace;
        let mut probe = match tokio::time::timeout(grace, probe.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!("driver still busy after the grace period, skipping power down");
                return;
            }
        };
        let call = tokio::task::spawn_blocking(move || probe.power_down());
        match tokio::time::timeout(grace, call).await {
            Ok(Ok(Ok(()))) => debug!("driver powered down"),
            Ok(Ok(Err(e))) => warn!("driver power down failed: {e}"),
            Ok(Err(e)) => error!("driver power down panicked: {e}"),
            Err(_) => warn!("driver power down did not finish in time"),
        }
    }
}
