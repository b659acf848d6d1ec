//! Device/relay monitor.
//!
//! Polls the active devices on its own interval, works out whether each
//! should be on (the stored `relay_status` for manual devices, the device's
//! schedules otherwise) and drives the output only when that differs from
//! the last state it applied. Feeders dispense once on every off→on edge.
//! A device that drops out of the active list, or moves to another pin, has
//! its old output switched off and released. All relays are switched off
//! when the monitor stops.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use aquaponics_drivers::feeder::Feeder;
use aquaponics_drivers::gpio::Relay;
use aquaponics_drivers::DriverError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::schedule::{ScheduleEvaluator, Target};
use crate::store::{ControlMode, Device, DeviceKind, Store};

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// A switchable device output. Calls block and run on the blocking pool.
pub trait Output: Send {
    fn drive(&mut self, on: bool) -> Result<(), DriverError>;
}

pub trait OutputFactory: Send + Sync {
    fn open(&self, device: &Device) -> Result<Box<dyn Output>, DriverError>;
}

struct RelayOutput(Relay);

impl Output for RelayOutput {
    fn drive(&mut self, on: bool) -> Result<(), DriverError> {
        self.0.set(on);
        Ok(())
    }
}

struct FeederOutput {
    feeder: Feeder,
    hold: Duration,
}

impl Output for FeederOutput {
    fn drive(&mut self, on: bool) -> Result<(), DriverError> {
        if on {
            self.feeder.dispense(self.hold)
        } else {
            Ok(())
        }
    }
}

/// GPIO-backed relays and servo feeders.
pub struct GpioOutputs {
    active_low: bool,
    feeder_hold: Duration,
}

impl GpioOutputs {
    pub fn new(active_low: bool, feeder_hold: Duration) -> Self {
        Self {
            active_low,
            feeder_hold,
        }
    }
}

impl OutputFactory for GpioOutputs {
    fn open(&self, device: &Device) -> Result<Box<dyn Output>, DriverError> {
        Ok(match device.kind {
            DeviceKind::Relay => Box::new(RelayOutput(Relay::new(device.gpio, self.active_low)?)),
            DeviceKind::Feeder => Box::new(FeederOutput {
                feeder: Feeder::new(device.gpio)?,
                hold: self.feeder_hold,
            }),
        })
    }
}

type SharedOutput = Arc<Mutex<Box<dyn Output>>>;

/// An opened output and the wiring it was opened for.
struct OpenOutput {
    kind: DeviceKind,
    gpio: u8,
    out: SharedOutput,
}

impl OpenOutput {
    fn wired_for(&self, device: &Device) -> bool {
        self.kind == device.kind && self.gpio == device.gpio
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct DeviceMonitor {
    store: Arc<dyn Store>,
    schedule: ScheduleEvaluator,
    outputs: Arc<dyn OutputFactory>,
    poll_interval: Duration,
    cancel: CancellationToken,
    applied: HashMap<i64, bool>,
    open: HashMap<i64, OpenOutput>,
}

impl DeviceMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        schedule: ScheduleEvaluator,
        outputs: Arc<dyn OutputFactory>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            schedule,
            outputs,
            poll_interval,
            cancel,
            applied: HashMap::new(),
            open: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        info!("device monitor started");
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        self.all_off().await;
        info!("device monitor stopped");
    }

    /// One pass over the active devices. Returns how many changed state.
    pub async fn poll_once(&mut self) -> usize {
        let devices = match self.store.active_devices().await {
            Ok(d) => d,
            Err(e) => {
                warn!("device lookup failed: {e:#}");
                return 0;
            }
        };

        let listed: HashSet<i64> = devices.iter().map(|d| d.device_id).collect();
        let gone: Vec<i64> = self
            .open
            .keys()
            .filter(|id| !listed.contains(id))
            .copied()
            .collect();
        for device_id in gone {
            info!(device_id, "device no longer active, switching off");
            self.release(device_id).await;
        }

        let mut changed = 0;
        for device in devices {
            if self
                .open
                .get(&device.device_id)
                .is_some_and(|o| !o.wired_for(&device))
            {
                info!(
                    device_id = device.device_id,
                    device = %device.device_name,
                    gpio = device.gpio,
                    "device rewired, releasing old output"
                );
                self.release(device.device_id).await;
            }

            let desired = match device.control_mode {
                ControlMode::Manual => device.relay_status,
                ControlMode::Schedule => {
                    self.schedule
                        .is_active(Target::Device(device.device_id))
                        .await
                }
            };
            if self.applied.get(&device.device_id) == Some(&desired) {
                continue;
            }

            match self.drive(&device, desired).await {
                Ok(()) => {
                    info!(
                        device_id = device.device_id,
                        device = %device.device_name,
                        mode = ?device.control_mode,
                        on = desired,
                        "device switched"
                    );
                    self.applied.insert(device.device_id, desired);
                    changed += 1;
                }
                Err(e) => warn!(
                    device_id = device.device_id,
                    device = %device.device_name,
                    "failed to switch device, retrying next poll: {e:#}"
                ),
            }
        }
        changed
    }

    async fn output_for(&mut self, device: &Device) -> Result<SharedOutput> {
        if let Some(open) = self.open.get(&device.device_id) {
            return Ok(Arc::clone(&open.out));
        }
        let outputs = Arc::clone(&self.outputs);
        let d = device.clone();
        let out = tokio::task::spawn_blocking(move || outputs.open(&d)).await??;
        let out: SharedOutput = Arc::new(Mutex::new(out));
        self.open.insert(
            device.device_id,
            OpenOutput {
                kind: device.kind,
                gpio: device.gpio,
                out: Arc::clone(&out),
            },
        );
        Ok(out)
    }

    async fn drive(&mut self, device: &Device, on: bool) -> Result<()> {
        let out = self.output_for(device).await?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut out = out.lock().map_err(|_| anyhow!("device output lock poisoned"))?;
            out.drive(on)?;
            Ok(())
        })
        .await?
    }

    /// Switch a device's output off and forget it.
    async fn release(&mut self, device_id: i64) {
        self.applied.remove(&device_id);
        if let Some(open) = self.open.remove(&device_id) {
            switch_off(device_id, open.out).await;
        }
    }

    async fn all_off(&mut self) {
        for (device_id, open) in self.open.drain() {
            switch_off(device_id, open.out).await;
        }
        self.applied.clear();
    }
}

async fn switch_off(device_id: i64, out: SharedOutput) {
    let result = tokio::task::spawn_blocking(move || {
        let mut out = out.lock().map_err(|_| DriverError::Poisoned)?;
        out.drive(false)
    })
    .await;
    match result {
        Ok(Ok(())) => debug!(device_id, "device off"),
        Ok(Err(e)) => warn!(device_id, "failed to switch device off: {e}"),
        Err(e) => error!(device_id, "device switch-off panicked: {e}"),
    }
}
