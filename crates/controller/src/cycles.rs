//! Cycle definitions: what each sensor should currently be running.
//!
//! The store is the source of truth. When it cannot be reached the static
//! fallback file (a sensor snapshot keyed by sensor id) is used instead:
//!
//! ```json
//! {
//!   "sensors": {
//!     "3": {
//!       "map": "tank1",
//!       "active": true,
//!       "cycles": [
//!         { "cycle_id": 10, "cycle_number": 1, "interval_seconds": 5,
//!           "duration_minutes": 1, "pause_seconds": 2 }
//!       ]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::store::{CycleDef, Store};

// ---------------------------------------------------------------------------
// Fallback file
// ---------------------------------------------------------------------------

fn yes() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct FallbackFile {
    #[serde(default)]
    pub sensors: BTreeMap<i64, FallbackSensor>,
}

#[derive(Debug, Deserialize)]
pub struct FallbackSensor {
    pub map: String,
    #[serde(default = "yes")]
    pub active: bool,
    #[serde(default)]
    pub cycles: Vec<FallbackCycle>,
}

#[derive(Debug, Deserialize)]
pub struct FallbackCycle {
    pub cycle_id: i64,
    pub cycle_number: i64,
    pub interval_seconds: i64,
    pub duration_minutes: i64,
    #[serde(default)]
    pub pause_seconds: i64,
    #[serde(default = "yes")]
    pub active: bool,
}

impl FallbackFile {
    /// `Ok(None)` when the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let file = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse fallback file {}", path.display()))?;
        Ok(Some(file))
    }

    /// Active sensors and their map names.
    pub fn active_sensors(&self) -> Vec<(i64, String)> {
        self.sensors
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(id, s)| (*id, s.map.clone()))
            .collect()
    }

    pub fn active_cycles(&self, sensor_id: i64) -> Vec<CycleDef> {
        let Some(sensor) = self.sensors.get(&sensor_id).filter(|s| s.active) else {
            return Vec::new();
        };
        let mut out: Vec<CycleDef> = sensor
            .cycles
            .iter()
            .filter(|c| c.active)
            .map(|c| CycleDef {
                cycle_id: c.cycle_id,
                sensor_id,
                cycle_number: c.cycle_number,
                interval_seconds: c.interval_seconds,
                duration_minutes: c.duration_minutes,
                pause_seconds: c.pause_seconds,
            })
            .collect();
        out.sort_by_key(|c| c.cycle_id);
        out
    }
}

// ---------------------------------------------------------------------------
// Cycle source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Store,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleListing {
    pub cycles: Vec<CycleDef>,
    pub origin: Origin,
}

#[derive(Clone)]
pub struct CycleSource {
    store: Arc<dyn Store>,
    fallback_path: PathBuf,
}

impl CycleSource {
    pub fn new(store: Arc<dyn Store>, fallback_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            fallback_path: fallback_path.into(),
        }
    }

    /// Active, well-formed cycles for a sensor, ordered by cycle id. Never
    /// fails: a store error falls back to the static file, and a missing or
    /// unreadable file yields an empty listing.
    pub async fn list_active(&self, sensor_id: i64) -> CycleListing {
        let (cycles, origin) = match self.store.active_cycles(sensor_id).await {
            Ok(cycles) => (cycles, Origin::Store),
            Err(e) => {
                warn!(sensor_id, "cycle lookup failed, using fallback file: {e:#}");
                (self.fallback_cycles(sensor_id).await, Origin::Fallback)
            }
        };

        let cycles = cycles
            .into_iter()
            .filter(|c| {
                let ok = c.is_valid();
                if !ok {
                    warn!(
                        sensor_id,
                        cycle_id = c.cycle_id,
                        interval_seconds = c.interval_seconds,
                        duration_minutes = c.duration_minutes,
                        pause_seconds = c.pause_seconds,
                        "ignoring malformed cycle"
                    );
                }
                ok
            })
            .collect();

        CycleListing { cycles, origin }
    }

    async fn fallback_cycles(&self, sensor_id: i64) -> Vec<CycleDef> {
        match FallbackFile::load(&self.fallback_path).await {
            Ok(Some(file)) => file.active_cycles(sensor_id),
            Ok(None) => {
                debug!(path = %self.fallback_path.display(), "no fallback file");
                Vec::new()
            }
            Err(e) => {
                warn!("{e:#}");
                Vec::new()
            }
        }
    }

    /// Turn every dormant cycle of the sensor back on. Returns how many
    /// were activated; store errors are logged and count as zero.
    pub async fn activate_dormant(&self, sensor_id: i64) -> u64 {
        match self.store.activate_dormant_cycles(sensor_id).await {
            Ok(n) => {
                if n > 0 {
                    info!(sensor_id, activated = n, "schedule window open, dormant cycles activated");
                }
                n
            }
            Err(e) => {
                warn!(sensor_id, "failed to activate dormant cycles: {e:#}");
                0
            }
        }
    }

    pub async fn mark_inactive(&self, cycle_id: i64) {
        match self.store.deactivate_cycle(cycle_id).await {
            Ok(()) => debug!(cycle_id, "cycle marked inactive"),
            Err(e) => warn!(cycle_id, "failed to mark cycle inactive: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    const FALLBACK: &str = r#"{
      "sensors": {
        "3": {
          "map": "tank1",
          "cycles": [
            { "cycle_id": 21, "cycle_number": 2, "interval_seconds": 10, "duration_minutes": 2 },
            { "cycle_id": 20, "cycle_number": 1, "interval_seconds": 5, "duration_minutes": 1, "pause_seconds": 2 },
            { "cycle_id": 22, "cycle_number": 3, "interval_seconds": 5, "duration_minutes": 1, "active": false }
          ]
        },
        "4": { "map": "ph", "active": false, "cycles": [
            { "cycle_id": 30, "cycle_number": 1, "interval_seconds": 5, "duration_minutes": 1 }
        ] }
      }
    }"#;

    fn def(cycle_id: i64, sensor_id: i64, interval_seconds: i64) -> CycleDef {
        CycleDef {
            cycle_id,
            sensor_id,
            cycle_number: 1,
            interval_seconds,
            duration_minutes: 1,
            pause_seconds: 0,
        }
    }

    fn source_with_fallback(store: Arc<MemoryStore>, json: Option<&str>) -> (tempfile::TempDir, CycleSource) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensors.json");
        if let Some(json) = json {
            std::fs::write(&path, json).unwrap();
        }
        (dir, CycleSource::new(store, path))
    }

    #[tokio::test]
    async fn store_listing_is_authoritative() {
        let store = Arc::new(MemoryStore::new());
        store.add_cycle(def(2, 3, 5), true);
        store.add_cycle(def(1, 3, 5), true);
        store.add_cycle(def(5, 4, 5), true);
        let (_dir, src) = source_with_fallback(store, Some(FALLBACK));

        let listing = src.list_active(3).await;
        assert_eq!(listing.origin, Origin::Store);
        let ids: Vec<i64> = listing.cycles.iter().map(|c| c.cycle_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn store_outage_uses_fallback_file() {
        let store = Arc::new(MemoryStore::new());
        store.set_down(true);
        let (_dir, src) = source_with_fallback(store, Some(FALLBACK));

        let listing = src.list_active(3).await;
        assert_eq!(listing.origin, Origin::Fallback);
        let ids: Vec<i64> = listing.cycles.iter().map(|c| c.cycle_id).collect();
        assert_eq!(ids, vec![20, 21]);
        assert_eq!(listing.cycles[0].pause_seconds, 2);
        assert_eq!(listing.cycles[1].pause_seconds, 0);

        // Inactive sensor in the snapshot.
        assert!(src.list_active(4).await.cycles.is_empty());
    }

    #[tokio::test]
    async fn missing_or_broken_fallback_is_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set_down(true);
        let (_dir, src) = source_with_fallback(store.clone(), None);
        assert!(src.list_active(3).await.cycles.is_empty());

        let (_dir, src) = source_with_fallback(store, Some("[1, 2"));
        assert!(src.list_active(3).await.cycles.is_empty());
    }

    #[tokio::test]
    async fn malformed_cycles_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.add_cycle(def(1, 3, 0), true);
        store.add_cycle(def(2, 3, 5), true);
        let (_dir, src) = source_with_fallback(store, None);

        let ids: Vec<i64> = src.list_active(3).await.cycles.iter().map(|c| c.cycle_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn activation_and_deactivation_tolerate_outage() {
        let store = Arc::new(MemoryStore::new());
        store.add_cycle(def(1, 3, 5), false);
        let (_dir, src) = source_with_fallback(store.clone(), None);

        assert_eq!(src.activate_dormant(3).await, 1);
        assert!(store.cycle_active(1));

        src.mark_inactive(1).await;
        assert!(!store.cycle_active(1));

        store.set_down(true);
        assert_eq!(src.activate_dormant(3).await, 0);
        src.mark_inactive(1).await;
    }

    #[test]
    fn example_fallback_file_parses() {
        let file: FallbackFile = serde_json::from_str(include_str!("../sensors.example.json")).unwrap();
        assert_eq!(
            file.active_sensors(),
            vec![(1, "ultrasonic".to_string()), (3, "tank1".to_string())]
        );
        assert_eq!(file.active_cycles(3)[0].pause_seconds, 2);
        assert!(file.active_cycles(4).is_empty());
    }

    #[test]
    fn fallback_sensors_lists_active_only() {
        let file: FallbackFile = serde_json::from_str(FALLBACK).unwrap();
        assert_eq!(file.active_sensors(), vec![(3, "tank1".to_string())]);
    }
}
