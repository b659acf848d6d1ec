//! Durable reading sink.
//!
//! Every reading goes to the primary store first. When the store write
//! fails the reading is appended to a local JSON queue file instead, and
//! the next successful write replays the queue in append order
//! (at-least-once). The queue file is only ever replaced whole via
//! write-to-temp + rename, so a crash never leaves it half-written.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::store::{Reading, Store};

/// What happened to one recorded reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Stored,
    Queued,
    /// Neither the store nor the queue file accepted it.
    Dropped,
}

// ---------------------------------------------------------------------------
// Offline queue file
// ---------------------------------------------------------------------------

pub struct OfflineQueue {
    path: PathBuf,
    // Held across the whole read-modify-write of an append and across a
    // whole drain pass.
    lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn exists(&self) -> Result<bool> {
        tokio::fs::try_exists(&self.path)
            .await
            .with_context(|| format!("failed to stat {}", self.path.display()))
    }

    /// All queued entries, empty when the file is absent.
    async fn read_entries(&self) -> Result<Vec<Reading>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes)
            .with_context(|| format!("queue file {} is not a JSON reading list", self.path.display()))
    }

    async fn write_entries(&self, entries: &[Reading]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries).context("failed to encode queue")?;
        let tmp = self.temp_path();

        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        f.write_all(&json).await.context("failed to write queue")?;
        f.sync_all().await.context("failed to sync queue")?;
        drop(f);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Move an unreadable queue file out of the way so new readings can
    /// still be queued. The old file is kept for manual recovery.
    async fn quarantine(&self) -> Result<PathBuf> {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".corrupt-{}", OffsetDateTime::now_utc().unix_timestamp()));
        let aside = self.path.with_file_name(name);
        tokio::fs::rename(&self.path, &aside)
            .await
            .with_context(|| format!("failed to move aside {}", self.path.display()))?;
        Ok(aside)
    }

    /// Queued entries, or none after an unreadable file was moved aside.
    async fn read_or_quarantine(&self) -> Result<Vec<Reading>> {
        match self.read_entries().await {
            Ok(entries) => Ok(entries),
            Err(e) => {
                let aside = self.quarantine().await?;
                error!(moved_to = %aside.display(), "offline queue unreadable, starting a new one: {e:#}");
                Ok(Vec::new())
            }
        }
    }

    /// Append one reading. Returns the queue length afterwards.
    pub async fn append(&self, reading: &Reading) -> Result<usize> {
        let _guard = self.lock.lock().await;

        let mut entries = self.read_or_quarantine().await?;
        entries.push(reading.clone());
        self.write_entries(&entries).await?;
        Ok(entries.len())
    }

    pub async fn len(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.read_entries().await?.len())
    }

    /// Replay every entry into `store` in order, then delete the file. The
    /// first failed insert aborts the pass and leaves the file as it was.
    /// An unreadable file is moved aside. Returns how many entries were
    /// migrated.
    pub async fn drain(&self, store: &dyn Store) -> Result<usize> {
        let _guard = self.lock.lock().await;

        if !self.exists().await? {
            return Ok(0);
        }
        let entries = self.read_or_quarantine().await?;
        for (i, reading) in entries.iter().enumerate() {
            store.insert_reading(reading).await.with_context(|| {
                format!("drain aborted at entry {} of {}", i + 1, entries.len())
            })?;
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
        Ok(entries.len())
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub struct ReadingSink {
    store: Arc<dyn Store>,
    queue: OfflineQueue,
}

impl ReadingSink {
    pub fn new(store: Arc<dyn Store>, queue_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            queue: OfflineQueue::new(queue_path),
        }
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Record a reading taken now. Never fails; the outcome is logged and
    /// returned for callers that care.
    pub async fn record(&self, sensor_id: i64, value: f64) -> Delivery {
        self.record_reading(Reading::now(sensor_id, value)).await
    }

    pub async fn record_reading(&self, reading: Reading) -> Delivery {
        match self.store.insert_reading(&reading).await {
            Ok(()) => {
                debug!(sensor_id = reading.sensor_id, value = reading.value, "reading stored");
                if let Err(e) = self.drain().await {
                    warn!("offline queue drain failed, will retry on next write: {e:#}");
                }
                Delivery::Stored
            }
            Err(store_err) => match self.queue.append(&reading).await {
                Ok(queued) => {
                    warn!(
                        sensor_id = reading.sensor_id,
                        value = reading.value,
                        queued,
                        "store write failed, reading queued offline: {store_err:#}"
                    );
                    Delivery::Queued
                }
                Err(queue_err) => {
                    error!(
                        sensor_id = reading.sensor_id,
                        value = reading.value,
                        "reading lost: store failed ({store_err:#}) and queue failed ({queue_err:#})"
                    );
                    Delivery::Dropped
                }
            },
        }
    }

    /// Migrate queued readings into the store. A no-op when nothing is
    /// queued.
    pub async fn drain(&self) -> Result<usize> {
        let migrated = self.queue.drain(self.store.as_ref()).await?;
        if migrated > 0 {
            info!(migrated, "offline queue drained into store");
        }
        Ok(migrated)
    }
}
