//! Process-wide tracing subscriber, optionally mirrored to a log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Append every line here as well as to stdout. Empty disables it.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some(PathBuf::from("sensor_logs.log")),
        }
    }
}

/// Writes each formatted line to stdout and to a shared file handle.
#[derive(Clone)]
struct TeeMakeWriter {
    file: Arc<Mutex<File>>,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: Arc::clone(&self.file),
        }
    }
}

struct TeeWriter {
    file: Arc<Mutex<File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stdout().write_all(buf)?;
        // A poisoned handle only loses the file copy.
        if let Ok(mut f) = self.file.lock() {
            f.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()?;
        if let Ok(mut f) = self.file.lock() {
            f.flush()?;
        }
        Ok(())
    }
}

fn filter(cfg: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(f) => Ok(f),
        Err(_) => EnvFilter::try_new(&cfg.level)
            .with_context(|| format!("invalid log level '{}'", cfg.level)),
    }
}

/// Install the global subscriber. Call once, first thing in `main`.
pub fn init(cfg: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(cfg)?)
        .with_target(false);

    let installed = match cfg.file.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(TeeMakeWriter {
                    file: Arc::new(Mutex::new(file)),
                })
                .try_init()
        }
        None => builder.try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}
