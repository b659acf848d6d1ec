mod config;
mod cycles;
mod db;
mod devices;
mod fleet;
mod logging;
mod retry;
mod schedule;
mod shutdown;
mod sink;
mod store;
mod supervisor;
mod worker;

use anyhow::Result;
use std::{env, path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use config::Config;
use cycles::CycleSource;
use db::Db;
use devices::{DeviceMonitor, GpioOutputs};
use fleet::Fleet;
use schedule::ScheduleEvaluator;
use sink::ReadingSink;
use store::Store;
use supervisor::{DriverFactory, Services};

fn main() -> Result<()> {
    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").ok();
    let path = config_path.as_deref().unwrap_or("config.toml");
    let (mut cfg, from_file) = if config_path.is_some() || Path::new(path).exists() {
        (config::load(path)?, true)
    } else {
        (Config::default(), false)
    };
    if let Ok(url) = env::var("DB_URL") {
        cfg.database.url = url;
    }

    // Driver calls stranded on the blocking pool get one join timeout after
    // the fleet has stopped; then the process exits regardless.
    let teardown = cfg.fleet_join_timeout();
    shutdown::block_on_with_grace(teardown, run(cfg, path.to_string(), from_file))?
}

async fn run(cfg: Config, path: String, from_file: bool) -> Result<()> {
    logging::init(&cfg.logging)?;
    if from_file {
        info!(config = %path, "aquaponics controller starting");
    } else {
        warn!("no {path} found, starting with built-in defaults");
    }

    // ── Database ────────────────────────────────────────────────────
    // Failing to reach the store after every retry is fatal.
    let db = Db::connect_with_retry(
        &cfg.database.url,
        cfg.database.max_connections,
        &cfg.database.connect_retry,
    )
    .await?
    .with_write_retry(cfg.store);
    db.migrate().await?;
    config::apply(&cfg, &db).await?;
    let store: Arc<dyn Store> = Arc::new(db.clone());

    // ── Shutdown signal ─────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let signals = shutdown::cancel_on_signal(shutdown.clone());

    // ── Shared services ─────────────────────────────────────────────
    let sink = Arc::new(ReadingSink::new(Arc::clone(&store), &cfg.queue.path));
    // Readings queued by a previous run go in before new ones.
    match sink.queue().len().await {
        Ok(0) => {}
        Ok(queued) => info!(queued, "offline queue left by a previous run"),
        Err(e) => warn!(queue = %sink.queue().path().display(), "offline queue unreadable: {e:#}"),
    }
    if let Err(e) = sink.drain().await {
        warn!("offline queue not drained at startup: {e:#}");
    }
    let evaluator = ScheduleEvaluator::new(Arc::clone(&store), cfg.utc_offset()?);
    let services = Services {
        sink,
        cycles: CycleSource::new(Arc::clone(&store), &cfg.fallback.path),
        schedule: evaluator.clone(),
        drivers: Arc::new(DriverFactory::new(cfg.hardware.clone())),
    };

    // ── Device/relay monitor ────────────────────────────────────────
    let monitor = DeviceMonitor::new(
        Arc::clone(&store),
        evaluator,
        Arc::new(GpioOutputs::new(
            cfg.hardware.relay_active_low,
            cfg.feeder_hold(),
        )),
        cfg.device_poll_interval(),
        shutdown.clone(),
    );
    let mut monitor = tokio::spawn(monitor.run().instrument(info_span!("devices")));

    // ── Sensor fleet (runs until shutdown) ──────────────────────────
    let fleet = Fleet::new(
        Arc::clone(&store),
        &cfg.fallback.path,
        services,
        cfg.supervisor_settings(),
        cfg.fleet_join_timeout(),
        shutdown.clone(),
    );
    fleet.run().await;

    match tokio::time::timeout(cfg.fleet_join_timeout(), &mut monitor).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("device monitor failed: {e}"),
        Err(_) => {
            warn!("device monitor did not stop in time, aborting");
            monitor.abort();
        }
    }
    signals.abort();

    drop(store);
    db.close().await;
    info!("shutdown complete");
    Ok(())
}
