//! OS signal handling and runtime teardown.
//!
//! On Unix any of SIGINT, SIGTERM or SIGQUIT triggers shutdown; elsewhere
//! only Ctrl-C does.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigquit.recv() => info!("SIGQUIT received"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    Ok(())
}

/// Cancel `token` on the first termination signal. If the listeners cannot
/// be installed the token is cancelled at once.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = wait_for_signal() => {
                if let Err(e) = res {
                    error!("failed to listen for shutdown signals: {e}");
                }
                info!("shutdown requested");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

/// Run `fut` to completion on a fresh multi-threaded runtime, then give
/// blocking work still in flight at most `grace` before the runtime is torn
/// down. A driver call left behind by an aborted worker keeps its thread
/// but no longer keeps the process alive.
pub fn block_on_with_grace<F: Future>(grace: Duration, fut: F) -> std::io::Result<F::Output> {
    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let out = rt.block_on(fut);
    rt.shutdown_timeout(grace);
    Ok(out)
}
