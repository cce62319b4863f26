//! Process lifecycle
//!
//! Runs a started pool until an interrupt arrives or every worker is down,
//! then drains it.

use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::pool::{RunningPool, ShutdownReport};

/// Why the agent stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// An interrupt or termination signal was received
    Signal,
    /// Every worker exhausted its restarts
    WorkersDown,
}

impl ExitReason {
    /// Process exit code for this reason
    pub fn exit_code(self) -> i32 {
        match self {
            ExitReason::Signal => 0,
            ExitReason::WorkersDown => 1,
        }
    }
}

/// Completes on Ctrl-C, or on SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

/// Runs `pool` until `signal` completes or all workers are down, then shuts
/// it down within `grace`
pub async fn run_until(
    pool: RunningPool,
    signal: impl Future<Output = ()>,
    grace: Duration,
) -> (ExitReason, ShutdownReport) {
    info!(workers = pool.len(), "agent running; waiting for a shutdown signal");

    let reason = tokio::select! {
        _ = signal => {
            info!("shutdown requested");
            ExitReason::Signal
        }
        _ = pool.wait_all_stopped() => {
            error!("all workers are down");
            ExitReason::WorkersDown
        }
    };

    let report = pool.shutdown(grace).await;
    if report.aborted > 0 {
        warn!(
            aborted = report.aborted,
            "some workers did not finish within {:?}",
            grace
        );
    }

    (reason, report)
}
