//! Worker pool supervision
//!
//! The pool builds one grader per worker up front, spawns every worker as an
//! independent task sharing the broker connection, restarts workers that
//! fail, and drains them on shutdown within a grace period.

use agent_broker::Broker;
use agent_core::{ConfigurationError, FailurePolicy, GraderConfig};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::grader::{self, Grader};
use crate::worker::{ReconnectPolicy, Worker, WorkerSnapshot, WorkerState, WorkerStatus};

/// Longest wait between two restarts of the same worker
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);

/// Longest accepted period between two pool status logs
pub const MAX_STATUS_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Pool sizing and supervision parameters
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of concurrent workers
    pub workers: usize,

    /// How deliveries whose grading failed are settled
    pub failure_policy: FailurePolicy,

    /// Backoff for reopening a lost consumer channel
    pub reconnect: ReconnectPolicy,

    /// Restarts allowed per worker before it stays down
    pub max_restarts: u32,

    /// Delay before the first restart, doubled on each further restart
    pub restart_backoff: Duration,

    /// How often the pool logs a status summary
    pub status_interval: Duration,

    /// Prefix of the consumer tags reported to the broker
    pub tag_prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            failure_policy: FailurePolicy::default(),
            reconnect: ReconnectPolicy::default(),
            max_restarts: 3,
            restart_backoff: Duration::from_secs(1),
            status_interval: Duration::from_secs(30),
            tag_prefix: "agent".to_string(),
        }
    }
}

/// A pool that has not been started yet
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    settings: PoolSettings,
}

impl WorkerPool {
    pub fn new(broker: Arc<dyn Broker>, settings: PoolSettings) -> Self {
        Self { broker, settings }
    }

    /// Builds one grader per worker from `config` and starts the pool
    ///
    /// Every grader is constructed before any worker is spawned, so an
    /// invalid configuration never leaves a half-started pool behind.
    pub fn start(self, config: &GraderConfig) -> Result<RunningPool, ConfigurationError> {
        check_worker_count(self.settings.workers)?;
        check_status_interval(self.settings.status_interval)?;

        let graders = (0..self.settings.workers)
            .map(|_| grader::from_config(config))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            workers = self.settings.workers,
            grader = config.kind(),
            "built graders"
        );

        self.start_with_graders(graders)
    }

    /// Starts the pool with one prebuilt grader per worker
    pub fn start_with_graders(
        self,
        graders: Vec<Arc<dyn Grader>>,
    ) -> Result<RunningPool, ConfigurationError> {
        check_worker_count(graders.len())?;
        check_status_interval(self.settings.status_interval)?;

        let shutdown = CancellationToken::new();
        let (alive_tx, alive_rx) = watch::channel(graders.len());
        let alive_tx = Arc::new(alive_tx);

        let mut workers = Vec::with_capacity(graders.len());
        for (id, grader) in graders.into_iter().enumerate() {
            let status = Arc::new(WorkerStatus::new(id));
            let parts = WorkerParts {
                id,
                consumer_tag: format!("{}-{}", self.settings.tag_prefix, id),
                broker: Arc::clone(&self.broker),
                grader,
                failure_policy: self.settings.failure_policy,
                reconnect: self.settings.reconnect,
                shutdown: shutdown.clone(),
                status: Arc::clone(&status),
            };

            let supervisor = Supervisor {
                max_restarts: self.settings.max_restarts,
                restart_backoff: self.settings.restart_backoff,
                _alive: AliveGuard(Arc::clone(&alive_tx)),
            };

            let handle = tokio::spawn(
                supervisor
                    .supervise(parts)
                    .instrument(info_span!("worker", id)),
            );

            workers.push(WorkerHandle { status, handle });
        }

        let statuses: Vec<_> = workers.iter().map(|w| Arc::clone(&w.status)).collect();
        let reporter = tokio::spawn(report_status(
            statuses,
            self.settings.status_interval,
            shutdown.clone(),
        ));

        info!(
            workers = workers.len(),
            broker = %self.broker.describe(),
            policy = %self.settings.failure_policy,
            "worker pool started"
        );

        Ok(RunningPool {
            shutdown,
            workers,
            alive: alive_rx,
            reporter,
            started_at: Instant::now(),
        })
    }
}

fn check_worker_count(workers: usize) -> Result<(), ConfigurationError> {
    if workers == 0 {
        return Err(ConfigurationError::invalid(
            "workers",
            "at least one worker is required",
        ));
    }
    Ok(())
}

fn check_status_interval(interval: Duration) -> Result<(), ConfigurationError> {
    if interval.is_zero() || interval > MAX_STATUS_INTERVAL {
        return Err(ConfigurationError::invalid(
            "status_interval",
            format!("must be greater than 0 and at most {:?}", MAX_STATUS_INTERVAL),
        ));
    }
    Ok(())
}

/// How a supervised worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    /// Returned after observing shutdown
    Drained,
    /// Failed more often than the restart budget allows
    GaveUp,
}

/// Everything needed to (re)build one worker
struct WorkerParts {
    id: usize,
    consumer_tag: String,
    broker: Arc<dyn Broker>,
    grader: Arc<dyn Grader>,
    failure_policy: FailurePolicy,
    reconnect: ReconnectPolicy,
    shutdown: CancellationToken,
    status: Arc<WorkerStatus>,
}

impl WorkerParts {
    fn build(&self) -> Worker {
        Worker::new(
            self.id,
            Arc::clone(&self.broker),
            Arc::clone(&self.grader),
            self.shutdown.clone(),
        )
        .with_consumer_tag(self.consumer_tag.clone())
        .with_failure_policy(self.failure_policy)
        .with_reconnect(self.reconnect)
        .with_status(Arc::clone(&self.status))
    }
}

/// Decrements the live-worker count when a supervisor task ends, including
/// when it is aborted
struct AliveGuard(Arc<watch::Sender<usize>>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|alive| *alive = alive.saturating_sub(1));
    }
}

struct Supervisor {
    max_restarts: u32,
    restart_backoff: Duration,
    _alive: AliveGuard,
}

impl Supervisor {
    async fn supervise(self, parts: WorkerParts) -> WorkerExit {
        let mut restarts = 0;
        let mut backoff = self.restart_backoff;

        loop {
            let mut worker = parts.build();
            let result = AssertUnwindSafe(worker.run()).catch_unwind().await;
            // Dropping the worker returns any unsettled delivery to the queue.
            drop(worker);

            match result {
                Ok(Ok(())) => return WorkerExit::Drained,
                Ok(Err(err)) => {
                    error!(error = %format!("{:#}", err), "worker exited with error");
                }
                Err(panic_payload) => {
                    error!(panic = %panic_message(panic_payload.as_ref()), "worker panicked");
                }
            }

            if parts.shutdown.is_cancelled() {
                parts.status.set_state(WorkerState::Terminating);
                return WorkerExit::Drained;
            }

            if restarts >= self.max_restarts {
                parts.status.set_state(WorkerState::Stopped);
                error!(
                    "worker stays down after {} restart(s)",
                    self.max_restarts
                );
                return WorkerExit::GaveUp;
            }

            restarts += 1;
            parts.status.set_state(WorkerState::Stopped);
            parts.status.record_restart();
            warn!(
                "restarting worker in {:?} (restart {}/{})",
                backoff, restarts, self.max_restarts
            );

            tokio::select! {
                _ = parts.shutdown.cancelled() => {
                    parts.status.set_state(WorkerState::Terminating);
                    return WorkerExit::Drained;
                }
                _ = time::sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2).min(MAX_RESTART_BACKOFF);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Periodically logs a summary of every worker
async fn report_status(
    statuses: Vec<Arc<WorkerStatus>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let Some(first_tick) = Instant::now().checked_add(interval) else {
        shutdown.cancelled().await;
        return;
    };
    let mut ticker = time::interval_at(first_tick, interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let snapshots: Vec<_> = statuses.iter().map(|s| s.snapshot()).collect();
        let summary = PoolSummary::from_snapshots(&snapshots);
        info!(
            busy = summary.busy,
            stopped = summary.stopped,
            graded = summary.graded,
            failed = summary.failed,
            settlement_races = summary.settlement_races,
            "pool status"
        );

        for snapshot in &snapshots {
            debug!(
                worker = snapshot.id,
                state = %snapshot.state,
                graded = snapshot.graded,
                failed = snapshot.failed,
                "worker status"
            );
        }
    }
}

/// Totals over a set of worker snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSummary {
    /// Workers grading or settling a delivery
    pub busy: usize,
    /// Workers that are down
    pub stopped: usize,
    pub graded: u64,
    pub failed: u64,
    pub settlement_races: u64,
}

impl PoolSummary {
    pub fn from_snapshots(snapshots: &[WorkerSnapshot]) -> Self {
        snapshots.iter().fold(Self::default(), |mut summary, s| {
            if matches!(s.state, WorkerState::Grading | WorkerState::Acking) {
                summary.busy += 1;
            }
            if s.state == WorkerState::Stopped {
                summary.stopped += 1;
            }
            summary.graded += s.graded;
            summary.failed += s.failed;
            summary.settlement_races += s.settlement_races;
            summary
        })
    }
}

struct WorkerHandle {
    status: Arc<WorkerStatus>,
    handle: JoinHandle<WorkerExit>,
}

/// Outcome of a pool shutdown
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Workers that stopped on their own within the grace period
    pub drained: usize,
    /// Workers aborted when the grace period ran out
    pub aborted: usize,
    /// Workers that had already exhausted their restarts
    pub gave_up: usize,
    pub uptime_secs: f64,
    pub workers: Vec<WorkerSnapshot>,
}

impl ShutdownReport {
    pub fn summary(&self) -> PoolSummary {
        PoolSummary::from_snapshots(&self.workers)
    }
}

/// A started pool
pub struct RunningPool {
    shutdown: CancellationToken,
    workers: Vec<WorkerHandle>,
    alive: watch::Receiver<usize>,
    reporter: JoinHandle<()>,
    started_at: Instant,
}

impl RunningPool {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Number of supervisor tasks still running
    pub fn alive(&self) -> usize {
        *self.alive.borrow()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers.iter().map(|w| w.status.snapshot()).collect()
    }

    /// Completes once every worker has stopped for good
    pub async fn wait_all_stopped(&self) {
        let mut alive = self.alive.clone();
        // An error means every sender is gone, which also means no worker
        // is left.
        let _ = alive.wait_for(|count| *count == 0).await;
    }

    /// Stops fetching, waits up to `grace` for in-flight grading, then
    /// aborts whatever is left
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        let RunningPool {
            shutdown,
            workers,
            reporter,
            started_at,
            ..
        } = self;

        info!(?grace, "shutting down worker pool");
        shutdown.cancel();

        // A grace period too long to represent means waiting without a deadline.
        let deadline = Instant::now().checked_add(grace);
        let mut drained = 0;
        let mut aborted = 0;
        let mut gave_up = 0;
        let mut statuses = Vec::with_capacity(workers.len());

        for WorkerHandle { status, mut handle } in workers {
            let joined = match deadline {
                Some(deadline) => time::timeout_at(deadline, &mut handle).await,
                None => Ok((&mut handle).await),
            };

            match joined {
                Ok(Ok(WorkerExit::Drained)) => drained += 1,
                Ok(Ok(WorkerExit::GaveUp)) => gave_up += 1,
                Ok(Err(e)) => {
                    warn!(worker = status.id(), error = %e, "worker task ended abnormally");
                    aborted += 1;
                }
                Err(_) => {
                    warn!(
                        worker = status.id(),
                        state = %status.state(),
                        "grace period elapsed, aborting worker"
                    );
                    handle.abort();
                    status.set_state(WorkerState::Stopped);
                    aborted += 1;
                }
            }
            statuses.push(status);
        }

        reporter.abort();

        let report = ShutdownReport {
            drained,
            aborted,
            gave_up,
            uptime_secs: started_at.elapsed().as_secs_f64(),
            workers: statuses.iter().map(|s| s.snapshot()).collect(),
        };

        let summary = report.summary();
        info!(
            drained = report.drained,
            aborted = report.aborted,
            gave_up = report.gave_up,
            graded = summary.graded,
            failed = summary.failed,
            "worker pool stopped"
        );

        report
    }
}
