//! Grading worker
//!
//! A worker owns one consumer channel and one grader and drives the loop
//! `Idle → Fetching → Grading → Acking → Idle` until shutdown is requested.
//! Fetch, grade and settle are strictly sequential within a worker, and the
//! channel's prefetch credit of one keeps at most one unsettled delivery in
//! flight per worker.

mod stats;

pub use stats::{WorkerSnapshot, WorkerState, WorkerStatus};

use agent_broker::{Broker, Consumer, ConsumerOptions, Delivery};
use agent_core::{FailurePolicy, GraderRequest, Settlement};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::grader::{Grader, preview};

/// Longest slice of a payload quoted in log lines
const BODY_PREVIEW: usize = 256;

/// Backoff used when a consumer channel has to be reopened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the worker gives up
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay following `current`, doubling up to `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// One unit of grading concurrency
pub struct Worker {
    id: usize,
    consumer_tag: String,
    broker: Arc<dyn Broker>,
    consumer: Option<Box<dyn Consumer>>,
    grader: Arc<dyn Grader>,
    failure_policy: FailurePolicy,
    reconnect: ReconnectPolicy,
    shutdown: CancellationToken,
    status: Arc<WorkerStatus>,
}

impl Worker {
    /// Creates a worker
    ///
    /// The consumer channel is opened lazily on the first fetch, so creating
    /// a worker never touches the broker.
    pub fn new(
        id: usize,
        broker: Arc<dyn Broker>,
        grader: Arc<dyn Grader>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            consumer_tag: format!("agent-worker-{}", id),
            broker,
            consumer: None,
            grader,
            failure_policy: FailurePolicy::default(),
            reconnect: ReconnectPolicy::default(),
            shutdown,
            status: Arc::new(WorkerStatus::new(id)),
        }
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Reports into an existing status, so counters survive restarts
    pub fn with_status(mut self, status: Arc<WorkerStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> Arc<WorkerStatus> {
        Arc::clone(&self.status)
    }

    /// Runs the worker loop until shutdown
    ///
    /// Shutdown is only observed between messages: a grading call in
    /// progress always completes and its delivery is settled first.
    ///
    /// # Errors
    /// Returns an error when the consumer channel cannot be reopened within
    /// the reconnect policy.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            consumer = %self.consumer_tag,
            grader = %self.grader.describe(),
            policy = %self.failure_policy,
            "worker started"
        );

        let shutdown = self.shutdown.clone();

        loop {
            self.status.set_state(WorkerState::Fetching);

            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                delivery = self.fetch() => delivery?,
            };

            self.process(delivery).await;
            self.status.set_state(WorkerState::Idle);
        }

        self.terminate().await;
        Ok(())
    }

    /// Waits for the next delivery, reopening the channel when it is lost
    async fn fetch(&mut self) -> Result<Delivery> {
        let mut attempt = 0;
        let mut delay = self.reconnect.initial_delay;

        loop {
            match self.try_fetch().await {
                Ok(Some(delivery)) => {
                    if attempt > 0 {
                        info!("consumer recovered after {} attempt(s)", attempt);
                    }
                    return Ok(delivery);
                }
                Ok(None) => warn!(consumer = %self.consumer_tag, "consumer channel closed"),
                Err(e) => warn!(consumer = %self.consumer_tag, error = %e, "failed to fetch delivery"),
            }

            self.drop_consumer().await;

            attempt += 1;
            if attempt >= self.reconnect.max_attempts {
                error!(
                    "giving up on consumer channel after {} attempts",
                    self.reconnect.max_attempts
                );
                anyhow::bail!(
                    "consumer channel could not be reopened after {} attempts",
                    self.reconnect.max_attempts
                );
            }

            warn!(
                "reopening consumer channel (attempt {}/{}) in {:?}",
                attempt, self.reconnect.max_attempts, delay
            );
            tokio::time::sleep(delay).await;
            delay = self.reconnect.next_delay(delay);
            self.status.record_reconnect();
        }
    }

    async fn try_fetch(&mut self) -> agent_broker::Result<Option<Delivery>> {
        if self.consumer.is_none() {
            let consumer = self
                .broker
                .open_consumer(ConsumerOptions::new(self.consumer_tag.clone()))
                .await?;
            debug!(consumer = %self.consumer_tag, "opened consumer channel");
            self.consumer = Some(consumer);
        }

        match self.consumer.as_mut() {
            Some(consumer) => consumer.next_delivery().await,
            None => Ok(None),
        }
    }

    async fn process(&mut self, delivery: Delivery) {
        let request = GraderRequest::new(delivery.payload(), delivery.tag());

        self.status.set_state(WorkerState::Grading);
        let started = Instant::now();
        let outcome = self.grader.grade(&request).await;
        let elapsed = started.elapsed();
        self.status.set_state(WorkerState::Acking);

        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let settlement = match outcome {
            Ok(response) => {
                self.status.record_graded();
                info!(
                    delivery_tag = delivery.tag(),
                    elapsed_ms,
                    body = %preview(&request.data_lossy(), BODY_PREVIEW),
                    result = %response.data,
                    "graded in {:?}",
                    elapsed
                );
                Settlement::Ack
            }
            Err(e) => {
                self.status.record_failed();
                let settlement = self.failure_policy.settlement(delivery.redelivered());
                error!(
                    delivery_tag = delivery.tag(),
                    elapsed_ms,
                    kind = e.kind(),
                    policy = %self.failure_policy,
                    redelivered = delivery.redelivered(),
                    error = %e,
                    "grading failed after {:?}",
                    elapsed
                );
                settlement
            }
        };

        self.settle(&delivery, settlement).await;
    }

    async fn settle(&mut self, delivery: &Delivery, settlement: Settlement) {
        let result = match settlement {
            Settlement::Ack => delivery.ack().await,
            Settlement::Reject { requeue } => delivery.reject(requeue).await,
        };

        match result {
            Ok(()) => debug!(delivery_tag = delivery.tag(), ?settlement, "settled delivery"),
            Err(e) if e.is_settlement_race() => {
                self.status.record_settlement_race();
                warn!(
                    delivery_tag = delivery.tag(),
                    error = %e,
                    "delivery no longer outstanding, continuing"
                );
            }
            Err(e) if e.is_connection_lost() => {
                // The broker redelivers the message once the channel is gone.
                warn!(
                    delivery_tag = delivery.tag(),
                    error = %e,
                    "connection lost before settling, reopening channel"
                );
                self.drop_consumer().await;
            }
            Err(e) => {
                error!(delivery_tag = delivery.tag(), error = %e, "failed to settle delivery");
                self.drop_consumer().await;
            }
        }
    }

    async fn drop_consumer(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            if let Err(e) = consumer.close().await {
                debug!(consumer = %consumer.tag(), error = %e, "error closing consumer channel");
            }
        }
    }

    async fn terminate(&mut self) {
        self.status.set_state(WorkerState::Terminating);
        self.drop_consumer().await;
        let snapshot = self.status.snapshot();
        info!(
            processed = snapshot.processed(),
            graded = snapshot.graded,
            failed = snapshot.failed,
            "worker stopped"
        );
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("consumer_tag", &self.consumer_tag)
            .field("failure_policy", &self.failure_policy)
            .field("state", &self.status.state())
            .finish()
    }
}
