//! Worker status
//!
//! Lock-free state and counters a worker updates as it runs and the pool
//! reads for its periodic status log.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Position of a worker in its fetch → grade → settle loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Fetching,
    Grading,
    Acking,
    Terminating,
    /// Exited with an error or panic and is not running
    Stopped,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Fetching,
            2 => WorkerState::Grading,
            3 => WorkerState::Acking,
            4 => WorkerState::Terminating,
            _ => WorkerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Fetching => 1,
            WorkerState::Grading => 2,
            WorkerState::Acking => 3,
            WorkerState::Terminating => 4,
            WorkerState::Stopped => 5,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Fetching => "fetching",
            WorkerState::Grading => "grading",
            WorkerState::Acking => "acking",
            WorkerState::Terminating => "terminating",
            WorkerState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Shared, live status of one worker
#[derive(Debug)]
pub struct WorkerStatus {
    id: usize,
    state: AtomicU8,
    graded: AtomicU64,
    failed: AtomicU64,
    settlement_races: AtomicU64,
    reconnects: AtomicU64,
    restarts: AtomicU64,
}

impl WorkerStatus {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: AtomicU8::new(WorkerState::Idle.as_u8()),
            graded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            settlement_races: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn record_graded(&self) {
        self.graded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_settlement_race(&self) {
        self.settlement_races.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            state: self.state(),
            graded: self.graded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            settlement_races: self.settlement_races.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`WorkerStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub state: WorkerState,
    /// Messages graded successfully
    pub graded: u64,
    /// Messages whose grading failed
    pub failed: u64,
    /// Settlements rejected because the delivery was no longer outstanding
    pub settlement_races: u64,
    pub reconnects: u64,
    pub restarts: u64,
}

impl WorkerSnapshot {
    /// Messages processed, successfully or not
    pub fn processed(&self) -> u64 {
        self.graded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_atomic() {
        let status = WorkerStatus::new(3);
        assert_eq!(status.state(), WorkerState::Idle);

        for state in [
            WorkerState::Fetching,
            WorkerState::Grading,
            WorkerState::Acking,
            WorkerState::Terminating,
            WorkerState::Stopped,
        ] {
            status.set_state(state);
            assert_eq!(status.state(), state);
        }
    }

    #[test]
    fn test_snapshot_counts() {
        let status = WorkerStatus::new(1);
        status.record_graded();
        status.record_graded();
        status.record_failed();
        status.record_settlement_race();

        let snapshot = status.snapshot();
        assert_eq!(snapshot.id, 1);
        assert_eq!(snapshot.graded, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.settlement_races, 1);
        assert_eq!(snapshot.processed(), 3);
    }

    #[test]
    fn test_snapshot_serializes_state_name() {
        let status = WorkerStatus::new(0);
        status.set_state(WorkerState::Grading);
        let json = serde_json::to_value(status.snapshot()).unwrap();
        assert_eq!(json["state"], "grading");
    }
}
