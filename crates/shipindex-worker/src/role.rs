//! Worker roles and their lifecycle.
//!
//! ```text
//! spawning ─► backfilling ─► draining ─► retired
//!     │            │                        ▲
//!     └─────► live ┴────────────────────────┘
//! ```
//!
//! Any state may move straight to `retired` when a worker fails too often.

use std::fmt;

use serde::{Deserialize, Serialize};
use shipindex_core::IndexerError;

use crate::planner::{BlockRange, Pass, RangeAssignment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Owns one stream connection for an assigned range.
    Reader,
    Deserializer,
    Indexer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Backfilling,
    Live,
    Draining,
    Retired,
}

impl WorkerState {
    pub fn can_become(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Spawning, Backfilling)
                | (Spawning, Live)
                | (Backfilling, Live)
                | (Backfilling, Draining)
                | (Live, Draining)
                | (Draining, Retired)
                | (_, Retired)
        ) && self != Retired
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Backfilling => "backfilling",
            Self::Live => "live",
            Self::Draining => "draining",
            Self::Retired => "retired",
        };
        f.write_str(s)
    }
}

/// One reader's bookkeeping in the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDef {
    pub id: u32,
    pub role: WorkerRole,
    pub pass: Pass,
    pub range: BlockRange,
    /// Lowest block the reader streams, whatever its own checkpoint says.
    pub resume_from: u32,
    pub state: WorkerState,
    /// Failures since this worker was spawned.
    pub failures: u32,
    /// Workers retired before this one on the same range.
    pub generation: u32,
    pub last_processed_block: Option<u32>,
}

impl WorkerDef {
    pub fn reader(id: u32, range: BlockRange) -> Self {
        Self {
            id,
            role: WorkerRole::Reader,
            pass: Pass::Index,
            range,
            resume_from: range.start,
            state: WorkerState::Spawning,
            failures: 0,
            generation: 0,
            last_processed_block: None,
        }
    }

    /// A reader for a planned range of `pass`.
    pub fn assigned(id: u32, pass: Pass, assignment: &RangeAssignment) -> Self {
        Self {
            pass,
            resume_from: assignment.resume_from,
            ..Self::reader(id, assignment.range)
        }
    }

    /// Checkpoint key; stable across replacements of the same range.
    pub fn key(&self) -> String {
        self.range.key(self.pass)
    }

    pub fn transition(&mut self, next: WorkerState) -> Result<(), IndexerError> {
        if !self.state.can_become(next) {
            return Err(IndexerError::Other(format!(
                "worker {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Count a failure. Returns `true` once the worker has reached
    /// `threshold` and is retired.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.failures += 1;
        if self.failures >= threshold.max(1) {
            self.state = WorkerState::Retired;
            true
        } else {
            false
        }
    }

    /// Respawn after a failure below the threshold.
    pub fn restart(&mut self) -> Result<(), IndexerError> {
        if self.state == WorkerState::Retired {
            return Err(IndexerError::Other(format!("worker {} is retired", self.id)));
        }
        self.state = WorkerState::Spawning;
        Ok(())
    }

    /// A fresh worker taking over this one's range.
    pub fn replacement(&self, id: u32) -> Self {
        Self {
            id,
            role: self.role,
            pass: self.pass,
            range: self.range,
            resume_from: self.resume_from,
            state: WorkerState::Spawning,
            failures: 0,
            generation: self.generation + 1,
            last_processed_block: self.last_processed_block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut w = WorkerDef::reader(1, BlockRange::new(1, 100));
        assert!(w.transition(WorkerState::Draining).is_err());
        w.transition(WorkerState::Backfilling).unwrap();
        w.transition(WorkerState::Draining).unwrap();
        w.transition(WorkerState::Retired).unwrap();
        assert!(w.transition(WorkerState::Live).is_err());
        assert!(w.transition(WorkerState::Retired).is_err());
    }

    #[test]
    fn retired_after_threshold() {
        let mut w = WorkerDef::reader(1, BlockRange::new(1, 100));
        w.transition(WorkerState::Backfilling).unwrap();
        assert!(!w.record_failure(3));
        w.restart().unwrap();
        assert_eq!(w.state, WorkerState::Spawning);
        assert!(!w.record_failure(3));
        assert!(w.record_failure(3));
        assert_eq!(w.state, WorkerState::Retired);
        assert!(w.restart().is_err());

        let next = w.replacement(2);
        assert_eq!(next.range, w.range);
        assert_eq!(next.generation, 1);
        assert_eq!(next.failures, 0);
        assert_eq!(next.key(), w.key());
    }

    #[test]
    fn assigned_reader_keeps_pass_and_resume_point() {
        let assignment = RangeAssignment { range: BlockRange::new(1, 100), resume_from: 40 };
        let w = WorkerDef::assigned(3, Pass::AbiScan, &assignment);
        assert_eq!(w.key(), "abi-scan:1-100");
        assert_eq!(w.resume_from, 40);

        let next = w.replacement(4);
        assert_eq!(next.pass, Pass::AbiScan);
        assert_eq!(next.resume_from, 40);
    }
}
