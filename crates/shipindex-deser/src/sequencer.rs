//! Per-lane turn keeping for ABI updates.
//!
//! Deserializer workers decode blocks concurrently, but `setabi` actions must
//! reach the resolver in block order: a block may only apply its ABI updates
//! once every earlier block of the same reader lane has applied theirs.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Lanes {
    /// Next sequence allowed to apply, per lane.
    next: HashMap<u32, u64>,
    retired: HashSet<u32>,
}

#[derive(Debug, Default)]
pub struct AbiSequencer {
    lanes: Mutex<Lanes>,
    notify: Notify,
}

impl AbiSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `sequence` is next on `lane`. Returns `false` if the lane was
    /// retired, in which case the block must be dropped.
    pub async fn wait_turn(&self, lane: u32, sequence: u64) -> bool {
        loop {
            let notified = self.notify.notified();
            {
                let lanes = self.lanes.lock();
                if lanes.retired.contains(&lane) {
                    return false;
                }
                if lanes.next.get(&lane).copied().unwrap_or(0) >= sequence {
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Hand the turn to `sequence + 1`. Must be called for every sequence,
    /// including blocks that failed to decode.
    pub fn finish(&self, lane: u32, sequence: u64) {
        {
            let mut lanes = self.lanes.lock();
            let next = lanes.next.entry(lane).or_insert(0);
            *next = (*next).max(sequence + 1);
        }
        self.notify.notify_waiters();
    }

    /// Next sequence allowed on `lane`.
    pub fn next(&self, lane: u32) -> u64 {
        self.lanes.lock().next.get(&lane).copied().unwrap_or(0)
    }

    /// Wake every waiter of `lane` with `false` and forget it.
    pub fn retire(&self, lane: u32) {
        {
            let mut lanes = self.lanes.lock();
            lanes.next.remove(&lane);
            lanes.retired.insert(lane);
        }
        self.notify.notify_waiters();
    }
}
