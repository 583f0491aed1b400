//! Completion ledger: tracks which blocks of each reader lane are fully
//! indexed.
//!
//! A block is registered when its reader forwards it, learns how many
//! documents it produced once deserialized, and completes when the last of
//! those documents is written. The lane watermark is the highest block whose
//! predecessors in the lane are all complete; it is what gets checkpointed.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
struct Pending {
    block_num: u32,
    /// `None` until the deserializer reports how many documents to expect.
    expected: Option<usize>,
    written: usize,
}

impl Pending {
    fn done(&self) -> bool {
        self.expected.map_or(false, |n| self.written >= n)
    }
}

#[derive(Debug, Default)]
struct Lane {
    pending: BTreeMap<u64, Pending>,
    watermark: Option<u32>,
}

impl Lane {
    fn advance(&mut self) -> bool {
        let mut moved = false;
        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().done() {
                break;
            }
            let done = entry.remove();
            self.watermark = Some(self.watermark.map_or(done.block_num, |w| w.max(done.block_num)));
            moved = true;
        }
        moved
    }
}

#[derive(Debug, Default)]
pub struct CompletionLedger {
    lanes: Mutex<HashMap<u32, Lane>>,
    notify: Notify,
}

impl CompletionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, lane: u32, sequence: u64, block_num: u32) {
        self.lanes
            .lock()
            .entry(lane)
            .or_default()
            .pending
            .insert(sequence, Pending { block_num, expected: None, written: 0 });
    }

    /// Record how many documents a block produced.
    pub fn expect(&self, lane: u32, sequence: u64, documents: usize) {
        let moved = {
            let mut lanes = self.lanes.lock();
            let Some(state) = lanes.get_mut(&lane) else { return };
            if let Some(p) = state.pending.get_mut(&sequence) {
                p.expected = Some(documents);
            }
            state.advance()
        };
        if moved {
            self.notify.notify_waiters();
        }
    }

    /// Mark `documents` of a block as written (or dead-lettered).
    pub fn complete(&self, lane: u32, sequence: u64, documents: usize) {
        let moved = {
            let mut lanes = self.lanes.lock();
            let Some(state) = lanes.get_mut(&lane) else { return };
            if let Some(p) = state.pending.get_mut(&sequence) {
                p.written += documents;
            }
            state.advance()
        };
        if moved {
            self.notify.notify_waiters();
        }
    }

    /// Highest fully indexed block of the lane.
    pub fn watermark(&self, lane: u32) -> Option<u32> {
        self.lanes.lock().get(&lane).and_then(|l| l.watermark)
    }

    pub fn in_flight(&self, lane: u32) -> usize {
        self.lanes.lock().get(&lane).map_or(0, |l| l.pending.len())
    }

    /// Wait until nothing registered on the lane is outstanding.
    pub async fn wait_drained(&self, lane: u32) {
        loop {
            let notified = self.notify.notified();
            if self.in_flight(lane) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Forget outstanding blocks and move the watermark, after a rollback or
    /// a reader restart.
    pub fn reset(&self, lane: u32, watermark: Option<u32>) {
        {
            let mut lanes = self.lanes.lock();
            let state = lanes.entry(lane).or_default();
            state.pending.clear();
            state.watermark = watermark;
        }
        self.notify.notify_waiters();
    }

    pub fn remove_lane(&self, lane: u32) {
        self.lanes.lock().remove(&lane);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn watermark_waits_for_predecessors() {
        let ledger = CompletionLedger::new();
        for seq in 0..3 {
            ledger.register(1, seq, 100 + seq as u32);
        }
        ledger.expect(1, 1, 2);
        ledger.complete(1, 1, 2);
        assert_eq!(ledger.watermark(1), None);

        ledger.expect(1, 0, 0);
        assert_eq!(ledger.watermark(1), Some(101));
        assert_eq!(ledger.in_flight(1), 1);
    }

    #[test]
    fn writes_may_arrive_before_count() {
        let ledger = CompletionLedger::new();
        ledger.register(0, 0, 10);
        ledger.complete(0, 0, 1);
        assert_eq!(ledger.watermark(0), None);
        ledger.expect(0, 0, 3);
        ledger.complete(0, 0, 2);
        assert_eq!(ledger.watermark(0), Some(10));
    }

    #[tokio::test]
    async fn drain_wakes_waiters() {
        let ledger = Arc::new(CompletionLedger::new());
        ledger.register(2, 0, 50);
        ledger.expect(2, 0, 1);

        let waiter = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.wait_drained(2).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        ledger.complete(2, 0, 1);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(ledger.watermark(2), Some(50));
    }

    #[test]
    fn reset_moves_watermark_back() {
        let ledger = CompletionLedger::new();
        ledger.register(0, 0, 9);
        ledger.expect(0, 0, 0);
        ledger.register(0, 1, 10);
        ledger.reset(0, Some(5));
        assert_eq!(ledger.watermark(0), Some(5));
        assert_eq!(ledger.in_flight(0), 0);
    }
}
