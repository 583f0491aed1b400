//! Block tracker: the reversible window of accepted `(num, id, prev_id)`
//! triples, used to verify linkage and locate fork points.

use std::collections::VecDeque;

use crate::fork::ForkDetected;
use crate::types::BlockPosition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedBlock {
    pub num: u32,
    pub id: String,
    pub prev_id: String,
}

/// Tracks reversible blocks so that a block whose `prev_id` does not match the
/// accepted head can be traced back to its common ancestor.
pub struct BlockTracker {
    /// Oldest first.
    window: VecDeque<TrackedBlock>,
    /// Hard cap in case the node stops reporting LIB progress.
    max_len: usize,
}

impl BlockTracker {
    pub fn new(max_len: usize) -> Self {
        Self {
            window: VecDeque::new(),
            max_len: max_len.max(1),
        }
    }

    /// Accept the next block, or report a fork.
    ///
    /// On a fork the tracker is rewound to the common ancestor and the new
    /// block is accepted on top of it, so the rest of the new branch links
    /// normally.
    pub fn push(&mut self, num: u32, id: &str, prev_id: &str) -> Result<(), ForkDetected> {
        let block = TrackedBlock {
            num,
            id: id.to_string(),
            prev_id: prev_id.to_string(),
        };
        let Some(head) = self.window.back() else {
            self.window.push_back(block);
            return Ok(());
        };

        if num == head.num + 1 && prev_id == head.id {
            self.append(block);
            return Ok(());
        }
        if num > head.num + 1 {
            // A gap starts a new segment; there is nothing to link against.
            self.window.clear();
            self.window.push_back(block);
            return Ok(());
        }
        if self.get(num).map_or(false, |b| b.id == id) {
            // The node is re-sending a block we already accepted.
            self.rewind_to(num);
            return Ok(());
        }

        let previous_head = head.num;
        let common_ancestor = self
            .window
            .iter()
            .rev()
            .find(|b| b.id == prev_id && b.num < num)
            .map(|b| b.num)
            .unwrap_or_else(|| num.saturating_sub(1));
        let fork = ForkDetected {
            block_num: num,
            block_id: id.to_string(),
            common_ancestor,
            previous_head,
        };
        self.rewind_to(common_ancestor);
        self.append(block);
        Err(fork)
    }

    fn append(&mut self, block: TrackedBlock) {
        if self.window.len() >= self.max_len {
            self.window.pop_front();
        }
        self.window.push_back(block);
    }

    pub fn head(&self) -> Option<&TrackedBlock> {
        self.window.back()
    }

    pub fn get(&self, num: u32) -> Option<&TrackedBlock> {
        let first = self.window.front()?.num;
        let idx = num.checked_sub(first)? as usize;
        self.window.get(idx).filter(|b| b.num == num)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Discard everything after `num`.
    pub fn rewind_to(&mut self, num: u32) {
        while self.window.back().map_or(false, |b| b.num > num) {
            self.window.pop_back();
        }
    }

    /// Drop blocks below the last irreversible block. The LIB itself is kept
    /// as the anchor for the first reversible block.
    pub fn prune_below(&mut self, lib: u32) {
        while self.window.len() > 1 && self.window.front().map_or(false, |b| b.num < lib) {
            self.window.pop_front();
        }
    }

    /// Positions of every tracked block, oldest first.
    pub fn positions(&self) -> Vec<BlockPosition> {
        self.window
            .iter()
            .map(|b| BlockPosition::new(b.num, b.id.clone()))
            .collect()
    }
}
