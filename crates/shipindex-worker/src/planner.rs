//! Range planning for parallel backfill.
//!
//! The backfill interval is cut into contiguous, disjoint ranges of
//! `batch_size` blocks. Every range gets its own checkpoint key, so a restart
//! skips finished ranges and resumes unfinished ones where they stopped.
//! Keys carry their range boundaries: checkpoints written under another
//! `batch_size` still count as finished work.
//!
//! When several readers would run at once, an ABI scan pass over the same
//! interval runs first, so every contract ABI below the last irreversible
//! block is known before any record is decoded.

use std::fmt;

use serde::{Deserialize, Serialize};
use shipindex_core::{Checkpoint, IndexerConfig};

/// Which sweep over the chain a reader belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    /// Only `setabi` actions are decoded.
    AbiScan,
    Index,
}

impl Pass {
    pub fn key_prefix(self) -> &'static str {
        match self {
            Self::AbiScan => "abi-scan",
            Self::Index => "reader",
        }
    }
}

/// `[start, end)`. `end == u32::MAX` is the open range of the live reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u32,
    pub end: u32,
}

impl BlockRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn open(start: u32) -> Self {
        Self { start, end: u32::MAX }
    }

    pub fn is_open(&self) -> bool {
        self.end == u32::MAX
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn last(&self) -> Option<u32> {
        (!self.is_empty() && !self.is_open()).then(|| self.end - 1)
    }

    /// Checkpoint key of the index reader owning this range.
    pub fn worker_key(&self) -> String {
        self.key(Pass::Index)
    }

    pub fn key(&self, pass: Pass) -> String {
        let prefix = pass.key_prefix();
        if self.is_open() {
            format!("{prefix}:live")
        } else {
            format!("{prefix}:{}-{}", self.start, self.end)
        }
    }

    /// The bounded range a `pass` checkpoint key was written for.
    pub fn from_key(pass: Pass, key: &str) -> Option<Self> {
        let bounds = key.strip_prefix(pass.key_prefix())?.strip_prefix(':')?;
        let (start, end) = bounds.split_once('-')?;
        let range = Self::new(start.parse().ok()?, end.parse().ok()?);
        (!range.is_empty() && !range.is_open()).then_some(range)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            write!(f, "[{}, head)", self.start)
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

/// A range and the first block its reader still has to stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeAssignment {
    pub range: BlockRange,
    pub resume_from: u32,
}

impl RangeAssignment {
    /// The value to publish as "last indexed block" before streaming starts.
    pub fn checkpoint(&self) -> u32 {
        self.resume_from.saturating_sub(1)
    }

    pub fn remaining(&self) -> u32 {
        self.range.end.saturating_sub(self.resume_from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlanner {
    batch_size: u32,
}

impl RangePlanner {
    pub fn new(batch_size: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Contiguous ranges covering `[start, end)`.
    pub fn split(&self, start: u32, end: u32) -> Vec<BlockRange> {
        let mut ranges = vec![];
        let mut from = start;
        while from < end {
            let to = from.saturating_add(self.batch_size).min(end);
            ranges.push(BlockRange::new(from, to));
            from = to;
        }
        ranges
    }

    /// Ranges of `[start, end)` that still need index work, given the saved
    /// checkpoints of a previous run. Finished ranges are left out.
    pub fn plan(&self, start: u32, end: u32, checkpoints: &[Checkpoint]) -> Vec<RangeAssignment> {
        self.plan_pass(Pass::Index, start, end, checkpoints)
    }

    /// Like [`RangePlanner::plan`] for any pass. A range resumes at its first
    /// block not covered by a saved checkpoint of the same pass, whatever
    /// range that checkpoint was written for.
    pub fn plan_pass(&self, pass: Pass, start: u32, end: u32, checkpoints: &[Checkpoint]) -> Vec<RangeAssignment> {
        let done = finished(pass, checkpoints);
        self.split(start, end)
            .into_iter()
            .filter_map(|range| {
                let mut resume_from = range.start;
                for &(from, to) in &done {
                    if from <= resume_from && resume_from < to {
                        resume_from = to;
                    }
                }
                (resume_from < range.end).then_some(RangeAssignment { range, resume_from })
            })
            .collect()
    }
}

/// Finished `[from, to)` intervals recorded by `pass` checkpoints, sorted
/// and merged.
fn finished(pass: Pass, checkpoints: &[Checkpoint]) -> Vec<(u32, u32)> {
    let mut done: Vec<(u32, u32)> = checkpoints
        .iter()
        .filter_map(|cp| {
            let range = BlockRange::from_key(pass, &cp.worker)?;
            let to = cp.block_number.saturating_add(1).min(range.end);
            (to > range.start).then_some((range.start, to))
        })
        .collect();
    done.sort_unstable();

    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(done.len());
    for (from, to) in done {
        match merged.last_mut() {
            Some(last) if from <= last.1 => last.1 = last.1.max(to),
            _ => merged.push((from, to)),
        }
    }
    merged
}

/// Work for one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPlan {
    /// First block of the run after resolving `start_block = 0`.
    pub start: u32,
    pub last_irreversible: u32,
    pub backfill: Vec<RangeAssignment>,
    /// ABI scan ahead of the backfill. Empty unless readers would overlap.
    #[serde(default)]
    pub abi_scan: Vec<RangeAssignment>,
    /// Range of the reader that follows the chain past the last irreversible block.
    pub live: Option<BlockRange>,
}

impl RunPlan {
    /// Build the plan for a node whose last irreversible block is
    /// `last_irreversible` and whose traces start at `first_available`.
    ///
    /// Backfill covers `[start, min(stop, lib + 1))`. The tail past the last
    /// irreversible block belongs to a single reader, open when following the
    /// chain and bounded when a stop block lies beyond it.
    pub fn build(cfg: &IndexerConfig, last_irreversible: u32, first_available: u32, checkpoints: &[Checkpoint]) -> Self {
        let start = if cfg.start_block == 0 {
            first_available.max(1)
        } else {
            cfg.start_block
        };
        let tail_start = last_irreversible.saturating_add(1);
        let backfill_end = cfg.stop_block.map_or(tail_start, |stop| stop.min(tail_start));
        let planner = RangePlanner::new(cfg.scaling.batch_size);
        let backfill = planner.plan(start, backfill_end, checkpoints);

        let wants_tail = !cfg.features.abi_scan_mode && (cfg.live || cfg.stop_block.is_some());
        let live = wants_tail
            .then(|| BlockRange::new(start.max(tail_start), cfg.stop_block.unwrap_or(u32::MAX)))
            .filter(|range| !range.is_empty());

        let overlapping = (backfill.len() > 1 && cfg.scaling.readers > 1) || (live.is_some() && !backfill.is_empty());
        let abi_scan = match backfill.first() {
            Some(first) if overlapping && cfg.features.abi_prescan && !cfg.features.abi_scan_mode => {
                planner.plan_pass(Pass::AbiScan, first.resume_from, backfill_end, checkpoints)
            }
            _ => vec![],
        };

        Self {
            start,
            last_irreversible,
            backfill,
            abi_scan,
            live,
        }
    }

    pub fn backfill_blocks(&self) -> u64 {
        self.backfill.iter().map(|a| a.remaining() as u64).sum()
    }

    pub fn abi_scan_blocks(&self) -> u64 {
        self.abi_scan.iter().map(|a| a.remaining() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(worker: &str, block_number: u32) -> Checkpoint {
        Checkpoint {
            chain_id: "eos".into(),
            worker: worker.into(),
            block_number,
            updated_at: 0,
        }
    }

    #[test]
    fn split_is_contiguous_and_disjoint() {
        let ranges = RangePlanner::new(100).split(1, 251);
        assert_eq!(
            ranges,
            vec![BlockRange::new(1, 101), BlockRange::new(101, 201), BlockRange::new(201, 251)]
        );
        assert!(RangePlanner::new(100).split(10, 10).is_empty());
    }

    #[test]
    fn plan_skips_finished_and_resumes_partial() {
        let planner = RangePlanner::new(100);
        let saved = [cp("reader:1-101", 100), cp("reader:101-201", 150), cp("reader:live", 9_000)];

        let plan = planner.plan(1, 301, &saved);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].range, BlockRange::new(101, 201));
        assert_eq!(plan[0].resume_from, 151);
        assert_eq!(plan[0].checkpoint(), 150);
        assert_eq!(plan[1].range, BlockRange::new(201, 301));
        assert_eq!(plan[1].resume_from, 201);
        assert_eq!(plan[1].remaining(), 100);
    }

    #[test]
    fn checkpoints_from_another_batch_size_still_count() {
        // A previous run used ranges of 50.
        let saved = [cp("reader:1-51", 50), cp("reader:51-101", 80), cp("reader:101-151", 150)];

        let plan = RangePlanner::new(100).plan(1, 301, &saved);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].range, BlockRange::new(1, 101));
        assert_eq!(plan[0].resume_from, 81);
        assert_eq!(plan[1].range, BlockRange::new(101, 201));
        assert_eq!(plan[1].resume_from, 151);
        assert_eq!(plan[2].resume_from, 201);

        // And the other way round: one big finished range covers two small ones.
        let saved = [cp("reader:1-201", 200)];
        let plan = RangePlanner::new(50).plan(1, 251, &saved);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].range, BlockRange::new(201, 251));
    }

    #[test]
    fn passes_keep_separate_progress() {
        let saved = [cp("abi-scan:1-101", 100), cp("reader:1-101", 20)];
        let planner = RangePlanner::new(100);
        assert!(planner.plan_pass(Pass::AbiScan, 1, 101, &saved).is_empty());
        assert_eq!(planner.plan_pass(Pass::Index, 1, 101, &saved)[0].resume_from, 21);
    }

    fn config(start_block: u32, stop_block: Option<u32>, live: bool) -> IndexerConfig {
        let mut cfg = IndexerConfig::default();
        cfg.start_block = start_block;
        cfg.stop_block = stop_block;
        cfg.live = live;
        cfg.scaling.batch_size = 100;
        cfg
    }

    #[test]
    fn run_plan_splits_at_last_irreversible() {
        let plan = RunPlan::build(&config(0, None, true), 250, 20, &[]);
        assert_eq!(plan.start, 20);
        assert_eq!(plan.backfill.first().map(|a| a.range), Some(BlockRange::new(20, 120)));
        assert_eq!(plan.backfill.last().map(|a| a.range), Some(BlockRange::new(220, 251)));
        assert_eq!(plan.backfill_blocks(), 231);
        assert_eq!(plan.live, Some(BlockRange::open(251)));

        let no_live = RunPlan::build(&config(1, None, false), 250, 1, &[]);
        assert!(no_live.live.is_none());
    }

    #[test]
    fn run_plan_respects_stop_block() {
        let below_lib = RunPlan::build(&config(1, Some(101), true), 250, 1, &[]);
        assert_eq!(below_lib.backfill.len(), 1);
        assert_eq!(below_lib.backfill[0].range, BlockRange::new(1, 101));
        assert!(below_lib.live.is_none());

        let above_lib = RunPlan::build(&config(1, Some(400), false), 250, 1, &[]);
        assert_eq!(above_lib.live, Some(BlockRange::new(251, 400)));
    }

    #[test]
    fn abi_scan_has_no_tail_reader() {
        let mut cfg = config(1, None, true);
        cfg.features.abi_scan_mode = true;
        assert!(RunPlan::build(&cfg, 50, 1, &[]).live.is_none());
    }

    #[test]
    fn abi_scan_runs_ahead_of_overlapping_readers() {
        let cfg = config(1, None, false);
        let plan = RunPlan::build(&cfg, 250, 1, &[cp("reader:1-101", 40)]);
        assert_eq!(plan.abi_scan.len(), 3);
        assert_eq!(plan.abi_scan[0].range, BlockRange::new(41, 141));
        assert_eq!(plan.abi_scan_blocks(), 210);

        // One range and no tail: nothing runs alongside it.
        let single = RunPlan::build(&config(1, Some(101), false), 250, 1, &[]);
        assert!(single.abi_scan.is_empty());

        // One range plus the live tail still overlaps.
        let with_tail = RunPlan::build(&config(1, None, true), 50, 1, &[]);
        assert_eq!(with_tail.abi_scan.len(), 1);

        let mut sequential = config(1, None, false);
        sequential.scaling.readers = 1;
        assert!(RunPlan::build(&sequential, 250, 1, &[]).abi_scan.is_empty());

        let mut off = config(1, None, true);
        off.features.abi_prescan = false;
        assert!(RunPlan::build(&off, 250, 1, &[]).abi_scan.is_empty());

        let scanned = [cp("abi-scan:1-101", 100), cp("abi-scan:101-201", 200), cp("abi-scan:201-251", 250)];
        assert!(RunPlan::build(&cfg, 250, 1, &scanned).abi_scan.is_empty());
    }

    #[test]
    fn keys_and_display() {
        assert_eq!(BlockRange::new(5, 10).worker_key(), "reader:5-10");
        assert_eq!(BlockRange::open(5).worker_key(), "reader:live");
        assert_eq!(BlockRange::new(5, 10).key(Pass::AbiScan), "abi-scan:5-10");
        assert_eq!(BlockRange::from_key(Pass::Index, "reader:5-10"), Some(BlockRange::new(5, 10)));
        assert_eq!(BlockRange::from_key(Pass::Index, "abi-scan:5-10"), None);
        assert_eq!(BlockRange::from_key(Pass::Index, "reader:live"), None);
        assert_eq!(BlockRange::from_key(Pass::Index, "reader:10-5"), None);
        assert_eq!(BlockRange::open(5).to_string(), "[5, head)");
        assert_eq!(BlockRange::new(5, 10).last(), Some(9));
        assert_eq!(BlockRange::open(5).last(), None);
    }
}
