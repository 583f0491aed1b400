//! shipindex-worker: runs the pipeline for one chain.
//!
//! - [`role`]: reader roles and the `spawning → backfilling → live → draining → retired` lifecycle
//! - [`planner`]: backfill range planning, the ABI scan pass and checkpoint-aware restarts
//! - [`orchestrator`]: [`Orchestrator`], readers, fork rollback, worker replacement
//! - [`builder`]: [`OrchestratorBuilder`]

pub mod builder;
pub mod orchestrator;
pub mod planner;
pub mod role;

pub use builder::OrchestratorBuilder;
pub use orchestrator::{Orchestrator, ReaderOutcome, ReaderReport, RunSummary, ScanSummary, Stop};
pub use planner::{BlockRange, Pass, RangeAssignment, RangePlanner, RunPlan};
pub use role::{WorkerDef, WorkerRole, WorkerState};
