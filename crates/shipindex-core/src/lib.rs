//! shipindex-core: foundation for the state-history ingestion pipeline.
//!
//! # Architecture
//!
//! ```text
//! StreamClient ─► raw blocks ─► Deserializer pool ─► entity queues ─► IndexingSink ─► DocumentStore
//!      │                            ├── AbiResolver      (per-account ABI validity ranges)
//!      │                            ├── AbiCodec         (external binary codec)
//!      │                            └── TransformRegistry (per-contract enrichment)
//!      └── BlockTracker ─► ForkDetected ─► ForkManager (purge index, roll back ABI cache)
//!
//! CompletionLedger ─► CheckpointManager (per worker, block granular)
//! ```

pub mod abi;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod fork;
pub mod ledger;
pub mod modules;
pub mod queue;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod transform;
pub mod types;

pub use abi::{AbiEntry, AbiPayload, AbiResolver};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, EndpointStatus, MemoryCheckpointStore};
pub use codec::AbiCodec;
pub use config::IndexerConfig;
pub use error::IndexerError;
pub use filter::{Filters, RecordFilter};
pub use fork::{ForkDetected, ForkManager, RollbackPlan};
pub use ledger::CompletionLedger;
pub use queue::{QueueConsumer, QueueMessage, QueueProducer};
pub use retry::{RetryConfig, RetryPolicy};
pub use store::{DocumentStore, StoredDocument, WriteOutcome};
pub use tracker::BlockTracker;
pub use transform::{TransformModule, TransformRegistry};
pub use types::{ActionTrace, Block, BlockPosition, DeadLetter, Document, DocumentOp, EntityKind, RawBlock, TableDelta};
