//! shipindex-deser: turns raw state-history blocks into index documents.
//!
//! - [`decode`]: [`BlockDecoder`], header/trace/delta decoding, ABI updates, filters and transforms
//! - [`sequencer`]: in-order application of ABI updates across concurrent workers
//! - [`pool`]: [`DeserializerPool`], the worker tasks between the raw block queue and the entity queues

pub mod decode;
pub mod pool;
pub mod sequencer;

#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;

pub use decode::{AbiUpdate, BlockDecoder, BlockSegments, DecodeStats, DecodedBlock};
pub use pool::{BlockFailure, DeserializerPool, EntityQueues, PoolStats};
pub use sequencer::AbiSequencer;
