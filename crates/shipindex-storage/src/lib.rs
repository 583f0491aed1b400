//! shipindex-storage: index store backends and the indexing sink.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//!
//! [`sink`] batches entity queue messages into bulk writes, retries failed
//! subsets and dead-letters what never succeeds.

pub mod memory;
pub mod sink;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
pub use sink::{IndexingSink, SinkStats};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
