//! Checkpoints: the last fully indexed block of every worker, plus the
//! health of each state-history endpoint.
//!
//! A restarted reader resumes at `block_number + 1` of its checkpoint. Since
//! checkpoints only ever name fully indexed blocks and writes are
//! monotonic, redoing the work after a checkpoint is always safe.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain_id: String,
    /// Worker key, e.g. `reader:1000-2000` or `reader:live`.
    pub worker: String,
    /// Last fully indexed block.
    pub block_number: u32,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Result of probing one state-history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub url: String,
    pub healthy: bool,
    pub chain_id: Option<String>,
    pub head: Option<u32>,
    pub last_irreversible: Option<u32>,
    pub trace_begin_block: Option<u32>,
    pub error: Option<String>,
    pub checked_at: i64,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, chain_id: &str, worker: &str) -> Result<Option<Checkpoint>, IndexerError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    async fn delete(&self, chain_id: &str, worker: &str) -> Result<(), IndexerError>;

    /// Every checkpoint of a chain, for planning a restart.
    async fn list(&self, chain_id: &str) -> Result<Vec<Checkpoint>, IndexerError>;

    async fn save_endpoint(&self, status: EndpointStatus) -> Result<(), IndexerError>;

    async fn endpoints(&self) -> Result<Vec<EndpointStatus>, IndexerError>;
}

/// Checkpoint writes for one worker.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    chain_id: String,
    worker: String,
    /// Save every N advances.
    save_interval: u32,
    counter: u32,
    last_saved: Option<u32>,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        chain_id: impl Into<String>,
        worker: impl Into<String>,
        save_interval: u32,
    ) -> Self {
        Self {
            store,
            chain_id: chain_id.into(),
            worker: worker.into(),
            save_interval: save_interval.max(1),
            counter: 0,
            last_saved: None,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>, IndexerError> {
        self.store.load(&self.chain_id, &self.worker).await
    }

    /// Save every `save_interval` calls.
    pub async fn maybe_save(&mut self, block_number: u32) -> Result<(), IndexerError> {
        self.counter += 1;
        if self.counter >= self.save_interval {
            self.force_save(block_number).await?;
        }
        Ok(())
    }

    /// Save now (shutdown, rollback, range completion).
    pub async fn force_save(&mut self, block_number: u32) -> Result<(), IndexerError> {
        if self.last_saved == Some(block_number) {
            self.counter = 0;
            return Ok(());
        }
        let cp = Checkpoint {
            chain_id: self.chain_id.clone(),
            worker: self.worker.clone(),
            block_number,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(cp).await?;
        self.last_saved = Some(block_number);
        self.counter = 0;
        Ok(())
    }

    pub fn last_saved(&self) -> Option<u32> {
        self.last_saved
    }
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// In-memory checkpoint store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
    endpoints: Mutex<HashMap<String, EndpointStatus>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(chain_id: &str, worker: &str) -> String {
        format!("{chain_id}:{worker}")
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, chain_id: &str, worker: &str) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.data.lock().get(&Self::key(chain_id, worker)).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let key = Self::key(&checkpoint.chain_id, &checkpoint.worker);
        self.data.lock().insert(key, checkpoint);
        Ok(())
    }

    async fn delete(&self, chain_id: &str, worker: &str) -> Result<(), IndexerError> {
        self.data.lock().remove(&Self::key(chain_id, worker));
        Ok(())
    }

    async fn list(&self, chain_id: &str) -> Result<Vec<Checkpoint>, IndexerError> {
        let mut out: Vec<_> = self
            .data
            .lock()
            .values()
            .filter(|c| c.chain_id == chain_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.worker.cmp(&b.worker));
        Ok(out)
    }

    async fn save_endpoint(&self, status: EndpointStatus) -> Result<(), IndexerError> {
        self.endpoints.lock().insert(status.url.clone(), status);
        Ok(())
    }

    async fn endpoints(&self) -> Result<Vec<EndpointStatus>, IndexerError> {
        let mut out: Vec<_> = self.endpoints.lock().values().cloned().collect();
        out.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(out)
    }
}
