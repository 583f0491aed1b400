//! Fork handling: from a detected fork to a rollback of the index and the
//! ABI cache.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::abi::AbiResolver;
use crate::error::IndexerError;
use crate::store::DocumentStore;

/// Raised by the stream client when a block does not link to the accepted head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkDetected {
    /// First block of the new branch.
    pub block_num: u32,
    pub block_id: String,
    /// Highest block shared by both branches (estimated when the parent is
    /// outside the tracked window).
    pub common_ancestor: u32,
    /// Head of the abandoned branch.
    pub previous_head: u32,
}

impl ForkDetected {
    /// Number of accepted blocks being replaced.
    pub fn depth(&self) -> u32 {
        self.previous_head.saturating_sub(self.common_ancestor)
    }
}

impl From<&ForkDetected> for IndexerError {
    fn from(f: &ForkDetected) -> Self {
        IndexerError::ForkDetected {
            block_num: f.block_num,
            common_ancestor: f.common_ancestor,
        }
    }
}

/// What a rollback did and where the reader must continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub rollback_block_num: u32,
    pub resume_from: u32,
    pub documents_purged: u64,
    pub abi_versions_dropped: usize,
}

pub struct ForkManager {
    store: Arc<dyn DocumentStore>,
    resolver: Arc<AbiResolver>,
}

impl ForkManager {
    pub fn new(store: Arc<dyn DocumentStore>, resolver: Arc<AbiResolver>) -> Self {
        Self { store, resolver }
    }

    /// Roll the index back to the fork's common ancestor.
    ///
    /// Irreversible blocks are never touched: the rollback point is clamped
    /// to `last_irreversible`. Running the same rollback twice leaves the
    /// store and the cache as the first run did.
    pub async fn rollback(&self, fork: &ForkDetected, last_irreversible: u32) -> Result<RollbackPlan, IndexerError> {
        let rollback_block_num = fork.common_ancestor.max(last_irreversible);
        if rollback_block_num > fork.common_ancestor {
            warn!(
                common_ancestor = fork.common_ancestor,
                last_irreversible,
                "Fork reaches below LIB, clamping rollback"
            );
        }

        let documents_purged = self.store.purge_after(rollback_block_num).await?;
        let abi_versions_dropped = self.resolver.rollback_after(rollback_block_num);

        info!(
            at = fork.block_num,
            depth = fork.depth(),
            rollback_block_num,
            documents_purged,
            abi_versions_dropped,
            "Rolled back fork"
        );

        Ok(RollbackPlan {
            rollback_block_num,
            resume_from: rollback_block_num + 1,
            documents_purged,
            abi_versions_dropped,
        })
    }
}
