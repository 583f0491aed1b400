//! In-memory document store.
//!
//! Holds documents, tombstones and dead letters in RAM. Useful for tests and
//! short-lived indexers that don't need persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use shipindex_core::store::apply_write;
use shipindex_core::{DeadLetter, Document, DocumentStore, EntityKind, IndexerError, StoredDocument, WriteOutcome};

/// In-memory index store.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<(EntityKind, String), StoredDocument>>,
    dead: Mutex<Vec<DeadLetter>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readable documents of a kind.
    pub fn count(&self, entity: EntityKind) -> usize {
        self.docs
            .lock()
            .values()
            .filter(|d| d.entity == entity && !d.deleted)
            .count()
    }

    /// Stored copy including tombstones.
    pub fn raw(&self, entity: EntityKind, id: &str) -> Option<StoredDocument> {
        self.docs.lock().get(&(entity, id.to_string())).cloned()
    }

    /// Highest block number of any stored document.
    pub fn max_block(&self) -> Option<u32> {
        self.docs.lock().values().map(|d| d.block_num).max()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn bulk_write(&self, docs: &[Document]) -> Result<Vec<WriteOutcome>, IndexerError> {
        let mut stored = self.docs.lock();
        let outcomes = docs
            .iter()
            .map(|doc| {
                let key = (doc.entity, doc.id.clone());
                match apply_write(stored.get(&key), doc) {
                    Ok(next) => {
                        stored.insert(key, next);
                        WriteOutcome::Applied
                    }
                    Err(stored_block) => WriteOutcome::Stale { stored_block },
                }
            })
            .collect();
        Ok(outcomes)
    }

    async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<StoredDocument>, IndexerError> {
        Ok(self.raw(entity, id).filter(|d| !d.deleted))
    }

    async fn list(&self, entity: EntityKind) -> Result<Vec<StoredDocument>, IndexerError> {
        let mut out: Vec<StoredDocument> = self
            .docs
            .lock()
            .values()
            .filter(|d| d.entity == entity && !d.deleted)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.block_num.cmp(&b.block_num).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn purge_after(&self, block_num: u32) -> Result<u64, IndexerError> {
        let mut docs = self.docs.lock();
        let before = docs.len();
        docs.retain(|_, d| d.block_num <= block_num);
        Ok((before - docs.len()) as u64)
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), IndexerError> {
        self.dead.lock().push(letter);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, IndexerError> {
        Ok(self.dead.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipindex_core::DocumentOp;

    fn account(block: u32, amount: f64) -> Document {
        Document::upsert(
            EntityKind::Account,
            "eosio.token-alice-EOS",
            block,
            json!({ "amount": amount, "block_num": block }),
        )
    }

    #[tokio::test]
    async fn out_of_order_writes_keep_the_highest_block() {
        let store = MemoryStore::new();
        let order = [4u32, 8, 2, 8, 6, 3];
        for b in order {
            store.bulk_write(&[account(b, b as f64)]).await.unwrap();
        }
        let doc = store.get(EntityKind::Account, "eosio.token-alice-EOS").await.unwrap().unwrap();
        assert_eq!(doc.block_num, 8);
        assert_eq!(doc.body["amount"], json!(8.0));
    }

    #[tokio::test]
    async fn stale_writes_are_reported() {
        let store = MemoryStore::new();
        let outcomes = store.bulk_write(&[account(5, 1.0), account(3, 2.0)]).await.unwrap();
        assert_eq!(outcomes, vec![WriteOutcome::Applied, WriteOutcome::Stale { stored_block: 5 }]);
    }

    #[tokio::test]
    async fn deleted_documents_are_unreadable_but_guarded() {
        let store = MemoryStore::new();
        store.bulk_write(&[account(5, 1.0)]).await.unwrap();
        store
            .bulk_write(&[Document::delete(EntityKind::Account, "eosio.token-alice-EOS", 6)])
            .await
            .unwrap();
        assert!(store.get(EntityKind::Account, "eosio.token-alice-EOS").await.unwrap().is_none());
        assert_eq!(store.count(EntityKind::Account), 0);

        let outcomes = store.bulk_write(&[account(5, 1.0)]).await.unwrap();
        assert_eq!(outcomes[0], WriteOutcome::Stale { stored_block: 6 });
        assert!(store.raw(EntityKind::Account, "eosio.token-alice-EOS").unwrap().deleted);
    }

    #[tokio::test]
    async fn purge_removes_later_blocks_and_tombstones() {
        let store = MemoryStore::new();
        for b in 1..=10u32 {
            store
                .bulk_write(&[Document::upsert(EntityKind::Block, b.to_string(), b, json!({ "n": b }))])
                .await
                .unwrap();
        }
        store
            .bulk_write(&[Document::delete(EntityKind::Account, "x", 9)])
            .await
            .unwrap();

        assert_eq!(store.purge_after(6).await.unwrap(), 5);
        assert_eq!(store.count(EntityKind::Block), 6);
        assert!(store.raw(EntityKind::Account, "x").is_none());
        assert_eq!(store.purge_after(6).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dead_letters_keep_identity() {
        let store = MemoryStore::new();
        let doc = account(7, 1.0);
        store.dead_letter(DeadLetter::from_document(&doc, "mapping conflict", 4)).await.unwrap();
        let letters = store.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, "eosio.token-alice-EOS");
        assert_eq!(letters[0].block_num, 7);
        assert_eq!(letters[0].op, DocumentOp::Upsert);
        assert_eq!(letters[0].attempts, 4);
    }
}
