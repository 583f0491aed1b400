//! Index store boundary and the monotonic write rules every backend applies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::IndexerError;
use crate::types::{DeadLetter, Document, DocumentOp, EntityKind};

/// A document as held by the store. Deletes leave a tombstone carrying the
/// block number so that an older upsert cannot resurrect the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub entity: EntityKind,
    pub id: String,
    pub block_num: u32,
    pub body: Value,
    pub deleted: bool,
}

/// Per-document result of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Applied,
    /// Rejected because the stored copy is from a later block. Not an error.
    Stale { stored_block: u32 },
    Failed(String),
}

impl WriteOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Apply `doc` on top of `existing`.
///
/// Returns `Err(stored_block)` when the write is older than what is stored.
/// Equal block numbers are accepted so replays converge. In an upsert, a
/// `null` field removes the stored field instead of being stored.
pub fn apply_write(existing: Option<&StoredDocument>, doc: &Document) -> Result<StoredDocument, u32> {
    if let Some(stored) = existing {
        if stored.block_num > doc.block_num {
            return Err(stored.block_num);
        }
    }

    let body = match doc.op {
        DocumentOp::Delete => Value::Null,
        DocumentOp::Upsert => {
            let mut merged = match existing {
                Some(StoredDocument { body: Value::Object(map), deleted: false, .. }) => map.clone(),
                _ => Map::new(),
            };
            match &doc.body {
                Value::Object(incoming) => {
                    for (key, value) in incoming {
                        if value.is_null() {
                            merged.remove(key);
                        } else {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                }
                Value::Null => {}
                other => {
                    merged.insert("value".into(), other.clone());
                }
            }
            Value::Object(merged)
        }
    };

    Ok(StoredDocument {
        entity: doc.entity,
        id: doc.id.clone(),
        block_num: doc.block_num,
        body,
        deleted: doc.op == DocumentOp::Delete,
    })
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Write a batch. `Err` means the whole request failed; otherwise one
    /// outcome per input document, in order.
    async fn bulk_write(&self, docs: &[Document]) -> Result<Vec<WriteOutcome>, IndexerError>;

    /// Readable document, or `None` if absent or deleted.
    async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<StoredDocument>, IndexerError>;

    /// Every readable document of a kind.
    async fn list(&self, entity: EntityKind) -> Result<Vec<StoredDocument>, IndexerError>;

    /// Remove every document (and tombstone) written after `block_num`.
    /// Returns how many were removed.
    async fn purge_after(&self, block_num: u32) -> Result<u64, IndexerError>;

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), IndexerError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, IndexerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(block: u32, body: Value) -> Document {
        Document::upsert(EntityKind::Account, "eosio.token-alice-EOS", block, body)
    }

    fn fold(writes: &[Document]) -> Option<StoredDocument> {
        writes.iter().fold(None, |acc, w| match apply_write(acc.as_ref(), w) {
            Ok(next) => Some(next),
            Err(_) => acc,
        })
    }

    #[test]
    fn final_block_is_max_attempted() {
        let order = [5u32, 9, 3, 9, 7, 12, 1, 11];
        let writes: Vec<_> = order.iter().map(|b| upsert(*b, json!({ "amount": b }))).collect();
        let stored = fold(&writes).unwrap();
        assert_eq!(stored.block_num, 12);
        assert_eq!(stored.body["amount"], json!(12));
    }

    #[test]
    fn lower_block_rejected_equal_accepted() {
        let first = apply_write(None, &upsert(10, json!({"a": 1}))).unwrap();
        assert_eq!(apply_write(Some(&first), &upsert(9, json!({"a": 2}))), Err(10));
        let again = apply_write(Some(&first), &upsert(10, json!({"a": 1}))).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn null_retracts_field() {
        let first = apply_write(None, &upsert(1, json!({"a": 1, "b": 2}))).unwrap();
        let next = apply_write(Some(&first), &upsert(2, json!({"b": null, "c": 3}))).unwrap();
        assert_eq!(next.body, json!({"a": 1, "c": 3}));
    }

    #[test]
    fn delete_leaves_guarding_tombstone() {
        let first = apply_write(None, &upsert(1, json!({"a": 1}))).unwrap();
        let gone = apply_write(
            Some(&first),
            &Document::delete(EntityKind::Account, "eosio.token-alice-EOS", 5),
        )
        .unwrap();
        assert!(gone.deleted);
        assert_eq!(apply_write(Some(&gone), &upsert(4, json!({"a": 9}))), Err(5));

        let revived = apply_write(Some(&gone), &upsert(6, json!({"b": 1}))).unwrap();
        assert!(!revived.deleted);
        assert_eq!(revived.body, json!({"b": 1}));
    }
}
