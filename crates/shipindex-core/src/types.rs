//! Shared types for the ingestion pipeline.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ─── BlockPosition ───────────────────────────────────────────────────────────

/// A `(block_num, block_id)` pair as carried by state-history results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPosition {
    pub block_num: u32,
    /// Block id as lowercase hex (32 bytes).
    pub block_id: String,
}

impl BlockPosition {
    pub fn new(block_num: u32, block_id: impl Into<String>) -> Self {
        Self { block_num, block_id: block_id.into() }
    }
}

// ─── RawBlock ────────────────────────────────────────────────────────────────

/// One undecoded `get_blocks_result`, as forwarded by the stream client.
/// Segments the node did not send are empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub head: BlockPosition,
    pub last_irreversible: BlockPosition,
    pub this_block: BlockPosition,
    pub prev_block: Option<BlockPosition>,
    pub block: Bytes,
    pub traces: Bytes,
    pub deltas: Bytes,
}

impl RawBlock {
    pub fn block_num(&self) -> u32 {
        self.this_block.block_num
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// A decoded block header. Lives for one pipeline pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub num: u32,
    pub id: String,
    pub prev_id: String,
    pub producer: String,
    pub schedule_version: u32,
    /// Block timestamp as emitted by the codec (ISO-8601, no zone).
    pub timestamp: String,
}

impl Block {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.num == parent.num + 1 && self.prev_id == parent.id
    }

    pub fn position(&self) -> BlockPosition {
        BlockPosition::new(self.num, self.id.clone())
    }

    pub fn to_document(&self) -> Document {
        Document::upsert(
            EntityKind::Block,
            self.num.to_string(),
            self.num,
            json!({
                "@timestamp": self.timestamp,
                "block_num": self.num,
                "block_id": self.id,
                "prev_id": self.prev_id,
                "producer": self.producer,
                "schedule_version": self.schedule_version,
            }),
        )
    }
}

// ─── Actions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionLevel {
    pub actor: String,
    pub permission: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSequence {
    pub account: String,
    pub sequence: u64,
}

/// Receipt issued to one notified receiver of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub receiver: String,
    pub global_sequence: u64,
    pub recv_sequence: u64,
    pub auth_sequence: Vec<AuthSequence>,
}

/// One action, merged across all receivers that were notified of it.
///
/// `action_ordinal` / `creator_action_ordinal` form a tree per transaction,
/// rooted at creator ordinal 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTrace {
    pub trx_id: String,
    pub block_num: u32,
    pub block_id: String,
    pub timestamp: String,
    pub producer: String,
    pub action_ordinal: u32,
    pub creator_action_ordinal: u32,
    pub account: String,
    pub name: String,
    pub authorization: Vec<PermissionLevel>,
    pub act_digest: String,
    /// Global sequence of the first receipt; the document id.
    pub global_sequence: u64,
    pub receipts: Vec<ActionReceipt>,
    /// Action payload as hex, exactly as received.
    pub raw_data: String,
    /// Decoded payload, `None` when decoding failed.
    pub data: Option<Value>,
    pub ds_error: bool,
    pub transform_error: Option<String>,
    /// Fields added by transform modules (`@transfer`, ...).
    pub derived: Map<String, Value>,
}

impl ActionTrace {
    /// Notified accounts, in receipt order.
    pub fn notified(&self) -> Vec<&str> {
        self.receipts.iter().map(|r| r.receiver.as_str()).collect()
    }

    pub fn document_id(&self) -> String {
        if self.global_sequence > 0 {
            self.global_sequence.to_string()
        } else {
            format!("{}-{}", self.trx_id, self.action_ordinal)
        }
    }

    pub fn to_document(&self) -> Document {
        let mut act = json!({
            "account": self.account,
            "name": self.name,
            "authorization": self.authorization,
        });
        match &self.data {
            Some(data) if !self.ds_error => act["data"] = data.clone(),
            _ => act["hex_data"] = Value::String(self.raw_data.clone()),
        }

        let mut body = json!({
            "@timestamp": self.timestamp,
            "block_num": self.block_num,
            "block_id": self.block_id,
            "producer": self.producer,
            "trx_id": self.trx_id,
            "action_ordinal": self.action_ordinal,
            "creator_action_ordinal": self.creator_action_ordinal,
            "act": act,
            "act_digest": self.act_digest,
            "global_sequence": self.global_sequence,
            "receipts": self.receipts,
            "notified": self.notified(),
        });
        if self.ds_error {
            body["ds_error"] = Value::Bool(true);
        }
        if let Some(err) = &self.transform_error {
            body["transform_error"] = Value::String(err.clone());
        }
        if let Value::Object(map) = &mut body {
            for (k, v) in &self.derived {
                map.insert(k.clone(), v.clone());
            }
        }
        Document::upsert(EntityKind::Action, self.document_id(), self.block_num, body)
    }
}

// ─── Transactions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub id: String,
    pub block_num: u32,
    pub timestamp: String,
    pub status: String,
    pub cpu_usage_us: u32,
    pub net_usage_words: u32,
    pub action_count: u32,
}

impl TransactionSummary {
    pub fn to_document(&self) -> Document {
        Document::upsert(
            EntityKind::Transaction,
            self.id.clone(),
            self.block_num,
            json!({
                "@timestamp": self.timestamp,
                "block_num": self.block_num,
                "trx_id": self.id,
                "status": self.status,
                "cpu_usage_us": self.cpu_usage_us,
                "net_usage_words": self.net_usage_words,
                "action_count": self.action_count,
            }),
        )
    }
}

// ─── Deltas ──────────────────────────────────────────────────────────────────

/// A `contract_row` change. `present == false` is a row removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDelta {
    pub block_num: u32,
    pub block_id: String,
    pub timestamp: String,
    pub code: String,
    pub scope: String,
    pub table: String,
    pub payer: String,
    pub primary_key: String,
    pub present: bool,
    /// Row value as hex.
    pub raw_value: String,
    pub data: Option<Value>,
    pub ds_error: bool,
    pub transform_error: Option<String>,
    pub derived: Map<String, Value>,
}

impl TableDelta {
    pub fn document_id(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.block_num, self.code, self.scope, self.table, self.primary_key
        )
    }

    pub fn to_document(&self) -> Document {
        let mut body = json!({
            "@timestamp": self.timestamp,
            "block_num": self.block_num,
            "block_id": self.block_id,
            "code": self.code,
            "scope": self.scope,
            "table": self.table,
            "payer": self.payer,
            "primary_key": self.primary_key,
            "present": self.present,
        });
        match &self.data {
            Some(data) if !self.ds_error => body["data"] = data.clone(),
            _ => body["value"] = Value::String(self.raw_value.clone()),
        }
        if self.ds_error {
            body["ds_error"] = Value::Bool(true);
        }
        if let Some(err) = &self.transform_error {
            body["transform_error"] = Value::String(err.clone());
        }
        if let Value::Object(map) = &mut body {
            for (k, v) in &self.derived {
                map.insert(k.clone(), v.clone());
            }
        }
        Document::upsert(EntityKind::Delta, self.document_id(), self.block_num, body)
    }

    /// Token balance state derived by the `accounts` table module, if any.
    ///
    /// Removal deltas become deletes; the document is keyed by
    /// `code-scope-symbol` so later balances overwrite earlier ones.
    pub fn to_account_document(&self) -> Option<Document> {
        let accounts = self.derived.get("@accounts")?;
        let symbol = accounts.get("symbol")?.as_str()?;
        let id = format!("{}-{}-{}", self.code, self.scope, symbol);
        let body = json!({
            "code": self.code,
            "scope": self.scope,
            "symbol": symbol,
            "amount": accounts.get("amount").cloned().unwrap_or(Value::Null),
            "block_num": self.block_num,
            "present": self.present,
        });
        Some(if self.present {
            Document::upsert(EntityKind::Account, id, self.block_num, body)
        } else {
            Document::delete(EntityKind::Account, id, self.block_num)
        })
    }
}

// ─── Documents ───────────────────────────────────────────────────────────────

/// Entity kinds; each has its own queue and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Block,
    Action,
    Transaction,
    Delta,
    Abi,
    Account,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Block,
        EntityKind::Action,
        EntityKind::Transaction,
        EntityKind::Delta,
        EntityKind::Abi,
        EntityKind::Account,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Action => "action",
            Self::Transaction => "transaction",
            Self::Delta => "delta",
            Self::Abi => "abi",
            Self::Account => "account",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentOp {
    Upsert,
    Delete,
}

/// A write destined for the index store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub entity: EntityKind,
    pub id: String,
    pub block_num: u32,
    pub op: DocumentOp,
    pub body: Value,
}

impl Document {
    pub fn upsert(entity: EntityKind, id: impl Into<String>, block_num: u32, body: Value) -> Self {
        Self { entity, id: id.into(), block_num, op: DocumentOp::Upsert, body }
    }

    pub fn delete(entity: EntityKind, id: impl Into<String>, block_num: u32) -> Self {
        Self { entity, id: id.into(), block_num, op: DocumentOp::Delete, body: Value::Null }
    }

    /// `entity/id`, used in logs and dead letters.
    pub fn key(&self) -> String {
        format!("{}/{}", self.entity, self.id)
    }
}

/// A record that exhausted its write retries, kept for manual replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entity: EntityKind,
    pub id: String,
    pub block_num: u32,
    pub op: DocumentOp,
    pub payload: Value,
    pub reason: String,
    pub attempts: u32,
    /// Unix timestamp (seconds).
    pub failed_at: i64,
}

impl DeadLetter {
    pub fn from_document(doc: &Document, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            entity: doc.entity,
            id: doc.id.clone(),
            block_num: doc.block_num,
            op: doc.op,
            payload: doc.body.clone(),
            reason: reason.into(),
            attempts,
            failed_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(num: u32, id: &str, prev: &str) -> Block {
        Block {
            num,
            id: id.into(),
            prev_id: prev.into(),
            producer: "eosio".into(),
            schedule_version: 1,
            timestamp: "2024-01-01T00:00:00.000".into(),
        }
    }

    #[test]
    fn block_extends() {
        let parent = block(10, "aa", "99");
        assert!(block(11, "bb", "aa").extends(&parent));
        assert!(!block(11, "bb", "cc").extends(&parent));
        assert!(!block(12, "bb", "aa").extends(&parent));
    }

    #[test]
    fn delta_id_scheme() {
        let delta = TableDelta {
            block_num: 42,
            block_id: "ff".into(),
            timestamp: String::new(),
            code: "eosio.token".into(),
            scope: "alice".into(),
            table: "accounts".into(),
            payer: "alice".into(),
            primary_key: "5459781".into(),
            present: true,
            raw_value: String::new(),
            data: None,
            ds_error: false,
            transform_error: None,
            derived: Map::new(),
        };
        assert_eq!(delta.document_id(), "42-eosio.token-alice-accounts-5459781");
        assert!(delta.to_account_document().is_none());
    }

    #[test]
    fn entity_names_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("nope"), None);
    }
}
