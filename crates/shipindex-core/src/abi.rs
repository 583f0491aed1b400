//! Per-account ABI validity table.
//!
//! Every ABI version an account ever published is loaded into the codec under
//! its own key (`account@valid_from`), so a decode at an old height never
//! races a `setabi` applied for a newer one.
//!
//! ```text
//! eosio:  [100 ──────────── 200) [200 ──────────── open)
//!          eosio@100                eosio@200
//! ```
//!
//! Readers clone the current `Arc` snapshot of an account's ranges and release
//! the guard immediately; writers serialize on a per-account mutex and publish
//! a fresh snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::AbiCodec;
use crate::error::IndexerError;

// ─── AbiEntry ────────────────────────────────────────────────────────────────

/// How an ABI was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "abi", rename_all = "lowercase")]
pub enum AbiPayload {
    Json(String),
    /// Hex of the binary ABI, as carried by `setabi`.
    Hex(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiStatus {
    Loaded,
    /// The codec rejected the payload; lookups in this range fail until a
    /// newer `setabi` replaces it.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct AbiEntry {
    pub account: String,
    /// Inclusive.
    pub valid_from: u32,
    /// Exclusive; `None` while this is the newest version.
    pub valid_until: Option<u32>,
    pub payload: Arc<AbiPayload>,
    pub status: AbiStatus,
}

impl AbiEntry {
    /// Contract key the codec knows this version by.
    pub fn codec_key(&self) -> String {
        codec_key(&self.account, self.valid_from)
    }

    pub fn covers(&self, block_num: u32) -> bool {
        self.valid_from <= block_num && self.valid_until.map_or(true, |until| block_num < until)
    }
}

pub fn codec_key(account: &str, valid_from: u32) -> String {
    format!("{account}@{valid_from}")
}

/// ABI document body as stored in the index (`abi` entity).
pub fn abi_document_body(account: &str, block_num: u32, payload: &AbiPayload) -> Value {
    let (encoding, abi) = match payload {
        AbiPayload::Json(s) => ("json", s),
        AbiPayload::Hex(s) => ("hex", s),
    };
    serde_json::json!({
        "account": account,
        "block": block_num,
        "encoding": encoding,
        "abi": abi,
    })
}

/// Inverse of [`abi_document_body`], used to seed the resolver on cold start.
pub fn abi_from_document(body: &Value) -> Option<(String, u32, AbiPayload)> {
    let account = body.get("account")?.as_str()?.to_string();
    let block = u32::try_from(body.get("block")?.as_u64()?).ok()?;
    let abi = body.get("abi")?.as_str()?.to_string();
    let payload = match body.get("encoding").and_then(Value::as_str) {
        Some("hex") => AbiPayload::Hex(abi),
        _ => AbiPayload::Json(abi),
    };
    Some((account, block, payload))
}

// ─── AbiResolver ─────────────────────────────────────────────────────────────

type Snapshot = Arc<Vec<Arc<AbiEntry>>>;

#[derive(Default)]
struct AccountAbis {
    writer: Mutex<()>,
    ranges: RwLock<Snapshot>,
}

impl AccountAbis {
    fn snapshot(&self) -> Snapshot {
        self.ranges.read().clone()
    }
}

pub struct AbiResolver {
    codec: Arc<dyn AbiCodec>,
    /// Versions kept per account; the newest is never evicted.
    retention: usize,
    accounts: RwLock<HashMap<String, Arc<AccountAbis>>>,
}

impl AbiResolver {
    pub fn new(codec: Arc<dyn AbiCodec>, retention: usize) -> Self {
        Self {
            codec,
            retention: retention.max(1),
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> &Arc<dyn AbiCodec> {
        &self.codec
    }

    fn account(&self, account: &str) -> Option<Arc<AccountAbis>> {
        self.accounts.read().get(account).cloned()
    }

    fn account_or_insert(&self, account: &str) -> Arc<AccountAbis> {
        if let Some(existing) = self.account(account) {
            return existing;
        }
        self.accounts
            .write()
            .entry(account.to_string())
            .or_default()
            .clone()
    }

    /// ABI valid at `block_num`.
    pub fn get(&self, account: &str, block_num: u32) -> Result<Arc<AbiEntry>, IndexerError> {
        let not_found = || IndexerError::AbiNotFound {
            account: account.to_string(),
            block_num,
        };
        let ranges = self.account(account).ok_or_else(not_found)?.snapshot();

        let idx = ranges.partition_point(|e| e.valid_from <= block_num);
        let entry = idx
            .checked_sub(1)
            .and_then(|i| ranges.get(i))
            .filter(|e| e.covers(block_num))
            .ok_or_else(not_found)?;

        match &entry.status {
            AbiStatus::Loaded => Ok(entry.clone()),
            AbiStatus::Failed(reason) => Err(IndexerError::AbiLoad {
                account: account.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// Newest known version for `account`.
    pub fn latest(&self, account: &str) -> Option<Arc<AbiEntry>> {
        self.account(account)?.snapshot().last().cloned()
    }

    /// All ranges for `account`, ordered by height.
    pub fn ranges(&self, account: &str) -> Vec<Arc<AbiEntry>> {
        self.account(account)
            .map(|a| a.snapshot().as_ref().clone())
            .unwrap_or_default()
    }

    /// Record a new ABI version published at `block_num`.
    ///
    /// The range containing `block_num` is closed at `block_num`; inserting
    /// below the newest version (parallel backfill) closes the new range at
    /// the next version's start. Re-applying the same height replaces it.
    /// A codec rejection is stored as a failed range and returned as
    /// [`IndexerError::AbiLoad`]. A version older than every retained one of
    /// a full account is not loaded and returns [`IndexerError::AbiNotRetained`].
    pub fn set(
        &self,
        account: &str,
        block_num: u32,
        payload: AbiPayload,
    ) -> Result<Arc<AbiEntry>, IndexerError> {
        let abis = self.account_or_insert(account);
        let _guard = abis.writer.lock();

        let mut ranges: Vec<Arc<AbiEntry>> = abis.snapshot().as_ref().clone();
        let pos = ranges.partition_point(|e| e.valid_from < block_num);
        let replaces = ranges.get(pos).map_or(false, |e| e.valid_from == block_num);
        if !replaces && pos == 0 && ranges.len() >= self.retention {
            debug!(account, block_num, retention = self.retention, "ABI version outside retention, not loaded");
            return Err(IndexerError::AbiNotRetained {
                account: account.to_string(),
                block_num,
                retention: self.retention,
            });
        }

        let key = codec_key(account, block_num);
        let load = match &payload {
            AbiPayload::Json(json) => self.codec.load_abi(&key, json),
            AbiPayload::Hex(hex) => self.codec.load_abi_hex(&key, hex),
        };
        let status = match &load {
            Ok(()) => AbiStatus::Loaded,
            Err(e) => {
                warn!(account, block_num, error = %e, "ABI rejected by codec");
                AbiStatus::Failed(e.to_string())
            }
        };

        let valid_until = if replaces {
            ranges[pos].valid_until
        } else {
            ranges.get(pos).map(|next| next.valid_from)
        };

        let entry = Arc::new(AbiEntry {
            account: account.to_string(),
            valid_from: block_num,
            valid_until,
            payload: Arc::new(payload),
            status,
        });
        if replaces {
            ranges[pos] = entry.clone();
        } else {
            ranges.insert(pos, entry.clone());
        }
        if pos > 0 {
            let prev = &ranges[pos - 1];
            if prev.valid_until != Some(block_num) {
                let mut closed = prev.as_ref().clone();
                closed.valid_until = Some(block_num);
                ranges[pos - 1] = Arc::new(closed);
            }
        }

        while ranges.len() > self.retention {
            let evicted = ranges.remove(0);
            self.codec.delete_contract(&evicted.codec_key());
            debug!(account, valid_from = evicted.valid_from, "ABI version evicted");
        }

        *abis.ranges.write() = Arc::new(ranges);
        debug!(account, block_num, "ABI version recorded");

        load.map(|_| entry)
    }

    /// Load previously indexed ABI versions. Failures are logged and kept as
    /// failed ranges.
    pub fn seed<I>(&self, versions: I) -> usize
    where
        I: IntoIterator<Item = (String, u32, AbiPayload)>,
    {
        let mut versions: Vec<_> = versions.into_iter().collect();
        versions.sort_by_key(|(_, block, _)| *block);
        let mut loaded = 0;
        for (account, block_num, payload) in versions {
            if self.set(&account, block_num, payload).is_ok() {
                loaded += 1;
            }
        }
        loaded
    }

    /// Forget every version published after `block_num`. Returns how many
    /// versions were dropped. Idempotent.
    pub fn rollback_after(&self, block_num: u32) -> usize {
        let accounts: Vec<(String, Arc<AccountAbis>)> = self
            .accounts
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut dropped = 0;
        for (account, abis) in accounts {
            let _guard = abis.writer.lock();
            let current = abis.snapshot();
            if !current.iter().any(|e| e.valid_from > block_num) {
                continue;
            }
            let mut kept = Vec::with_capacity(current.len());
            for entry in current.iter() {
                if entry.valid_from > block_num {
                    self.codec.delete_contract(&entry.codec_key());
                    dropped += 1;
                } else {
                    kept.push(entry.clone());
                }
            }
            if let Some(last) = kept.last_mut() {
                let mut reopened = last.as_ref().clone();
                reopened.valid_until = None;
                *last = Arc::new(reopened);
            }
            debug!(account = %account, block_num, remaining = kept.len(), "ABI versions rolled back");
            *abis.ranges.write() = Arc::new(kept);
        }
        dropped
    }

    pub fn account_count(&self) -> usize {
        self.accounts.read().len()
    }
}
