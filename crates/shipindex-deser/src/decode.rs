//! Block decoding: from a [`RawBlock`] to indexable records.
//!
//! Decoding runs in three stages so that deserializer workers can run in
//! parallel while ABI updates still apply in block order:
//!
//! 1. [`BlockDecoder::decode_segments`] decodes the header and the trace and
//!    delta arrays with the protocol ABI. Any failure here aborts the block.
//! 2. [`BlockDecoder::apply_abi_updates`] applies the block's `setabi`
//!    actions to the resolver. Callers run this stage in block order per lane.
//! 3. [`BlockDecoder::decode_records`] decodes action and row payloads with
//!    the contract ABIs, applies filters and transforms, and builds
//!    documents. Failures here only flag the record.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use shipindex_core::abi::{abi_document_body, AbiEntry, AbiPayload};
use shipindex_core::codec::SHIP_CONTRACT;
use shipindex_core::config::{FeatureConfig, IndexerConfig};
use shipindex_core::types::{ActionReceipt, AuthSequence, PermissionLevel, TransactionSummary};
use shipindex_core::{
    AbiResolver, ActionTrace, Block, Document, EntityKind, Filters, IndexerError, RawBlock, TableDelta,
    TransformRegistry,
};
use tracing::{debug, info, warn};

/// A `setabi` seen in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiUpdate {
    pub account: String,
    pub block_num: u32,
    pub payload: AbiPayload,
}

impl AbiUpdate {
    pub fn to_document(&self) -> Document {
        Document::upsert(
            EntityKind::Abi,
            format!("{}-{}", self.block_num, self.account),
            self.block_num,
            abi_document_body(&self.account, self.block_num, &self.payload),
        )
    }
}

/// Output of stage 1.
#[derive(Debug, Clone)]
pub struct BlockSegments {
    pub block: Block,
    /// Transaction trace bodies, variant tags removed.
    pub traces: Vec<Value>,
    /// Table delta bodies, variant tags removed.
    pub deltas: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Records kept with `ds_error`.
    pub flagged: usize,
    pub filtered: usize,
    pub transform_errors: usize,
    /// Transactions that did not execute.
    pub skipped_transactions: usize,
    /// Rows whose `contract_row` envelope could not be read.
    pub dropped_rows: usize,
}

#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub block: Block,
    pub transactions: Vec<TransactionSummary>,
    pub actions: Vec<ActionTrace>,
    pub deltas: Vec<TableDelta>,
    /// Token balance state documents.
    pub accounts: Vec<Document>,
    pub abis: Vec<AbiUpdate>,
    pub stats: DecodeStats,
    abi_scan: bool,
}

impl DecodedBlock {
    /// Everything to index for this block. In ABI scan mode only the ABI
    /// documents.
    pub fn documents(&self) -> Vec<Document> {
        if self.abi_scan {
            return self.abis.iter().map(AbiUpdate::to_document).collect();
        }
        let mut docs = Vec::with_capacity(
            1 + self.transactions.len() + self.actions.len() + self.deltas.len() + self.accounts.len() + self.abis.len(),
        );
        docs.push(self.block.to_document());
        docs.extend(self.transactions.iter().map(TransactionSummary::to_document));
        docs.extend(self.actions.iter().map(ActionTrace::to_document));
        docs.extend(self.deltas.iter().map(TableDelta::to_document));
        docs.extend(self.accounts.iter().cloned());
        docs.extend(self.abis.iter().map(AbiUpdate::to_document));
        docs
    }
}

pub struct BlockDecoder {
    resolver: Arc<AbiResolver>,
    registry: Arc<TransformRegistry>,
    filters: Filters,
    chain: String,
    system_contract: String,
    features: FeatureConfig,
}

impl BlockDecoder {
    pub fn new(resolver: Arc<AbiResolver>, registry: Arc<TransformRegistry>, cfg: &IndexerConfig) -> Self {
        Self {
            resolver,
            registry,
            filters: cfg.filters.clone(),
            chain: cfg.chain.clone(),
            system_contract: cfg.system_contract.clone(),
            features: cfg.features.clone(),
        }
    }

    pub fn resolver(&self) -> &Arc<AbiResolver> {
        &self.resolver
    }

    pub fn abi_scan(&self) -> bool {
        self.features.abi_scan_mode
    }

    /// All three stages in one call.
    pub fn decode(&self, raw: &RawBlock) -> Result<DecodedBlock, IndexerError> {
        let segments = self.decode_segments(raw)?;
        let abis = self.apply_abi_updates(&segments);
        Ok(self.decode_records(segments, abis))
    }

    // ─── Stage 1 ─────────────────────────────────────────────────────────────

    pub fn decode_segments(&self, raw: &RawBlock) -> Result<BlockSegments, IndexerError> {
        let block = self.decode_header(raw)?;
        let traces = self.decode_array(block.num, "transaction_trace[]", &raw.traces)?;
        let deltas = if self.features.abi_scan_mode {
            vec![]
        } else {
            self.decode_array(block.num, "table_delta[]", &raw.deltas)?
        };
        Ok(BlockSegments { block, traces, deltas })
    }

    fn decode_header(&self, raw: &RawBlock) -> Result<Block, IndexerError> {
        let num = raw.block_num();
        let mut block = Block {
            num,
            id: raw.this_block.block_id.clone(),
            prev_id: raw.prev_block.as_ref().map(|p| p.block_id.clone()).unwrap_or_default(),
            producer: String::new(),
            schedule_version: 0,
            timestamp: String::new(),
        };
        if raw.block.is_empty() {
            return Ok(block);
        }

        let header = self
            .resolver
            .codec()
            .bin_to_json(SHIP_CONTRACT, "signed_block", &raw.block)
            .map_err(|e| header_error(num, e))?;
        let header = variant_body(&header);
        block.producer = str_field(header, "producer")
            .ok_or_else(|| header_error(num, "missing producer"))?
            .to_string();
        block.timestamp = str_field(header, "timestamp")
            .ok_or_else(|| header_error(num, "missing timestamp"))?
            .to_string();
        block.schedule_version = u32_field(header, "schedule_version")
            .map_err(|v| header_error(num, format!("schedule_version {v} out of range")))?;
        if block.prev_id.is_empty() {
            block.prev_id = str_field(header, "previous").unwrap_or_default().to_string();
        }
        Ok(block)
    }

    fn decode_array(&self, block_num: u32, type_name: &str, data: &[u8]) -> Result<Vec<Value>, IndexerError> {
        if data.is_empty() {
            return Ok(vec![]);
        }
        match self.resolver.codec().bin_to_json(SHIP_CONTRACT, type_name, data) {
            Ok(Value::Array(items)) => Ok(items.into_iter().map(into_variant_body).collect()),
            Ok(_) => Err(header_error(block_num, format!("{type_name} is not an array"))),
            Err(e) => Err(header_error(block_num, e)),
        }
    }

    // ─── Stage 2 ─────────────────────────────────────────────────────────────

    /// Apply every `setabi` of the block to the resolver, in action order.
    pub fn apply_abi_updates(&self, segments: &BlockSegments) -> Vec<AbiUpdate> {
        let block_num = segments.block.num;
        let mut updates = vec![];
        for trx in segments.traces.iter().filter(|t| executed(t)) {
            for trace in flatten_action_traces(trx) {
                let Some(act) = trace.get("act") else { continue };
                if str_field(act, "account") != Some(self.system_contract.as_str())
                    || str_field(act, "name") != Some("setabi")
                {
                    continue;
                }
                // Notifications of the same setabi carry the same payload.
                if str_field(trace, "receiver").map_or(false, |r| r != self.system_contract) {
                    continue;
                }

                let data = match act.get("data") {
                    Some(Value::String(hex)) => self.decode_action_data(&self.system_contract, "setabi", block_num, hex),
                    Some(obj @ Value::Object(_)) => Ok(obj.clone()),
                    _ => Err(IndexerError::Codec("setabi without data".into())),
                };
                let data = match data {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(block_num, error = %e, "Undecodable setabi, ABI history has a gap");
                        continue;
                    }
                };
                let (Some(account), Some(abi_hex)) = (str_field(&data, "account"), str_field(&data, "abi")) else {
                    warn!(block_num, "setabi without account or abi");
                    continue;
                };

                let payload = AbiPayload::Hex(abi_hex.to_string());
                match self.resolver.set(account, block_num, payload.clone()) {
                    Ok(_) => info!(account, block_num, "ABI updated"),
                    Err(e @ IndexerError::AbiNotRetained { .. }) => {
                        warn!(account, block_num, error = %e, "ABI version not kept in memory")
                    }
                    Err(e) => warn!(account, block_num, error = %e, "ABI update rejected, records will be flagged"),
                }
                updates.push(AbiUpdate {
                    account: account.to_string(),
                    block_num,
                    payload,
                });
            }
        }
        updates
    }

    // ─── Stage 3 ─────────────────────────────────────────────────────────────

    pub fn decode_records(&self, segments: BlockSegments, abis: Vec<AbiUpdate>) -> DecodedBlock {
        let mut out = DecodedBlock {
            block: segments.block,
            transactions: vec![],
            actions: vec![],
            deltas: vec![],
            accounts: vec![],
            abis,
            stats: DecodeStats::default(),
            abi_scan: self.features.abi_scan_mode,
        };
        if out.abi_scan {
            return out;
        }
        for trx in &segments.traces {
            self.decode_transaction(trx, &mut out);
        }
        if self.features.index_deltas || self.features.token_accounts {
            for delta in &segments.deltas {
                self.decode_table_delta(delta, &mut out);
            }
        }
        if out.stats.flagged > 0 || out.stats.transform_errors > 0 {
            debug!(block_num = out.block.num, stats = ?out.stats, "Block decoded with flagged records");
        }
        out
    }

    fn decode_transaction(&self, trx: &Value, out: &mut DecodedBlock) {
        if !executed(trx) {
            out.stats.skipped_transactions += 1;
            return;
        }
        let block = &out.block;
        let trx_id = str_field(trx, "id").unwrap_or_default().to_string();
        let cpu_usage_us = u32_field(trx, "cpu_usage_us");
        let net_usage_words = u32_field(trx, "net_usage_words");
        let usage_out_of_range = cpu_usage_us.is_err() || net_usage_words.is_err();
        if usage_out_of_range {
            warn!(block_num = block.num, trx_id = %trx_id, "Transaction usage out of range");
        }

        // Notified copies of one action share its digest; merge their receipts.
        let mut records: Vec<ActionTrace> = vec![];
        let mut by_digest: HashMap<String, usize> = HashMap::new();
        for trace in flatten_action_traces(trx) {
            let Some(receipt) = trace.get("receipt").filter(|r| !r.is_null()).map(variant_body) else {
                continue;
            };
            let digest = str_field(receipt, "act_digest").unwrap_or_default().to_string();
            let receipt = parse_receipt(receipt, trace);
            if let Some(&idx) = by_digest.get(&digest) {
                records[idx].receipts.push(receipt);
                continue;
            }

            let act = trace.get("act").cloned().unwrap_or(Value::Null);
            let (raw_data, data) = match act.get("data") {
                Some(Value::String(hex)) => (hex.clone(), None),
                Some(other) if !other.is_null() => (String::new(), Some(other.clone())),
                _ => (String::new(), None),
            };
            let authorization: Vec<PermissionLevel> = act
                .get("authorization")
                .cloned()
                .and_then(|a| serde_json::from_value(a).ok())
                .unwrap_or_default();

            let action_ordinal = u32_field(trace, "action_ordinal");
            let creator_action_ordinal = u32_field(trace, "creator_action_ordinal");
            let out_of_range = usage_out_of_range || action_ordinal.is_err() || creator_action_ordinal.is_err();

            by_digest.insert(digest.clone(), records.len());
            records.push(ActionTrace {
                trx_id: trx_id.clone(),
                block_num: block.num,
                block_id: block.id.clone(),
                timestamp: block.timestamp.clone(),
                producer: block.producer.clone(),
                action_ordinal: action_ordinal.unwrap_or(0),
                creator_action_ordinal: creator_action_ordinal.unwrap_or(0),
                account: str_field(&act, "account").unwrap_or_default().to_string(),
                name: str_field(&act, "name").unwrap_or_default().to_string(),
                authorization,
                act_digest: digest,
                global_sequence: receipt.global_sequence,
                receipts: vec![receipt],
                raw_data,
                data,
                ds_error: out_of_range,
                transform_error: None,
                derived: serde_json::Map::new(),
            });
        }

        out.transactions.push(TransactionSummary {
            id: trx_id,
            block_num: block.num,
            timestamp: block.timestamp.clone(),
            status: status_name(trx),
            cpu_usage_us: cpu_usage_us.unwrap_or(u32::MAX),
            net_usage_words: net_usage_words.unwrap_or(u32::MAX),
            action_count: u32::try_from(records.len()).unwrap_or(u32::MAX),
        });

        let block_num = out.block.num;
        for mut record in records {
            if !self.filters.actions.admits(&self.chain, &record.account, &record.name) {
                out.stats.filtered += 1;
                continue;
            }
            if record.ds_error {
                out.stats.flagged += 1;
            }
            if record.data.is_none() {
                match self.decode_action_data(&record.account, &record.name, block_num, &record.raw_data) {
                    Ok(data) => record.data = Some(data),
                    Err(e) => {
                        debug!(
                            block_num,
                            account = %record.account,
                            name = %record.name,
                            error = %e,
                            "Action left undecoded"
                        );
                        if !record.ds_error {
                            record.ds_error = true;
                            out.stats.flagged += 1;
                        }
                    }
                }
            }
            self.registry.apply_action(&mut record);
            if record.transform_error.is_some() {
                out.stats.transform_errors += 1;
            }
            out.actions.push(record);
        }
    }

    fn decode_table_delta(&self, delta: &Value, out: &mut DecodedBlock) {
        if str_field(delta, "name") != Some("contract_row") {
            return;
        }
        let Some(rows) = delta.get("rows").and_then(Value::as_array) else {
            return;
        };
        let codec = self.resolver.codec();
        let block_num = out.block.num;

        for row in rows {
            let present = match row.get("present") {
                Some(Value::Bool(b)) => *b,
                Some(Value::Number(n)) => n.as_u64().map_or(false, |n| n != 0),
                _ => false,
            };
            let Some(row_hex) = str_field(row, "data") else {
                out.stats.dropped_rows += 1;
                continue;
            };
            let envelope = match codec.hex_to_json(SHIP_CONTRACT, "contract_row", row_hex) {
                Ok(v) => v,
                Err(e) => {
                    warn!(block_num, error = %e, "Unreadable contract row");
                    out.stats.dropped_rows += 1;
                    continue;
                }
            };
            let envelope = variant_body(&envelope);
            let code = str_field(envelope, "code").unwrap_or_default();
            let table = str_field(envelope, "table").unwrap_or_default();

            if !self.delta_wanted(code, table) {
                continue;
            }
            if !self.filters.deltas.admits(&self.chain, code, table) {
                out.stats.filtered += 1;
                continue;
            }

            let raw_value = str_field(envelope, "value").unwrap_or_default().to_string();
            let mut record = TableDelta {
                block_num,
                block_id: out.block.id.clone(),
                timestamp: out.block.timestamp.clone(),
                code: code.to_string(),
                scope: str_field(envelope, "scope").unwrap_or_default().to_string(),
                table: table.to_string(),
                payer: str_field(envelope, "payer").unwrap_or_default().to_string(),
                primary_key: u64_field(envelope, "primary_key").unwrap_or(0).to_string(),
                present,
                data: None,
                ds_error: false,
                transform_error: None,
                derived: serde_json::Map::new(),
                raw_value,
            };
            match self.decode_row(&record.code, &record.table, block_num, &record.raw_value) {
                Ok(data) => record.data = Some(data),
                Err(e) => {
                    debug!(block_num, code = %record.code, table = %record.table, error = %e, "Row left undecoded");
                    record.ds_error = true;
                    out.stats.flagged += 1;
                }
            }
            self.registry.apply_delta(&mut record);
            if record.transform_error.is_some() {
                out.stats.transform_errors += 1;
            }

            if self.features.token_accounts {
                if let Some(doc) = record.to_account_document() {
                    out.accounts.push(doc);
                }
            }
            if self.features.index_deltas {
                out.deltas.push(record);
            }
        }
    }

    fn delta_wanted(&self, code: &str, table: &str) -> bool {
        self.features.index_all_deltas || code == self.system_contract || table == "accounts"
    }

    // ─── Payload decoding ────────────────────────────────────────────────────

    /// Decode action data with the ABI valid at `block_num`. If that fails and
    /// the ABI changed at this height, the version valid at `block_num - 1` is
    /// tried, since actions that ran before the update in the same block were
    /// serialized with it.
    fn decode_action_data(&self, account: &str, name: &str, block_num: u32, hex: &str) -> Result<Value, IndexerError> {
        self.decode_with_fallback(account, block_num, |entry| {
            let key = entry.codec_key();
            let codec = self.resolver.codec();
            let type_name = codec.get_type_for_action(&key, name)?;
            codec.hex_to_json(&key, &type_name, hex)
        })
    }

    fn decode_row(&self, code: &str, table: &str, block_num: u32, hex: &str) -> Result<Value, IndexerError> {
        self.decode_with_fallback(code, block_num, |entry| {
            let key = entry.codec_key();
            let codec = self.resolver.codec();
            let type_name = codec.get_type_for_table(&key, table)?;
            codec.hex_to_json(&key, &type_name, hex)
        })
    }

    fn decode_with_fallback(
        &self,
        account: &str,
        block_num: u32,
        decode: impl Fn(&AbiEntry) -> Result<Value, IndexerError>,
    ) -> Result<Value, IndexerError> {
        let first = match self.resolver.get(account, block_num) {
            Ok(entry) => match decode(entry.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            },
            Err(e @ IndexerError::AbiNotFound { .. }) => return Err(e),
            Err(e) => e,
        };
        if block_num == 0 {
            return Err(first);
        }
        match self.resolver.get(account, block_num - 1) {
            Ok(prev) if !prev.covers(block_num) => decode(prev.as_ref()).map_err(|_| first),
            _ => Err(first),
        }
    }
}

// ─── JSON helpers ────────────────────────────────────────────────────────────

fn header_error(block_num: u32, reason: impl std::fmt::Display) -> IndexerError {
    IndexerError::HeaderDecode {
        block_num,
        reason: reason.to_string(),
    }
}

/// `["name_v0", {...}]` → `{...}`; anything else unchanged.
fn variant_body(value: &Value) -> &Value {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(_), body]) => body,
        _ => value,
    }
}

fn into_variant_body(value: Value) -> Value {
    match value {
        Value::Array(mut items) if items.len() == 2 && items[0].is_string() => items.pop().unwrap_or(Value::Null),
        other => other,
    }
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field)?.as_str()
}

/// 64-bit integers arrive as numbers or decimal strings.
fn u64_field(value: &Value, field: &str) -> Option<u64> {
    match value.get(field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A missing field reads as 0; a value that does not fit is returned as the error.
fn u32_field(value: &Value, field: &str) -> Result<u32, u64> {
    match u64_field(value, field) {
        None => Ok(0),
        Some(v) => u32::try_from(v).map_err(|_| v),
    }
}

fn status_name(trx: &Value) -> String {
    match trx.get("status") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => "executed",
            Some(1) => "soft_fail",
            Some(2) => "hard_fail",
            Some(3) => "delayed",
            Some(4) => "expired",
            _ => "unknown",
        }
        .to_string(),
        _ => "unknown".to_string(),
    }
}

fn executed(trx: &Value) -> bool {
    status_name(trx) == "executed"
}

/// Action traces of a transaction in ordinal order, including traces nested
/// under `inline_traces` by older nodes.
fn flatten_action_traces(trx: &Value) -> Vec<&Value> {
    fn walk<'a>(traces: &'a [Value], out: &mut Vec<&'a Value>) {
        for trace in traces {
            let body = variant_body(trace);
            out.push(body);
            if let Some(inline) = body.get("inline_traces").and_then(Value::as_array) {
                walk(inline, out);
            }
        }
    }
    let mut out = vec![];
    if let Some(traces) = trx.get("action_traces").and_then(Value::as_array) {
        walk(traces, &mut out);
    }
    out
}

fn parse_receipt(receipt: &Value, trace: &Value) -> ActionReceipt {
    let auth_sequence = receipt
        .get("auth_sequence")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|a| {
                    Some(AuthSequence {
                        account: str_field(a, "account")?.to_string(),
                        sequence: u64_field(a, "sequence")?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    ActionReceipt {
        receiver: str_field(receipt, "receiver")
            .or_else(|| str_field(trace, "receiver"))
            .unwrap_or_default()
            .to_string(),
        global_sequence: u64_field(receipt, "global_sequence").unwrap_or(0),
        recv_sequence: u64_field(receipt, "recv_sequence").unwrap_or(0),
        auth_sequence,
    }
}
