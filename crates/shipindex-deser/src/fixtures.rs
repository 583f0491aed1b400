//! Builders for state-history payloads in the mock codec's encoding: binary
//! segments are UTF-8 JSON and `bytes` fields are hex of JSON.

use bytes::Bytes;
use serde_json::{json, Value};
use shipindex_core::{BlockPosition, RawBlock};

/// Protocol ABI accepted by the mock codec.
pub const SHIP_ABI: &str = r#"{"version":"eosio::abi/1.1","actions":[],"tables":[]}"#;

pub fn hex_json(value: &Value) -> String {
    hex::encode(value.to_string())
}

/// A token contract ABI: `transfer` action, `accounts` and `stat` tables.
pub fn token_abi() -> String {
    json!({
        "version": "eosio::abi/1.1",
        "actions": [{"name": "transfer", "type": "transfer"}, {"name": "issue", "type": "issue"}],
        "tables": [{"name": "accounts", "type": "account"}, {"name": "stat", "type": "currency_stats"}],
    })
    .to_string()
}

pub fn system_abi() -> String {
    json!({
        "version": "eosio::abi/1.1",
        "actions": [
            {"name": "setabi", "type": "setabi"},
            {"name": "delegatebw", "type": "delegatebw"},
            {"name": "onblock", "type": "onblock"},
            {"name": "newaccount", "type": "newaccount"},
        ],
        "tables": [{"name": "voters", "type": "voter_info"}, {"name": "global", "type": "eosio_global_state"}],
    })
    .to_string()
}

/// `setabi` action data publishing `abi_json` for `account`.
pub fn setabi_data(account: &str, abi_json: &str) -> Value {
    json!({ "account": account, "abi": hex::encode(abi_json) })
}

#[derive(Debug, Clone)]
struct PendingAction {
    account: String,
    name: String,
    data_hex: String,
    notify: Vec<String>,
    creator: u32,
}

/// One transaction trace. Each action gets one trace per receiver: the
/// contract itself first, then every notified account.
#[derive(Debug, Clone)]
pub struct TrxBuilder {
    id: String,
    status: Value,
    actions: Vec<PendingAction>,
}

impl TrxBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: json!("executed"),
            actions: vec![],
        }
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = json!(status);
        self
    }

    pub fn action(self, account: &str, name: &str, data: Value, notify: &[&str]) -> Self {
        self.raw_action(account, name, &hex_json(&data), notify, 0)
    }

    /// An action sent by the action at `creator` ordinal.
    pub fn inline(self, account: &str, name: &str, data: Value, notify: &[&str], creator: u32) -> Self {
        self.raw_action(account, name, &hex_json(&data), notify, creator)
    }

    pub fn raw_action(mut self, account: &str, name: &str, data_hex: &str, notify: &[&str], creator: u32) -> Self {
        self.actions.push(PendingAction {
            account: account.into(),
            name: name.into(),
            data_hex: data_hex.into(),
            notify: notify.iter().map(|s| s.to_string()).collect(),
            creator,
        });
        self
    }

    fn build(&self, global_sequence: &mut u64) -> Value {
        let mut traces = vec![];
        let mut ordinal = 0u32;
        for act in &self.actions {
            let first = ordinal + 1;
            let digest = hex::encode(format!("{}:{}:{}:{}", self.id, act.account, act.name, first));
            let receivers = std::iter::once(act.account.as_str()).chain(act.notify.iter().map(String::as_str));
            for (i, receiver) in receivers.enumerate() {
                ordinal += 1;
                *global_sequence += 1;
                traces.push(json!(["action_trace_v1", {
                    "action_ordinal": ordinal,
                    "creator_action_ordinal": if i == 0 { act.creator } else { first },
                    "receipt": ["action_receipt_v0", {
                        "receiver": receiver,
                        "act_digest": digest,
                        "global_sequence": global_sequence.to_string(),
                        "recv_sequence": "1",
                        "auth_sequence": [{"account": "alice", "sequence": "7"}],
                        "code_sequence": 1,
                        "abi_sequence": 1,
                    }],
                    "receiver": receiver,
                    "act": {
                        "account": act.account,
                        "name": act.name,
                        "authorization": [{"actor": "alice", "permission": "active"}],
                        "data": act.data_hex,
                    },
                    "context_free": false,
                    "elapsed": "12",
                    "console": "",
                    "account_ram_deltas": [],
                    "except": null,
                    "error_code": null,
                }]));
            }
        }
        json!(["transaction_trace_v0", {
            "id": self.id,
            "status": self.status,
            "cpu_usage_us": 150,
            "net_usage_words": 16,
            "elapsed": "300",
            "net_usage": "128",
            "scheduled": false,
            "action_traces": traces,
            "account_ram_delta": null,
            "except": null,
            "error_code": null,
            "failed_dtrx_trace": null,
            "partial": null,
        }])
    }
}

/// A block with its three segments.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    num: u32,
    producer: String,
    transactions: Vec<TrxBuilder>,
    rows: Vec<Value>,
    raw_traces: Option<Bytes>,
}

impl BlockBuilder {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            producer: "eosio".into(),
            transactions: vec![],
            rows: vec![],
            raw_traces: None,
        }
    }

    pub fn producer(mut self, producer: &str) -> Self {
        self.producer = producer.into();
        self
    }

    pub fn transaction(mut self, trx: TrxBuilder) -> Self {
        self.transactions.push(trx);
        self
    }

    pub fn row(self, code: &str, scope: &str, table: &str, primary_key: u64, present: bool, value: Value) -> Self {
        self.raw_row(code, scope, table, primary_key, present, &hex_json(&value))
    }

    pub fn raw_row(mut self, code: &str, scope: &str, table: &str, primary_key: u64, present: bool, value_hex: &str) -> Self {
        let row = json!(["contract_row_v0", {
            "code": code,
            "scope": scope,
            "table": table,
            "primary_key": primary_key.to_string(),
            "payer": scope,
            "value": value_hex,
        }]);
        self.rows.push(json!({ "present": present, "data": hex_json(&row) }));
        self
    }

    /// Replace the traces segment with arbitrary bytes.
    pub fn raw_traces(mut self, traces: &[u8]) -> Self {
        self.raw_traces = Some(Bytes::copy_from_slice(traces));
        self
    }

    /// `(block, traces, deltas)` segments.
    pub fn segments(&self, prev_id: &str) -> (Bytes, Bytes, Bytes) {
        let header = json!({
            "timestamp": format!("2024-01-01T00:00:{:02}.{:03}", (self.num / 2) % 60, (self.num % 2) * 500),
            "producer": self.producer,
            "confirmed": 0,
            "previous": prev_id,
            "schedule_version": 3,
        });

        let mut global_sequence = self.num as u64 * 1_000;
        let traces: Vec<Value> = self.transactions.iter().map(|t| t.build(&mut global_sequence)).collect();
        let traces = match &self.raw_traces {
            Some(raw) => raw.clone(),
            None => Bytes::from(Value::Array(traces).to_string()),
        };

        let deltas = if self.rows.is_empty() {
            json!([])
        } else {
            json!([["table_delta_v0", { "name": "contract_row", "rows": self.rows }]])
        };

        (
            Bytes::from(header.to_string()),
            traces,
            Bytes::from(deltas.to_string()),
        )
    }

    pub fn build(&self, id: &str, prev_id: &str) -> RawBlock {
        let (block, traces, deltas) = self.segments(prev_id);
        RawBlock {
            head: BlockPosition::new(self.num, id),
            last_irreversible: BlockPosition::new(self.num.saturating_sub(1), prev_id),
            this_block: BlockPosition::new(self.num, id),
            prev_block: Some(BlockPosition::new(self.num.saturating_sub(1), prev_id)),
            block,
            traces,
            deltas,
        }
    }
}
