//! Indexer configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::filter::Filters;
use crate::retry::RetryConfig;
use crate::transform::TransformContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Chain short name; used for checkpoint keys and module selection.
    #[serde(default = "default_chain")]
    pub chain: String,
    /// Expected chain id. Endpoints reporting another one are rejected.
    #[serde(default)]
    pub chain_id: Option<String>,
    #[serde(default = "default_parser_version")]
    pub parser_version: String,
    #[serde(default = "default_system_contract")]
    pub system_contract: String,
    /// First block to index; `0` means the first block the node has traces for.
    #[serde(default)]
    pub start_block: u32,
    /// Stop after this block (exclusive). `None` keeps following the chain.
    #[serde(default)]
    pub stop_block: Option<u32>,
    /// Start a live reader once backfill completes.
    #[serde(default = "default_true")]
    pub live: bool,
    #[serde(default)]
    pub ship: ShipConfig,
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub abi: AbiCacheConfig,
    #[serde(default)]
    pub filters: Filters,
    /// Stream reconnect backoff.
    #[serde(default)]
    pub reconnect: RetryConfig,
    /// Index write backoff before dead-lettering.
    #[serde(default)]
    pub write_retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipConfig {
    /// State-history websocket endpoints, in failover order.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_max_payload_mb")]
    pub max_payload_mb: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub fetch_block: bool,
    #[serde(default = "default_true")]
    pub fetch_traces: bool,
    #[serde(default = "default_true")]
    pub fetch_deltas: bool,
}

impl Default for ShipConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            max_payload_mb: default_max_payload_mb(),
            connect_timeout_ms: default_connect_timeout_ms(),
            fetch_block: true,
            fetch_traces: true,
            fetch_deltas: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// `max_messages_in_flight` of each stream request.
    #[serde(default = "default_read_prefetch")]
    pub read: u32,
    /// Capacity of the raw block queue.
    #[serde(default = "default_block_prefetch")]
    pub block: usize,
    /// Capacity of each entity queue.
    #[serde(default = "default_index_prefetch")]
    pub index: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            read: default_read_prefetch(),
            block: default_block_prefetch(),
            index: default_index_prefetch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Parallel backfill readers.
    #[serde(default = "default_readers")]
    pub readers: usize,
    #[serde(default = "default_ds_workers")]
    pub ds_workers: usize,
    #[serde(default = "default_one")]
    pub indexers_per_entity: usize,
    /// Blocks per backfill range. Checkpoints saved under a different value
    /// are still honored on restart.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Documents per bulk write.
    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Failures after which a worker is retired.
    #[serde(default = "default_max_worker_failures")]
    pub max_worker_failures: u32,
    /// Header decode attempts before a block is escalated.
    #[serde(default = "default_header_retries")]
    pub header_retries: u32,
    /// Save a reader checkpoint every N indexed blocks.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
    /// Upper bound on tracked reversible blocks.
    #[serde(default = "default_reversible_window")]
    pub reversible_window: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            readers: default_readers(),
            ds_workers: default_ds_workers(),
            indexers_per_entity: default_one(),
            batch_size: default_batch_size(),
            index_batch_size: default_index_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_worker_failures: default_max_worker_failures(),
            header_retries: default_header_retries(),
            checkpoint_interval: default_checkpoint_interval(),
            reversible_window: default_reversible_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default)]
    pub index_transfer_memo: bool,
    #[serde(default = "default_true")]
    pub index_deltas: bool,
    /// Index every contract row, not only system and `accounts` rows.
    #[serde(default)]
    pub index_all_deltas: bool,
    /// Maintain token balance state from `accounts` rows.
    #[serde(default = "default_true")]
    pub token_accounts: bool,
    /// Only collect ABI history.
    #[serde(default)]
    pub abi_scan_mode: bool,
    /// Scan the backfill interval for ABI updates before readers run in
    /// parallel. Without it a record can be decoded before an ABI update
    /// streamed by another reader at a lower block is applied.
    #[serde(default = "default_true")]
    pub abi_prescan: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            index_transfer_memo: false,
            index_deltas: true,
            index_all_deltas: false,
            token_accounts: true,
            abi_scan_mode: false,
            abi_prescan: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbiCacheConfig {
    /// ABI versions kept in memory per account.
    #[serde(default = "default_abi_retention")]
    pub retention: usize,
}

impl Default for AbiCacheConfig {
    fn default() -> Self {
        Self {
            retention: default_abi_retention(),
        }
    }
}

fn default_chain() -> String {
    "eos".into()
}
fn default_parser_version() -> String {
    "3.2".into()
}
fn default_system_contract() -> String {
    "eosio".into()
}
fn default_true() -> bool {
    true
}
fn default_one() -> usize {
    1
}
fn default_endpoints() -> Vec<String> {
    vec!["ws://127.0.0.1:8080".into()]
}
fn default_max_payload_mb() -> usize {
    256
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_read_prefetch() -> u32 {
    50
}
fn default_block_prefetch() -> usize {
    100
}
fn default_index_prefetch() -> usize {
    500
}
fn default_readers() -> usize {
    2
}
fn default_ds_workers() -> usize {
    4
}
fn default_batch_size() -> u32 {
    5_000
}
fn default_index_batch_size() -> usize {
    1_000
}
fn default_flush_interval_ms() -> u64 {
    1_000
}
fn default_max_worker_failures() -> u32 {
    3
}
fn default_header_retries() -> u32 {
    3
}
fn default_checkpoint_interval() -> u32 {
    100
}
fn default_reversible_window() -> usize {
    1_000
}
fn default_abi_retention() -> usize {
    16
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            chain_id: None,
            parser_version: default_parser_version(),
            system_contract: default_system_contract(),
            start_block: 0,
            stop_block: None,
            live: true,
            ship: ShipConfig::default(),
            prefetch: PrefetchConfig::default(),
            scaling: ScalingConfig::default(),
            features: FeatureConfig::default(),
            abi: AbiCacheConfig::default(),
            filters: Filters::default(),
            reconnect: RetryConfig::default(),
            write_retry: RetryConfig::default(),
        }
    }
}

impl IndexerConfig {
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| IndexerError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| IndexerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        let fail = |msg: &str| Err(IndexerError::Config(msg.to_string()));
        if self.ship.endpoints.is_empty() {
            return fail("ship.endpoints must not be empty");
        }
        if self.prefetch.read == 0 {
            return fail("prefetch.read must be at least 1");
        }
        if self.scaling.readers == 0 || self.scaling.ds_workers == 0 || self.scaling.indexers_per_entity == 0 {
            return fail("scaling worker counts must be at least 1");
        }
        if self.scaling.batch_size == 0 || self.scaling.index_batch_size == 0 {
            return fail("batch sizes must be at least 1");
        }
        if let Some(stop) = self.stop_block {
            if stop <= self.start_block {
                return fail("stop_block must be greater than start_block");
            }
        }
        if !self.ship.fetch_traces && !self.ship.fetch_deltas && !self.ship.fetch_block {
            return fail("at least one of fetch_block, fetch_traces, fetch_deltas must be set");
        }
        Ok(())
    }

    pub fn transform_context(&self) -> TransformContext {
        TransformContext {
            chain: self.chain.clone(),
            parser_version: self.parser_version.clone(),
            index_transfer_memo: self.features.index_transfer_memo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let cfg = IndexerConfig::from_json("{}").unwrap();
        assert_eq!(cfg.prefetch.read, 50);
        assert_eq!(cfg.scaling.readers, 2);
        assert!(cfg.ship.fetch_traces);
        assert!(!cfg.features.index_transfer_memo);
    }

    #[test]
    fn nested_overrides() {
        let cfg = IndexerConfig::from_json(
            r#"{
                "chain": "wax",
                "ship": { "endpoints": ["ws://a:8080", "ws://b:8080"] },
                "features": { "index_transfer_memo": true },
                "filters": { "actions": { "blacklist": ["*::eosio::onblock"] } }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.ship.endpoints.len(), 2);
        assert_eq!(cfg.ship.max_payload_mb, 256);
        assert!(cfg.transform_context().index_transfer_memo);
        assert!(!cfg.filters.actions.admits("wax", "eosio", "onblock"));
    }

    #[test]
    fn rejects_invalid() {
        assert!(IndexerConfig::from_json(r#"{"prefetch": {"read": 0}}"#).is_err());
        assert!(IndexerConfig::from_json(r#"{"start_block": 10, "stop_block": 5}"#).is_err());
        assert!(IndexerConfig::from_json(r#"{"ship": {"endpoints": []}}"#).is_err());
        assert!(IndexerConfig::from_json("not json").is_err());
    }
}
