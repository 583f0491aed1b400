//! Boundary to the external ABI codec.
//!
//! The binary layout rules belong to the chain; this crate only calls into an
//! implementation of [`AbiCodec`] (an abieos binding in production).

use serde_json::Value;

use crate::error::IndexerError;

/// Contract key under which the state-history protocol ABI is loaded.
pub const SHIP_CONTRACT: &str = "0";

/// Name/hex/json/bin conversions keyed by contract and type.
///
/// Implementations must be safe to call from many deserializer workers at
/// once. Contracts are identified by an opaque key; the resolver loads each
/// ABI version under its own key (`account@block`).
pub trait AbiCodec: Send + Sync {
    fn string_to_name(&self, name: &str) -> Result<u64, IndexerError>;

    fn bin_to_json(&self, contract: &str, type_name: &str, data: &[u8]) -> Result<Value, IndexerError>;

    fn json_to_hex(&self, contract: &str, type_name: &str, json: &Value) -> Result<String, IndexerError>;

    fn hex_to_json(&self, contract: &str, type_name: &str, hex: &str) -> Result<Value, IndexerError>;

    /// Load an ABI given as JSON text. Fails with [`IndexerError::AbiLoad`].
    fn load_abi(&self, contract: &str, abi_json: &str) -> Result<(), IndexerError>;

    /// Load an ABI given as hex of its binary form.
    fn load_abi_hex(&self, contract: &str, abi_hex: &str) -> Result<(), IndexerError>;

    fn get_type_for_action(&self, contract: &str, action: &str) -> Result<String, IndexerError>;

    fn get_type_for_table(&self, contract: &str, table: &str) -> Result<String, IndexerError>;

    /// Drop a loaded contract. Returns `false` if it was not loaded.
    fn delete_contract(&self, contract: &str) -> bool;
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! A codec double whose "binary" encoding is UTF-8 JSON.

    use std::collections::HashMap;

    use parking_lot::RwLock;
    use serde_json::Value;

    use super::AbiCodec;
    use crate::error::IndexerError;

    #[derive(Debug, Default, Clone)]
    struct LoadedAbi {
        actions: HashMap<String, String>,
        tables: HashMap<String, String>,
    }

    /// Accepts ABI JSON of the usual `{actions:[{name,type}], tables:[{name,type}]}`
    /// shape; any other JSON object loads with no actions or tables, and
    /// non-JSON fails.
    #[derive(Debug, Default)]
    pub struct MockCodec {
        contracts: RwLock<HashMap<String, LoadedAbi>>,
    }

    impl MockCodec {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn is_loaded(&self, contract: &str) -> bool {
            self.contracts.read().contains_key(contract)
        }

        pub fn loaded_count(&self) -> usize {
            self.contracts.read().len()
        }

        fn require(&self, contract: &str) -> Result<(), IndexerError> {
            if self.is_loaded(contract) {
                Ok(())
            } else {
                Err(IndexerError::Codec(format!("contract '{contract}' not loaded")))
            }
        }

        fn pairs(abi: &Value, field: &str) -> HashMap<String, String> {
            abi.get(field)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| {
                            let name = item.get("name")?.as_str()?;
                            let ty = item.get("type")?.as_str()?;
                            Some((name.to_string(), ty.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    impl AbiCodec for MockCodec {
        fn string_to_name(&self, name: &str) -> Result<u64, IndexerError> {
            if name.len() > 13 {
                return Err(IndexerError::Codec(format!("invalid name '{name}'")));
            }
            Ok(name.bytes().fold(0u64, |acc, b| acc.wrapping_mul(37).wrapping_add(b as u64)))
        }

        fn bin_to_json(&self, contract: &str, type_name: &str, data: &[u8]) -> Result<Value, IndexerError> {
            self.require(contract)?;
            serde_json::from_slice(data)
                .map_err(|e| IndexerError::Codec(format!("{contract}::{type_name}: {e}")))
        }

        fn json_to_hex(&self, contract: &str, _type_name: &str, json: &Value) -> Result<String, IndexerError> {
            self.require(contract)?;
            Ok(hex::encode(json.to_string()))
        }

        fn hex_to_json(&self, contract: &str, type_name: &str, hex_data: &str) -> Result<Value, IndexerError> {
            let bytes = hex::decode(hex_data)
                .map_err(|e| IndexerError::Codec(format!("{contract}::{type_name}: {e}")))?;
            self.bin_to_json(contract, type_name, &bytes)
        }

        fn load_abi(&self, contract: &str, abi_json: &str) -> Result<(), IndexerError> {
            let abi: Value = serde_json::from_str(abi_json).map_err(|e| IndexerError::AbiLoad {
                account: contract.to_string(),
                reason: e.to_string(),
            })?;
            if !abi.is_object() {
                return Err(IndexerError::AbiLoad {
                    account: contract.to_string(),
                    reason: "ABI is not an object".into(),
                });
            }
            let loaded = LoadedAbi {
                actions: Self::pairs(&abi, "actions"),
                tables: Self::pairs(&abi, "tables"),
            };
            self.contracts.write().insert(contract.to_string(), loaded);
            Ok(())
        }

        fn load_abi_hex(&self, contract: &str, abi_hex: &str) -> Result<(), IndexerError> {
            let bytes = hex::decode(abi_hex).map_err(|e| IndexerError::AbiLoad {
                account: contract.to_string(),
                reason: e.to_string(),
            })?;
            let text = String::from_utf8(bytes).map_err(|e| IndexerError::AbiLoad {
                account: contract.to_string(),
                reason: e.to_string(),
            })?;
            self.load_abi(contract, &text)
        }

        fn get_type_for_action(&self, contract: &str, action: &str) -> Result<String, IndexerError> {
            self.contracts
                .read()
                .get(contract)
                .and_then(|abi| abi.actions.get(action).cloned())
                .ok_or_else(|| IndexerError::Codec(format!("no action '{action}' in '{contract}'")))
        }

        fn get_type_for_table(&self, contract: &str, table: &str) -> Result<String, IndexerError> {
            self.contracts
                .read()
                .get(contract)
                .and_then(|abi| abi.tables.get(table).cloned())
                .ok_or_else(|| IndexerError::Codec(format!("no table '{table}' in '{contract}'")))
        }

        fn delete_contract(&self, contract: &str) -> bool {
            self.contracts.write().remove(contract).is_some()
        }
    }
}
