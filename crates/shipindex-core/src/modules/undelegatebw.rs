use serde_json::{json, Value};

use super::{asset_pair, PARSER_VERSIONS};
use crate::error::IndexerError;
use crate::transform::{TransformContext, TransformModule, TransformRecord};

/// `undelegatebw` on the system contract. Quantities are only split out when
/// both are present; the raw action data is dropped.
pub fn undelegatebw(system_contract: &str) -> TransformModule {
    TransformModule::action("undelegatebw", system_contract, "undelegatebw", handle)
        .parser_versions(PARSER_VERSIONS)
        .mappings(json!({
            "@undelegatebw": {
                "properties": {
                    "from":                 { "type": "keyword" },
                    "receiver":             { "type": "keyword" },
                    "unstake_cpu_quantity": { "type": "float" },
                    "unstake_net_quantity": { "type": "float" },
                    "amount":               { "type": "float" }
                }
            }
        }))
}

fn handle(rec: &mut TransformRecord<'_>, _: &TransformContext) -> Result<(), IndexerError> {
    let split = asset_pair(rec.data, "unstake_cpu_quantity", "unstake_net_quantity")?;
    let (cpu, net) = match split {
        Some((cpu, net)) => (json!(cpu), json!(net)),
        None => (Value::Null, Value::Null),
    };

    let derived = json!({
        "amount": split.map_or(0.0, |(cpu, net)| cpu + net),
        "unstake_cpu_quantity": cpu,
        "unstake_net_quantity": net,
        "from": rec.data.get("from").cloned().unwrap_or(Value::Null),
        "receiver": rec.data.get("receiver").cloned().unwrap_or(Value::Null),
    });
    rec.derived.insert("@undelegatebw".into(), derived);
    rec.data.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn run(data: Value) -> (Map<String, Value>, Map<String, Value>) {
        let mut data = data.as_object().cloned().unwrap();
        let mut derived = Map::new();
        let mut rec = TransformRecord {
            contract: "eosio",
            name: "undelegatebw",
            block_num: 1,
            data: &mut data,
            derived: &mut derived,
        };
        handle(&mut rec, &TransformContext::default()).unwrap();
        (data, derived)
    }

    #[test]
    fn sums_unstake_and_drops_data() {
        let (data, derived) = run(json!({
            "from": "alice",
            "receiver": "bob",
            "unstake_net_quantity": "1.5000 EOS",
            "unstake_cpu_quantity": "0.5000 EOS"
        }));
        assert!(data.is_empty());
        assert_eq!(derived["@undelegatebw"]["amount"], json!(2.0));
        assert_eq!(derived["@undelegatebw"]["unstake_cpu_quantity"], json!(0.5));
        assert_eq!(derived["@undelegatebw"]["from"], json!("alice"));
    }

    #[test]
    fn one_sided_unstake_keeps_no_quantities() {
        let (_, derived) = run(json!({"from": "alice", "receiver": "alice", "unstake_cpu_quantity": "1.0000 EOS"}));
        assert_eq!(derived["@undelegatebw"]["amount"], json!(0.0));
        assert!(derived["@undelegatebw"]["unstake_net_quantity"].is_null());
    }
}
