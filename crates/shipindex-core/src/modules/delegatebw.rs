use serde_json::{json, Value};

use super::{parse_asset, PARSER_VERSIONS};
use crate::error::IndexerError;
use crate::transform::{TransformContext, TransformModule, TransformRecord};

pub fn delegatebw(system_contract: &str) -> TransformModule {
    TransformModule::action("delegatebw", system_contract, "delegatebw", handle)
        .parser_versions(PARSER_VERSIONS)
        .mappings(json!({
            "@delegatebw": {
                "properties": {
                    "from":               { "type": "keyword" },
                    "receiver":           { "type": "keyword" },
                    "stake_cpu_quantity": { "type": "float" },
                    "stake_net_quantity": { "type": "float" },
                    "transfer":           { "type": "boolean" },
                    "amount":             { "type": "float" }
                }
            }
        }))
}

fn handle(rec: &mut TransformRecord<'_>, _: &TransformContext) -> Result<(), IndexerError> {
    let amount_of = |field: &str| -> Result<f64, IndexerError> {
        match rec.data.get(field) {
            Some(Value::String(s)) => parse_asset(s).map(|(amount, _)| amount),
            _ => Ok(0.0),
        }
    };
    let cpu = amount_of("stake_cpu_quantity")?;
    let net = amount_of("stake_net_quantity")?;

    let derived = json!({
        "amount": cpu + net,
        "stake_cpu_quantity": cpu,
        "stake_net_quantity": net,
        "from": rec.data.get("from").cloned().unwrap_or(Value::Null),
        "receiver": rec.data.get("receiver").cloned().unwrap_or(Value::Null),
        "transfer": rec.data.get("transfer").cloned().unwrap_or(Value::Bool(false)),
    });
    rec.derived.insert("@delegatebw".into(), derived);
    rec.data.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn sums_stake() {
        let mut data = json!({
            "from": "alice",
            "receiver": "bob",
            "stake_net_quantity": "1.0000 EOS",
            "stake_cpu_quantity": "2.5000 EOS",
            "transfer": false
        })
        .as_object()
        .cloned()
        .unwrap();
        let mut derived = Map::new();
        let mut rec = TransformRecord {
            contract: "eosio",
            name: "delegatebw",
            block_num: 1,
            data: &mut data,
            derived: &mut derived,
        };
        handle(&mut rec, &TransformContext::default()).unwrap();

        assert!(data.is_empty());
        assert_eq!(derived["@delegatebw"]["amount"], json!(3.5));
        assert_eq!(derived["@delegatebw"]["receiver"], json!("bob"));
    }
}
