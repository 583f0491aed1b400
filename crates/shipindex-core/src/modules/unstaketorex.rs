use serde_json::{json, Value};

use super::{asset_pair, PARSER_VERSIONS};
use crate::error::IndexerError;
use crate::transform::{TransformContext, TransformModule, TransformRecord};

pub fn unstaketorex(system_contract: &str) -> TransformModule {
    TransformModule::action("unstaketorex", system_contract, "unstaketorex", handle)
        .parser_versions(PARSER_VERSIONS)
        .mappings(json!({
            "@unstaketorex": {
                "properties": {
                    "owner":    { "type": "keyword" },
                    "receiver": { "type": "keyword" },
                    "amount":   { "type": "float" }
                }
            }
        }))
}

fn handle(rec: &mut TransformRecord<'_>, _: &TransformContext) -> Result<(), IndexerError> {
    let amount = asset_pair(rec.data, "from_cpu", "from_net")?.map_or(0.0, |(cpu, net)| cpu + net);
    let derived = json!({
        "amount": amount,
        "owner": rec.data.get("owner").cloned().unwrap_or(Value::Null),
        "receiver": rec.data.get("receiver").cloned().unwrap_or(Value::Null),
    });
    rec.derived.insert("@unstaketorex".into(), derived);
    Ok(())
}
