use serde_json::{json, Value};

use super::PARSER_VERSIONS;
use crate::error::IndexerError;
use crate::transform::{TransformContext, TransformModule, TransformRecord};

pub fn voteproducer(system_contract: &str) -> TransformModule {
    TransformModule::action("voteproducer", system_contract, "voteproducer", handle)
        .parser_versions(PARSER_VERSIONS)
        .mappings(json!({
            "@voteproducer": {
                "properties": {
                    "proxy":     { "type": "keyword" },
                    "producers": { "type": "keyword" }
                }
            }
        }))
}

fn handle(rec: &mut TransformRecord<'_>, _: &TransformContext) -> Result<(), IndexerError> {
    let derived = json!({
        "proxy": rec.data.get("proxy").cloned().unwrap_or(Value::Null),
        "producers": rec.data.get("producers").cloned().unwrap_or(Value::Null),
    });
    rec.derived.insert("@voteproducer".into(), derived);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn copies_vote() {
        let mut data = json!({"voter": "alice", "proxy": "", "producers": ["bp1", "bp2"]})
            .as_object()
            .cloned()
            .unwrap();
        let mut derived = Map::new();
        let mut rec = TransformRecord {
            contract: "eosio",
            name: "voteproducer",
            block_num: 1,
            data: &mut data,
            derived: &mut derived,
        };
        handle(&mut rec, &TransformContext::default()).unwrap();

        assert_eq!(derived["@voteproducer"]["producers"], json!(["bp1", "bp2"]));
        assert_eq!(derived["@voteproducer"]["proxy"], json!(""));
        assert_eq!(data["voter"], json!("alice"));
    }
}
