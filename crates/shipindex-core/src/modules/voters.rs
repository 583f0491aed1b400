use serde_json::{json, Map, Value};

use super::as_f64;
use crate::error::IndexerError;
use crate::transform::{TransformContext, TransformModule, TransformRecord};

/// `voters` rows of the system contract, reshaped under `@voters`.
pub fn voters_table(system_contract: &str) -> TransformModule {
    TransformModule::table("voters", system_contract, "voters", handle)
}

fn handle(rec: &mut TransformRecord<'_>, _: &TransformContext) -> Result<(), IndexerError> {
    let mut voters = Map::new();
    voters.insert("is_proxy".into(), rec.data.remove("is_proxy").unwrap_or(Value::Null));
    rec.data.remove("owner");

    match rec.data.remove("proxy") {
        Some(Value::String(p)) if !p.is_empty() => {
            voters.insert("proxy".into(), Value::String(p));
        }
        _ => {}
    }
    match rec.data.remove("producers") {
        Some(Value::Array(p)) if !p.is_empty() => {
            voters.insert("producers".into(), Value::Array(p));
        }
        _ => {}
    }
    for field in ["last_vote_weight", "proxied_vote_weight", "staked"] {
        let value = as_f64(rec.data.get(field));
        rec.data.remove(field);
        voters.insert(field.into(), json!(value));
    }
    rec.derived.insert("@voters".into(), Value::Object(voters));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshapes_voter_row() {
        let mut data = json!({
            "owner": "alice",
            "proxy": "",
            "producers": ["bp1", "bp2"],
            "staked": 100000,
            "last_vote_weight": "1234.5",
            "proxied_vote_weight": "0.0",
            "is_proxy": 0,
            "flags1": 0
        })
        .as_object()
        .cloned()
        .unwrap();
        let mut derived = Map::new();
        let mut rec = TransformRecord {
            contract: "eosio",
            name: "voters",
            block_num: 1,
            data: &mut data,
            derived: &mut derived,
        };
        handle(&mut rec, &TransformContext::default()).unwrap();

        assert_eq!(data, json!({"flags1": 0}).as_object().cloned().unwrap());
        let voters = &derived["@voters"];
        assert!(voters.get("proxy").is_none());
        assert_eq!(voters["producers"], json!(["bp1", "bp2"]));
        assert_eq!(voters["last_vote_weight"], json!(1234.5));
        assert_eq!(voters["staked"], json!(100000.0));
    }
}
