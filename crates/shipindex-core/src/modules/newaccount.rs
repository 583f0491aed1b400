use serde_json::{json, Value};

use super::PARSER_VERSIONS;
use crate::error::IndexerError;
use crate::transform::{TransformContext, TransformModule, TransformRecord};

/// `newaccount` on the system contract. Older system contracts name the new
/// account `name` instead of `newact`; that field is moved into `@newaccount`.
pub fn newaccount(system_contract: &str) -> TransformModule {
    TransformModule::action("newaccount", system_contract, "newaccount", handle)
        .parser_versions(PARSER_VERSIONS)
        .mappings(json!({
            "@newaccount": {
                "properties": {
                    "newact": { "type": "keyword" }
                }
            }
        }))
}

fn handle(rec: &mut TransformRecord<'_>, _: &TransformContext) -> Result<(), IndexerError> {
    let name = match rec.data.get("newact") {
        Some(Value::String(name)) if !name.is_empty() => Some(Value::String(name.clone())),
        _ => rec.data.remove("name").filter(|n| !n.is_null()),
    };
    let Some(name) = name else {
        return Ok(());
    };
    let derived = json!({
        "newact": name,
        "owner": rec.data.get("owner").cloned().unwrap_or(Value::Null),
        "active": rec.data.get("active").cloned().unwrap_or(Value::Null),
    });
    rec.derived.insert("@newaccount".into(), derived);
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
            name: "newaccount",
            block_num: 1,
            data: &mut data,
            derived: &mut derived,
        };
        handle(&mut rec, &TransformContext::default()).unwrap();
        (data, derived)
    }

    #[test]
    fn newact_field() {
        let (data, derived) = run(json!({"creator": "eosio", "newact": "alice", "owner": {"threshold": 1}, "active": {"threshold": 1}}));
        assert_eq!(derived["@newaccount"]["newact"], json!("alice"));
        assert_eq!(derived["@newaccount"]["owner"]["threshold"], json!(1));
        assert_eq!(data["newact"], json!("alice"));
    }

    #[test]
    fn legacy_name_field_is_moved() {
        let (data, derived) = run(json!({"creator": "eosio", "name": "bob", "owner": {}, "active": {}}));
        assert_eq!(derived["@newaccount"]["newact"], json!("bob"));
        assert!(data.get("name").is_none());
    }

    #[test]
    fn nameless_action_is_left_alone() {
        let (data, derived) = run(json!({"creator": "eosio"}));
        assert!(derived.is_empty());
        assert_eq!(data.len(), 1);
    }
}
