use serde_json::{json, Value};

use super::{parse_asset, PARSER_VERSIONS};
use crate::error::IndexerError;
use crate::transform::{TransformContext, TransformModule, TransformRecord, WILDCARD};

/// `transfer` on any contract: moves `from`/`to` and the parsed quantity into
/// `@transfer`. The memo is indexed only when `index_transfer_memo` is on and
/// is dropped otherwise.
pub fn transfer() -> TransformModule {
    TransformModule::action("transfer", WILDCARD, "transfer", handle)
        .parser_versions(PARSER_VERSIONS)
        .mappings(json!({
            "@transfer": {
                "properties": {
                    "from":   { "type": "keyword" },
                    "to":     { "type": "keyword" },
                    "amount": { "type": "float" },
                    "symbol": { "type": "keyword" },
                    "memo":   { "type": "text" }
                }
            }
        }))
}

fn handle(rec: &mut TransformRecord<'_>, ctx: &TransformContext) -> Result<(), IndexerError> {
    let quantity = match (rec.data.get("quantity"), rec.data.get("value")) {
        (Some(Value::String(q)), _) => q.clone(),
        (_, Some(Value::String(v))) => v.clone(),
        _ => return Ok(()),
    };
    let (amount, symbol) = parse_asset(&quantity)?;

    let text = |v: Option<Value>| match v {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let from = text(rec.data.remove("from"));
    let to = text(rec.data.remove("to"));
    rec.data.remove("quantity");
    rec.data.remove("value");

    let mut derived = json!({
        "from": from,
        "to": to,
        "amount": amount,
        "symbol": symbol,
    });
    let memo = rec.data.remove("memo");
    if ctx.index_transfer_memo {
        derived["memo"] = memo.unwrap_or(Value::String(String::new()));
    }
    rec.derived.insert("@transfer".into(), derived);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{TransformContext, TransformRegistry};
    use crate::types::ActionTrace;
    use serde_json::Map;

    fn registry(memo: bool) -> TransformRegistry {
        let mut reg = TransformRegistry::new(TransformContext {
            chain: "eos".into(),
            parser_version: "3.2".into(),
            index_transfer_memo: memo,
        });
        reg.register(transfer());
        reg
    }

    fn trace(data: Value) -> ActionTrace {
        ActionTrace {
            trx_id: "t".into(),
            block_num: 5,
            block_id: "b".into(),
            timestamp: String::new(),
            producer: String::new(),
            action_ordinal: 1,
            creator_action_ordinal: 0,
            account: "eosio.token".into(),
            name: "transfer".into(),
            authorization: vec![],
            act_digest: String::new(),
            global_sequence: 9,
            receipts: vec![],
            raw_data: String::new(),
            data: Some(data),
            ds_error: false,
            transform_error: None,
            derived: Map::new(),
        }
    }

    #[test]
    fn splits_quantity_and_drops_memo() {
        let mut t = trace(json!({"quantity": "12.0000 EOS", "from": "a", "to": "b", "memo": "x"}));
        assert_eq!(registry(false).apply_action(&mut t), 1);

        assert_eq!(
            t.derived["@transfer"],
            json!({"from": "a", "to": "b", "amount": 12.0, "symbol": "EOS"})
        );
        assert_eq!(t.data, Some(json!({})));
        let doc = t.to_document();
        assert!(!doc.body.to_string().contains("memo"));
    }

    #[test]
    fn keeps_memo_when_enabled() {
        let mut t = trace(json!({"quantity": "1.5000 WAX", "from": "a", "to": "b", "memo": "hi"}));
        registry(true).apply_action(&mut t);
        assert_eq!(t.derived["@transfer"]["memo"], json!("hi"));
        assert_eq!(t.derived["@transfer"]["amount"], json!(1.5));
    }

    #[test]
    fn accepts_value_field() {
        let mut t = trace(json!({"value": "3 TKN", "from": "a", "to": "b"}));
        registry(false).apply_action(&mut t);
        assert_eq!(t.derived["@transfer"]["symbol"], json!("TKN"));
    }

    #[test]
    fn malformed_quantity_flags_record() {
        let raw = json!({"quantity": "lots", "from": "a", "to": "b"});
        let mut t = trace(raw.clone());
        registry(false).apply_action(&mut t);
        assert!(t.transform_error.is_some());
        assert_eq!(t.data, Some(raw));
    }
}
