use serde_json::{json, Value};

use super::parse_asset;
use crate::error::IndexerError;
use crate::transform::{TransformContext, TransformModule, TransformRecord, WILDCARD};

/// Token `accounts` rows on any contract: `balance` becomes `@accounts`.
pub fn accounts_table() -> TransformModule {
    TransformModule::table("accounts", WILDCARD, "accounts", handle)
}

fn handle(rec: &mut TransformRecord<'_>, _: &TransformContext) -> Result<(), IndexerError> {
    let Some(Value::String(balance)) = rec.data.get("balance") else {
        return Ok(());
    };
    let (amount, symbol) = parse_asset(balance)?;
    rec.derived.insert("@accounts".into(), json!({ "amount": amount, "symbol": symbol }));
    rec.data.remove("balance");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{TransformContext, TransformRegistry};
    use crate::types::{DocumentOp, EntityKind, TableDelta};
    use serde_json::Map;

    fn delta(present: bool) -> TableDelta {
        TableDelta {
            block_num: 77,
            block_id: "b".into(),
            timestamp: String::new(),
            code: "eosio.token".into(),
            scope: "alice".into(),
            table: "accounts".into(),
            payer: "alice".into(),
            primary_key: "1397703940".into(),
            present,
            raw_value: String::new(),
            data: Some(json!({"balance": "10.0000 EOS"})),
            ds_error: false,
            transform_error: None,
            derived: Map::new(),
        }
    }

    #[test]
    fn derives_account_state() {
        let mut reg = TransformRegistry::new(TransformContext::default());
        reg.register(accounts_table());

        let mut d = delta(true);
        assert_eq!(reg.apply_delta(&mut d), 1);
        let doc = d.to_account_document().unwrap();
        assert_eq!(doc.entity, EntityKind::Account);
        assert_eq!(doc.id, "eosio.token-alice-EOS");
        assert_eq!(doc.op, DocumentOp::Upsert);
        assert_eq!(doc.body["amount"], json!(10.0));

        let mut removed = delta(false);
        reg.apply_delta(&mut removed);
        assert_eq!(removed.to_account_document().unwrap().op, DocumentOp::Delete);
    }
}
