use serde_json::{json, Value};

use super::PARSER_VERSIONS;
use crate::error::IndexerError;
use crate::transform::{TransformContext, TransformModule, TransformRecord};

pub fn updateauth(system_contract: &str) -> TransformModule {
    TransformModule::action("updateauth", system_contract, "updateauth", handle).parser_versions(PARSER_VERSIONS)
}

fn handle(rec: &mut TransformRecord<'_>, _: &TransformContext) -> Result<(), IndexerError> {
    let Some(Value::Object(auth)) = rec.data.get("auth") else {
        return Err(IndexerError::Transform {
            module: "updateauth".into(),
            reason: "missing auth".into(),
        });
    };
    // Empty key, account and wait lists are not indexed.
    let mut auth = auth.clone();
    auth.retain(|_, v| !v.as_array().map_or(false, Vec::is_empty));

    let derived = json!({
        "permission": rec.data.get("permission").cloned().unwrap_or(Value::Null),
        "parent": rec.data.get("parent").cloned().unwrap_or(Value::Null),
        "auth": auth,
    });
    rec.derived.insert("@updateauth".into(), derived);
    Ok(())
}
