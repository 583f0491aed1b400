//! Built-in transform modules.

mod accounts;
mod delegatebw;
mod newaccount;
mod transfer;
mod undelegatebw;
mod unstaketorex;
mod updateauth;
mod voteproducer;
mod voters;

use serde_json::{Map, Value};

use crate::error::IndexerError;
use crate::transform::TransformModule;

pub use accounts::accounts_table;
pub use delegatebw::delegatebw;
pub use newaccount::newaccount;
pub use transfer::transfer;
pub use undelegatebw::undelegatebw;
pub use unstaketorex::unstaketorex;
pub use updateauth::updateauth;
pub use voteproducer::voteproducer;
pub use voters::voters_table;

/// Parser versions the built-in modules understand.
pub const PARSER_VERSIONS: &[&str] = &["1.7", "1.8", "2.1", "3.2"];

/// Every built-in module for a chain whose system contract is `system_contract`.
pub fn builtin(system_contract: &str) -> Vec<TransformModule> {
    vec![
        transfer(),
        delegatebw(system_contract),
        undelegatebw(system_contract),
        unstaketorex(system_contract),
        voteproducer(system_contract),
        newaccount(system_contract),
        updateauth(system_contract),
        voters_table(system_contract),
        accounts_table(),
    ]
}

/// Split an asset string such as `"12.0000 EOS"` into amount and symbol.
pub fn parse_asset(asset: &str) -> Result<(f64, String), IndexerError> {
    let mut parts = asset.split_whitespace();
    let (Some(amount), Some(symbol), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(IndexerError::Other(format!("malformed asset '{asset}'")));
    };
    let amount = amount
        .parse::<f64>()
        .map_err(|e| IndexerError::Other(format!("malformed asset '{asset}': {e}")))?;
    Ok((amount, symbol.to_string()))
}

/// Amounts of two asset fields, or `None` unless both are present.
fn asset_pair(data: &Map<String, Value>, first: &str, second: &str) -> Result<Option<(f64, f64)>, IndexerError> {
    match (data.get(first), data.get(second)) {
        (Some(Value::String(a)), Some(Value::String(b))) => Ok(Some((parse_asset(a)?.0, parse_asset(b)?.0))),
        _ => Ok(None),
    }
}

/// Numeric field that may arrive as a JSON number or a decimal string.
fn as_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assets() {
        assert_eq!(parse_asset("12.0000 EOS").unwrap(), (12.0, "EOS".to_string()));
        assert_eq!(parse_asset("0.5 WAX").unwrap(), (0.5, "WAX".to_string()));
        assert!(parse_asset("12.0000").is_err());
        assert!(parse_asset("abc EOS").is_err());
        assert!(parse_asset("1 EOS extra").is_err());
    }

    #[test]
    fn builtin_covers_system_actions() {
        let names: Vec<String> = builtin("eosio").into_iter().map(|m| m.name).collect();
        for expected in ["transfer", "delegatebw", "undelegatebw", "unstaketorex", "voteproducer", "newaccount", "updateauth"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
