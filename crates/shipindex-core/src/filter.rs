//! Action and delta filters.
//!
//! Patterns are written `chain::contract::name`, where any segment may be
//! `*`. The blacklist always wins; a non-empty whitelist admits only matching
//! records.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::transform::WILDCARD;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilterPattern {
    pub chain: String,
    pub contract: String,
    pub name: String,
}

impl FilterPattern {
    pub fn parse(pattern: &str) -> Result<Self, IndexerError> {
        let parts: Vec<&str> = pattern.split("::").collect();
        match parts.as_slice() {
            [chain, contract, name] if !chain.is_empty() && !contract.is_empty() && !name.is_empty() => Ok(Self {
                chain: chain.to_string(),
                contract: contract.to_string(),
                name: name.to_string(),
            }),
            _ => Err(IndexerError::Config(format!(
                "filter '{pattern}' must have the form chain::contract::name"
            ))),
        }
    }

    pub fn matches(&self, chain: &str, contract: &str, name: &str) -> bool {
        let seg = |pat: &str, value: &str| pat == WILDCARD || pat == value;
        seg(&self.chain, chain) && seg(&self.contract, contract) && seg(&self.name, name)
    }
}

impl TryFrom<String> for FilterPattern {
    type Error = IndexerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FilterPattern> for String {
    fn from(p: FilterPattern) -> Self {
        format!("{}::{}::{}", p.chain, p.contract, p.name)
    }
}

/// Whitelist/blacklist pair for one record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub whitelist: Vec<FilterPattern>,
    #[serde(default)]
    pub blacklist: Vec<FilterPattern>,
}

impl RecordFilter {
    pub fn allow(mut self, pattern: &str) -> Result<Self, IndexerError> {
        self.whitelist.push(FilterPattern::parse(pattern)?);
        Ok(self)
    }

    pub fn deny(mut self, pattern: &str) -> Result<Self, IndexerError> {
        self.blacklist.push(FilterPattern::parse(pattern)?);
        Ok(self)
    }

    pub fn admits(&self, chain: &str, contract: &str, name: &str) -> bool {
        if self.blacklist.iter().any(|p| p.matches(chain, contract, name)) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.iter().any(|p| p.matches(chain, contract, name))
    }
}

/// Filters for actions (`contract::action`) and deltas (`code::table`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub actions: RecordFilter,
    #[serde(default)]
    pub deltas: RecordFilter,
}
