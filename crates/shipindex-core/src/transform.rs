//! Transform registry: per-contract enrichment of decoded records.
//!
//! Modules are indexed once at startup into a table keyed by
//! `(contract, action)` / `(contract, table)` where either side may be `*`.
//! For a record `(c, a)` the buckets are visited in this fixed order:
//!
//! ```text
//! 1. (c, a)   exact contract, exact name
//! 2. (*, a)   any contract,   exact name
//! 3. (c, *)   exact contract, any name
//! 4. (*, *)   global wildcard
//! ```
//!
//! Inside a bucket, modules declared for this chain come before `*`-chain
//! modules and shadow a `*`-chain module of the same name; remaining ties
//! are broken by module name. Registration order never matters.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::IndexerError;
use crate::types::{ActionTrace, TableDelta};

pub const WILDCARD: &str = "*";

// ─── Module declaration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKind {
    Action,
    Table,
}

/// What a handler sees: the decoded payload and the derived-field map.
pub struct TransformRecord<'a> {
    pub contract: &'a str,
    pub name: &'a str,
    pub block_num: u32,
    pub data: &'a mut Map<String, Value>,
    pub derived: &'a mut Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TransformContext {
    pub chain: String,
    pub parser_version: String,
    pub index_transfer_memo: bool,
}

pub trait TransformHandler: Send + Sync {
    fn handle(&self, record: &mut TransformRecord<'_>, ctx: &TransformContext) -> Result<(), IndexerError>;
}

impl<F> TransformHandler for F
where
    F: Fn(&mut TransformRecord<'_>, &TransformContext) -> Result<(), IndexerError> + Send + Sync,
{
    fn handle(&self, record: &mut TransformRecord<'_>, ctx: &TransformContext) -> Result<(), IndexerError> {
        self(record, ctx)
    }
}

#[derive(Clone)]
pub struct TransformModule {
    pub name: String,
    /// Chain id or `*`.
    pub chain: String,
    /// Account or `*`.
    pub contract: String,
    pub kind: TargetKind,
    /// Action or table name, or `*`.
    pub target: String,
    /// Empty means every parser version.
    pub parser_versions: Vec<String>,
    pub handler: Arc<dyn TransformHandler>,
    /// Index field mappings for the derived fields.
    pub mappings: Option<Value>,
}

impl TransformModule {
    pub fn action(
        name: impl Into<String>,
        contract: impl Into<String>,
        action: impl Into<String>,
        handler: impl TransformHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            chain: WILDCARD.into(),
            contract: contract.into(),
            kind: TargetKind::Action,
            target: action.into(),
            parser_versions: Vec::new(),
            handler: Arc::new(handler),
            mappings: None,
        }
    }

    pub fn table(
        name: impl Into<String>,
        contract: impl Into<String>,
        table: impl Into<String>,
        handler: impl TransformHandler + 'static,
    ) -> Self {
        Self {
            kind: TargetKind::Table,
            ..Self::action(name, contract, table, handler)
        }
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = chain.into();
        self
    }

    pub fn parser_versions(mut self, versions: &[&str]) -> Self {
        self.parser_versions = versions.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn mappings(mut self, mappings: Value) -> Self {
        self.mappings = Some(mappings);
        self
    }

    fn chain_specific(&self) -> bool {
        self.chain != WILDCARD
    }

    fn supports(&self, chain: &str, parser_version: &str) -> bool {
        (self.chain == WILDCARD || self.chain == chain)
            && (self.parser_versions.is_empty() || self.parser_versions.iter().any(|v| v == parser_version))
    }
}

impl std::fmt::Debug for TransformModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformModule")
            .field("name", &self.name)
            .field("chain", &self.chain)
            .field("contract", &self.contract)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .finish()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

type Key = (TargetKind, String, String);

pub struct TransformRegistry {
    ctx: TransformContext,
    table: HashMap<Key, Vec<Arc<TransformModule>>>,
}

impl TransformRegistry {
    pub fn new(ctx: TransformContext) -> Self {
        Self { ctx, table: HashMap::new() }
    }

    pub fn context(&self) -> &TransformContext {
        &self.ctx
    }

    /// Add a module. Modules for another chain or parser version are ignored.
    /// Returns `true` if the module is now active.
    pub fn register(&mut self, module: TransformModule) -> bool {
        if !module.supports(&self.ctx.chain, &self.ctx.parser_version) {
            debug!(module = %module.name, "transform module not applicable, skipped");
            return false;
        }
        let key = (module.kind, module.contract.clone(), module.target.clone());
        let bucket = self.table.entry(key).or_default();

        if let Some(existing) = bucket.iter().position(|m| m.name == module.name) {
            if bucket[existing].chain_specific() && !module.chain_specific() {
                return false;
            }
            bucket.remove(existing);
        }
        bucket.push(Arc::new(module));
        bucket.sort_by(|a, b| {
            b.chain_specific()
                .cmp(&a.chain_specific())
                .then_with(|| a.name.cmp(&b.name))
        });
        true
    }

    pub fn len(&self) -> usize {
        self.table.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Matching modules in application order.
    pub fn lookup(&self, kind: TargetKind, contract: &str, name: &str) -> Vec<Arc<TransformModule>> {
        let keys = [(contract, name), (WILDCARD, name), (contract, WILDCARD), (WILDCARD, WILDCARD)];
        let mut out = Vec::new();
        for (i, (c, n)) in keys.iter().enumerate() {
            // (*, *) would be visited twice when the record itself is a wildcard.
            if keys[..i].contains(&(*c, *n)) {
                continue;
            }
            if let Some(bucket) = self.table.get(&(kind, c.to_string(), n.to_string())) {
                out.extend(bucket.iter().cloned());
            }
        }
        out
    }

    /// Merged mappings of every active module for `kind`.
    pub fn mappings(&self, kind: TargetKind) -> Map<String, Value> {
        let mut merged = Map::new();
        let mut keys: Vec<&Key> = self.table.keys().filter(|k| k.0 == kind).collect();
        keys.sort();
        for key in keys {
            for module in &self.table[key] {
                if let Some(Value::Object(m)) = &module.mappings {
                    merged.extend(m.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        merged
    }

    /// Apply matching modules to an action. Records that failed to decode are
    /// left untouched. Returns the number of modules applied.
    pub fn apply_action(&self, trace: &mut ActionTrace) -> usize {
        if trace.ds_error {
            return 0;
        }
        let modules = self.lookup(TargetKind::Action, &trace.account, &trace.name);
        let Some(Value::Object(data)) = trace.data.as_mut() else {
            return 0;
        };
        match self.run(&modules, &trace.account, &trace.name, trace.block_num, data, &mut trace.derived) {
            Ok(n) => n,
            Err(reason) => {
                trace.transform_error = Some(reason);
                0
            }
        }
    }

    pub fn apply_delta(&self, delta: &mut TableDelta) -> usize {
        if delta.ds_error {
            return 0;
        }
        let modules = self.lookup(TargetKind::Table, &delta.code, &delta.table);
        let Some(Value::Object(data)) = delta.data.as_mut() else {
            return 0;
        };
        match self.run(&modules, &delta.code, &delta.table, delta.block_num, data, &mut delta.derived) {
            Ok(n) => n,
            Err(reason) => {
                delta.transform_error = Some(reason);
                0
            }
        }
    }

    /// Runs handlers in order. On the first failure the record is restored
    /// to its pre-transform state and the error message is returned.
    fn run(
        &self,
        modules: &[Arc<TransformModule>],
        contract: &str,
        name: &str,
        block_num: u32,
        data: &mut Map<String, Value>,
        derived: &mut Map<String, Value>,
    ) -> Result<usize, String> {
        if modules.is_empty() {
            return Ok(0);
        }
        let original = (data.clone(), derived.clone());

        for module in modules {
            let mut record = TransformRecord { contract, name, block_num, data, derived };
            let outcome = catch_unwind(AssertUnwindSafe(|| module.handler.handle(&mut record, &self.ctx)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };
            warn!(module = %module.name, contract, name, block_num, error = %failure, "Transform failed, keeping raw record");
            *data = original.0;
            *derived = original.1;
            return Err(format!("{}: {failure}", module.name));
        }
        Ok(modules.len())
    }
}
