//! Fluent builder API for creating an [`Orchestrator`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shipindex_core::{IndexerConfig, MemoryCheckpointStore};
//! use shipindex_ship::WsTransport;
//! use shipindex_storage::MemoryStore;
//! use shipindex_worker::OrchestratorBuilder;
//! # fn codec() -> Arc<dyn shipindex_core::AbiCodec> { unimplemented!() }
//!
//! let config = IndexerConfig::default();
//! let orchestrator = OrchestratorBuilder::new()
//!     .transport(Arc::new(WsTransport::from_config(&config.ship)))
//!     .config(config)
//!     .codec(codec())
//!     .store(Arc::new(MemoryStore::new()))
//!     .checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

use shipindex_core::{
    AbiCodec, AbiPayload, CheckpointStore, DocumentStore, IndexerConfig, IndexerError, MemoryCheckpointStore,
    TransformModule,
};
use shipindex_ship::ShipTransport;

use crate::orchestrator::Orchestrator;

/// Fluent builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: IndexerConfig,
    transport: Option<Arc<dyn ShipTransport>>,
    codec: Option<Arc<dyn AbiCodec>>,
    store: Option<Arc<dyn DocumentStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    modules: Vec<TransformModule>,
    abis: Vec<(String, u32, AbiPayload)>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Connection factory for the state-history endpoints.
    pub fn transport(mut self, transport: Arc<dyn ShipTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn AbiCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Where documents, tombstones and dead letters go.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to an in-memory store, which forgets progress on exit.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Register a transform module next to the built-in ones.
    pub fn module(mut self, module: TransformModule) -> Self {
        self.modules.push(module);
        self
    }

    /// Seed an ABI version, e.g. the system contract ABI when starting past
    /// its last `setabi`.
    pub fn abi(mut self, account: impl Into<String>, valid_from: u32, payload: AbiPayload) -> Self {
        self.abis.push((account.into(), valid_from, payload));
        self
    }

    pub fn build(self) -> Result<Orchestrator, IndexerError> {
        self.config.validate()?;
        let missing = |what: &str| IndexerError::Config(format!("orchestrator needs a {what}"));
        let transport = self.transport.ok_or_else(|| missing("transport"))?;
        let codec = self.codec.ok_or_else(|| missing("codec"))?;
        let store = self.store.ok_or_else(|| missing("document store"))?;
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()));
        Ok(Orchestrator::new(
            self.config,
            transport,
            codec,
            store,
            checkpoints,
            self.modules,
            self.abis,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipindex_core::codec::mock::MockCodec;
    use shipindex_ship::transport::mock::MockShip;
    use shipindex_storage::MemoryStore;

    #[test]
    fn missing_parts_are_config_errors() {
        let err = OrchestratorBuilder::new()
            .codec(Arc::new(MockCodec::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::Config(ref m) if m.contains("transport")));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = IndexerConfig::default();
        cfg.scaling.readers = 0;
        let result = OrchestratorBuilder::new()
            .config(cfg)
            .transport(Arc::new(MockShip::new(10, 10)))
            .codec(Arc::new(MockCodec::new()))
            .store(Arc::new(MemoryStore::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builds_with_defaults() {
        let orchestrator = OrchestratorBuilder::new()
            .config(IndexerConfig {
                chain: "wax".into(),
                ..IndexerConfig::default()
            })
            .transport(Arc::new(MockShip::new(10, 10)))
            .codec(Arc::new(MockCodec::new()))
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        assert_eq!(orchestrator.config().chain, "wax");
    }
}
