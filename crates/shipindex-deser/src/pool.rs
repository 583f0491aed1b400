//! Deserializer worker pool.
//!
//! Workers share the raw block queue. Each block goes through the three
//! decoding stages, with the ABI stage taken in lane order through the
//! [`AbiSequencer`]; the resulting documents are routed to their entity
//! queues and the block's document count is reported to the
//! [`CompletionLedger`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shipindex_core::{
    CompletionLedger, Document, EntityKind, IndexerError, QueueConsumer, QueueMessage, QueueProducer, RawBlock,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::decode::{BlockDecoder, BlockSegments};
use crate::sequencer::AbiSequencer;

/// A block that could not be decoded after all retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFailure {
    pub lane: u32,
    pub sequence: u64,
    pub block_num: u32,
    pub reason: String,
}

/// Output queue per entity kind.
#[derive(Clone, Default)]
pub struct EntityQueues {
    queues: HashMap<EntityKind, QueueProducer<Document>>,
}

impl EntityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entity: EntityKind, producer: QueueProducer<Document>) -> Self {
        self.queues.insert(entity, producer);
        self
    }

    pub fn get(&self, entity: EntityKind) -> Option<&QueueProducer<Document>> {
        self.queues.get(&entity)
    }

    pub fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds: Vec<EntityKind> = self.queues.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub blocks: AtomicU64,
    pub documents: AtomicU64,
    pub failures: AtomicU64,
    pub flagged: AtomicU64,
}

pub struct DeserializerPool {
    decoder: Arc<BlockDecoder>,
    sequencer: Arc<AbiSequencer>,
    ledger: Arc<CompletionLedger>,
    queues: EntityQueues,
    header_retries: u32,
    retry_delay: Duration,
    failures: mpsc::Sender<BlockFailure>,
    stats: PoolStats,
}

impl DeserializerPool {
    pub fn new(
        decoder: Arc<BlockDecoder>,
        sequencer: Arc<AbiSequencer>,
        ledger: Arc<CompletionLedger>,
        queues: EntityQueues,
        failures: mpsc::Sender<BlockFailure>,
    ) -> Self {
        Self {
            decoder,
            sequencer,
            ledger,
            queues,
            header_retries: 3,
            retry_delay: Duration::from_millis(100),
            failures,
            stats: PoolStats::default(),
        }
    }

    /// Attempts for the header stage before a block is reported as failed.
    pub fn with_header_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.header_retries = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Start `workers` tasks draining `raw`. They exit when the queue closes
    /// or every entity queue is gone.
    pub fn spawn(self: &Arc<Self>, workers: usize, raw: QueueConsumer<RawBlock>) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|id| {
                let pool = self.clone();
                let raw = raw.clone();
                tokio::spawn(async move {
                    while let Some(msg) = raw.consume().await {
                        if let Err(e) = pool.process(msg).await {
                            error!(worker = id, error = %e, "Deserializer stopping");
                            return;
                        }
                    }
                    debug!(worker = id, "Raw block queue closed");
                })
            })
            .collect()
    }

    /// Decode one block and route its documents.
    ///
    /// Only a closed entity queue is returned as an error; decode failures
    /// are reported on the failure channel.
    pub async fn process(&self, msg: QueueMessage<RawBlock>) -> Result<(), IndexerError> {
        let QueueMessage {
            block_num,
            sequence,
            lane,
            payload,
        } = msg;

        let segments = self.decode_segments(&payload).await;

        if !self.sequencer.wait_turn(lane, sequence).await {
            debug!(lane, block_num, "Lane retired, block dropped");
            return Ok(());
        }
        let segments: BlockSegments = match segments {
            Ok(segments) => segments,
            Err(e) => {
                self.sequencer.finish(lane, sequence);
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                error!(lane, block_num, error = %e, "Block failed to decode");
                let failure = BlockFailure {
                    lane,
                    sequence,
                    block_num,
                    reason: e.to_string(),
                };
                if self.failures.send(failure).await.is_err() {
                    warn!(block_num, "Nobody is listening for block failures");
                }
                return Ok(());
            }
        };
        let abis = self.decoder.apply_abi_updates(&segments);
        self.sequencer.finish(lane, sequence);

        let decoded = self.decoder.decode_records(segments, abis);
        self.stats.flagged.fetch_add(decoded.stats.flagged as u64, Ordering::Relaxed);

        let mut routed = vec![];
        for doc in decoded.documents() {
            match self.queues.get(doc.entity) {
                Some(queue) => routed.push((queue, doc)),
                None => debug!(entity = %doc.entity, id = %doc.id, "No queue for entity, document dropped"),
            }
        }
        self.ledger.expect(lane, sequence, routed.len());
        self.stats.blocks.fetch_add(1, Ordering::Relaxed);
        self.stats.documents.fetch_add(routed.len() as u64, Ordering::Relaxed);

        for (queue, doc) in routed {
            queue
                .produce(QueueMessage {
                    block_num,
                    sequence,
                    lane,
                    payload: doc,
                })
                .await?;
        }
        Ok(())
    }

    async fn decode_segments(&self, raw: &RawBlock) -> Result<BlockSegments, IndexerError> {
        let mut attempt = 1;
        loop {
            match self.decoder.decode_segments(raw) {
                Ok(segments) => return Ok(segments),
                Err(e) if attempt < self.header_retries => {
                    warn!(block_num = raw.block_num(), attempt, error = %e, "Block decode failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{setabi_data, system_abi, token_abi, BlockBuilder, TrxBuilder, SHIP_ABI};
    use serde_json::json;
    use shipindex_core::codec::mock::MockCodec;
    use shipindex_core::codec::SHIP_CONTRACT;
    use shipindex_core::modules::builtin;
    use shipindex_core::queue::bounded;
    use shipindex_core::{AbiCodec, AbiPayload, AbiResolver, IndexerConfig, TransformRegistry};

    struct Setup {
        pool: Arc<DeserializerPool>,
        ledger: Arc<CompletionLedger>,
        resolver: Arc<AbiResolver>,
        failures: mpsc::Receiver<BlockFailure>,
        actions: QueueConsumer<Document>,
        blocks: QueueConsumer<Document>,
    }

    fn setup() -> Setup {
        let cfg = IndexerConfig::default();
        let codec = Arc::new(MockCodec::new());
        codec.load_abi(SHIP_CONTRACT, SHIP_ABI).unwrap();
        let resolver = Arc::new(AbiResolver::new(codec, 8));
        resolver.set("eosio", 1, AbiPayload::Json(system_abi())).unwrap();
        resolver.set("eosio.token", 1, AbiPayload::Json(token_abi())).unwrap();
        let mut registry = TransformRegistry::new(cfg.transform_context());
        for module in builtin(&cfg.system_contract) {
            registry.register(module);
        }
        let decoder = Arc::new(BlockDecoder::new(resolver.clone(), Arc::new(registry), &cfg));

        let (action_tx, actions) = bounded("action", 64);
        let (block_tx, blocks) = bounded("block", 64);
        let queues = EntityQueues::new()
            .with(EntityKind::Action, action_tx)
            .with(EntityKind::Block, block_tx);
        let (failure_tx, failures) = mpsc::channel(8);
        let ledger = Arc::new(CompletionLedger::new());
        let pool = DeserializerPool::new(decoder, Arc::new(AbiSequencer::new()), ledger.clone(), queues, failure_tx)
            .with_header_retries(2, Duration::from_millis(1));
        Setup {
            pool: Arc::new(pool),
            ledger,
            resolver,
            failures,
            actions,
            blocks,
        }
    }

    fn message(lane: u32, sequence: u64, block: BlockBuilder) -> QueueMessage<RawBlock> {
        let num = sequence as u32 + 100;
        QueueMessage {
            block_num: num,
            sequence,
            lane,
            payload: block.build(&format!("id{num}"), &format!("id{}", num - 1)),
        }
    }

    fn transfer_block(num: u32) -> BlockBuilder {
        BlockBuilder::new(num).transaction(TrxBuilder::new(format!("t{num}")).action(
            "eosio.token",
            "transfer",
            json!({"from": "a", "to": "b", "quantity": "1.0000 EOS", "memo": ""}),
            &[],
        ))
    }

    #[tokio::test]
    async fn routes_documents_and_reports_counts() {
        let s = setup();
        s.ledger.register(1, 0, 100);
        s.pool.process(message(1, 0, transfer_block(100))).await.unwrap();

        let block = s.blocks.consume().await.unwrap();
        assert_eq!(block.payload.entity, EntityKind::Block);
        assert_eq!((block.lane, block.sequence, block.block_num), (1, 0, 100));
        let action = s.actions.consume().await.unwrap();
        assert!(action.payload.body.get("@transfer").is_some());

        // Transaction document has no queue here, so two documents are expected.
        s.ledger.complete(1, 0, 1);
        assert_eq!(s.ledger.watermark(1), None);
        s.ledger.complete(1, 0, 1);
        assert_eq!(s.ledger.watermark(1), Some(100));
    }

    #[tokio::test]
    async fn out_of_order_workers_apply_abis_in_order() {
        let s = setup();
        let game_v1 = r#"{"actions":[{"name":"play","type":"play"}],"tables":[]}"#;
        let game_v2 = r#"{"actions":[{"name":"play","type":"play"},{"name":"quit","type":"quit"}],"tables":[]}"#;

        let b0 = BlockBuilder::new(100)
            .transaction(TrxBuilder::new("t0").action("eosio", "setabi", setabi_data("game", game_v1), &[]));
        let b1 = BlockBuilder::new(101)
            .transaction(TrxBuilder::new("t1").action("eosio", "setabi", setabi_data("game", game_v2), &[]));

        // Sequence 1 arrives first and must wait for sequence 0.
        let late = {
            let pool = s.pool.clone();
            let msg = message(1, 1, b1);
            tokio::spawn(async move { pool.process(msg).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(s.resolver.latest("game").is_none());

        s.pool.process(message(1, 0, b0)).await.unwrap();
        late.await.unwrap().unwrap();

        let ranges = s.resolver.ranges("game");
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].valid_from, 100);
        assert_eq!(ranges[0].valid_until, Some(101));
        assert_eq!(ranges[1].valid_from, 101);
    }

    #[tokio::test]
    async fn scanned_abis_reach_lanes_that_run_ahead() {
        let s = setup();
        let game = r#"{"actions":[{"name":"play","type":"play"}],"tables":[]}"#;
        let setabi = BlockBuilder::new(150)
            .transaction(TrxBuilder::new("t0").action("eosio", "setabi", setabi_data("game", game), &[]));
        let play = BlockBuilder::new(250)
            .transaction(TrxBuilder::new("t1").action("game", "play", json!({"move": "e4"}), &[]));

        // The scan pass sees block 150 before any index lane runs.
        let mut cfg = IndexerConfig::default();
        cfg.features.abi_scan_mode = true;
        let scanner = BlockDecoder::new(s.resolver.clone(), Arc::new(TransformRegistry::new(cfg.transform_context())), &cfg);
        let scanned = scanner.decode(&setabi.build("id150", "id149")).unwrap();
        assert_eq!(scanned.documents().len(), 1);

        // Lane 2 decodes block 250 before lane 1 reaches block 150.
        let ahead = QueueMessage { block_num: 250, sequence: 0, lane: 2, payload: play.build("id250", "id249") };
        s.pool.process(ahead).await.unwrap();
        let action = s.actions.consume().await.unwrap();
        assert_eq!(action.block_num, 250);
        assert!(action.payload.body.get("ds_error").is_none());
        assert_eq!(s.pool.stats().flagged.load(Ordering::Relaxed), 0);

        let behind = QueueMessage { block_num: 150, sequence: 0, lane: 1, payload: setabi.build("id150", "id149") };
        s.pool.process(behind).await.unwrap();
        assert_eq!(s.resolver.ranges("game").len(), 1);
        assert_eq!(s.resolver.get("game", 250).unwrap().valid_from, 150);
    }

    #[tokio::test]
    async fn header_failures_are_reported_after_retries() {
        let mut s = setup();
        let mut msg = message(2, 0, BlockBuilder::new(100));
        msg.payload.block = bytes::Bytes::from_static(b"{not json");
        s.pool.process(msg).await.unwrap();

        let failure = s.failures.recv().await.unwrap();
        assert_eq!(failure.lane, 2);
        assert_eq!(failure.block_num, 100);
        assert!(failure.reason.contains("Header decode failed"));
        assert_eq!(s.pool.stats().failures.load(Ordering::Relaxed), 1);

        // The lane keeps moving.
        s.pool.process(message(2, 1, transfer_block(101))).await.unwrap();
        assert_eq!(s.pool.stats().blocks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn spawned_workers_drain_the_queue() {
        let s = setup();
        let (raw_tx, raw_rx) = bounded("raw", 16);
        let handles = s.pool.spawn(3, raw_rx);

        for seq in 0..6u64 {
            s.ledger.register(5, seq, 100 + seq as u32);
            raw_tx.produce(message(5, seq, transfer_block(100 + seq as u32))).await.unwrap();
        }
        drop(raw_tx);
        for h in handles {
            h.await.unwrap();
        }

        let mut nums = vec![];
        for _ in 0..6 {
            nums.push(s.blocks.consume().await.unwrap().block_num);
        }
        nums.sort();
        assert_eq!(nums, (100..106).collect::<Vec<u32>>());
        assert_eq!(s.pool.stats().documents.load(Ordering::Relaxed), 12);
    }
}
