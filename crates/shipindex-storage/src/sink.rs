//! Indexing sink: drains one entity queue into the document store.
//!
//! Messages are collected into batches bounded by size and a flush interval.
//! A batch is written with one bulk request; documents that fail are retried
//! alone with exponential backoff, and once the retry budget is spent they
//! are dead-lettered with their full identity. Every document that is
//! written, rejected as stale or dead-lettered counts toward its block in the
//! [`CompletionLedger`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shipindex_core::{
    CompletionLedger, DeadLetter, Document, DocumentStore, EntityKind, IndexerError, QueueConsumer, QueueMessage,
    RetryConfig, RetryPolicy, WriteOutcome,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub struct SinkStats {
    pub batches: AtomicU64,
    pub written: AtomicU64,
    pub stale: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
}

pub struct IndexingSink {
    entity: EntityKind,
    store: Arc<dyn DocumentStore>,
    ledger: Arc<CompletionLedger>,
    retry: RetryPolicy,
    batch_size: usize,
    flush_interval: Duration,
    stats: SinkStats,
}

impl IndexingSink {
    pub fn new(entity: EntityKind, store: Arc<dyn DocumentStore>, ledger: Arc<CompletionLedger>) -> Self {
        Self {
            entity,
            store,
            ledger,
            retry: RetryPolicy::new(RetryConfig::default()),
            batch_size: 1_000,
            flush_interval: Duration::from_secs(1),
            stats: SinkStats::default(),
        }
    }

    pub fn with_batching(mut self, batch_size: usize, flush_interval: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    pub fn entity(&self) -> EntityKind {
        self.entity
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Start `workers` tasks draining `queue`. Each exits when the queue
    /// closes, or on a store failure that cannot be dead-lettered.
    pub fn spawn(self: &Arc<Self>, workers: usize, queue: QueueConsumer<Document>) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|id| {
                let sink = self.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    if let Err(e) = sink.run(&queue).await {
                        error!(entity = %sink.entity, worker = id, error = %e, "Indexer stopping");
                    }
                })
            })
            .collect()
    }

    /// Write batches until the queue closes.
    pub async fn run(&self, queue: &QueueConsumer<Document>) -> Result<(), IndexerError> {
        loop {
            let batch = queue.consume_batch(self.batch_size, self.flush_interval).await;
            if batch.is_empty() {
                debug!(entity = %self.entity, "Entity queue closed");
                return Ok(());
            }
            self.write_batch(batch).await?;
        }
    }

    /// Write one batch, retrying failed documents and dead-lettering those
    /// that never succeed. Fails only if a dead letter cannot be stored.
    pub async fn write_batch(&self, batch: Vec<QueueMessage<Document>>) -> Result<(), IndexerError> {
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        let mut pending: Vec<(QueueMessage<Document>, String)> =
            batch.into_iter().map(|m| (m, String::new())).collect();
        let mut attempt = 0u32;

        loop {
            let docs: Vec<Document> = pending.iter().map(|(m, _)| m.payload.clone()).collect();
            let mut failed = vec![];
            let mut settled = vec![];

            match self.store.bulk_write(&docs).await {
                Ok(outcomes) if outcomes.len() == pending.len() => {
                    for ((msg, _), outcome) in pending.into_iter().zip(outcomes) {
                        match outcome {
                            WriteOutcome::Applied => {
                                self.stats.written.fetch_add(1, Ordering::Relaxed);
                                settled.push(msg);
                            }
                            WriteOutcome::Stale { stored_block } => {
                                debug!(key = %msg.payload.key(), block_num = msg.block_num, stored_block, "Stale write skipped");
                                self.stats.stale.fetch_add(1, Ordering::Relaxed);
                                settled.push(msg);
                            }
                            WriteOutcome::Failed(reason) => failed.push((msg, reason)),
                        }
                    }
                }
                Ok(outcomes) => {
                    let reason = format!("store returned {} outcomes for {} documents", outcomes.len(), pending.len());
                    failed = pending.into_iter().map(|(m, _)| (m, reason.clone())).collect();
                }
                Err(e) => {
                    let reason = e.to_string();
                    failed = pending.into_iter().map(|(m, _)| (m, reason.clone())).collect();
                }
            }
            self.settle(&settled);

            if failed.is_empty() {
                return Ok(());
            }
            attempt += 1;
            match self.retry.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        entity = %self.entity,
                        failed = failed.len(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Index write failed, retrying subset"
                    );
                    self.stats.retried.fetch_add(failed.len() as u64, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    pending = failed;
                }
                None => return self.dead_letter(failed, attempt).await,
            }
        }
    }

    async fn dead_letter(&self, failed: Vec<(QueueMessage<Document>, String)>, attempts: u32) -> Result<(), IndexerError> {
        let mut settled = Vec::with_capacity(failed.len());
        for (msg, reason) in failed {
            warn!(key = %msg.payload.key(), block_num = msg.block_num, reason = %reason, "Document dead-lettered");
            self.store
                .dead_letter(DeadLetter::from_document(&msg.payload, reason, attempts))
                .await?;
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            settled.push(msg);
        }
        info!(entity = %self.entity, count = settled.len(), "Dead letters stored");
        self.settle(&settled);
        Ok(())
    }

    /// Report settled documents to the ledger, once per block.
    fn settle(&self, settled: &[QueueMessage<Document>]) {
        let mut per_block: BTreeMap<(u32, u64), usize> = BTreeMap::new();
        for msg in settled {
            *per_block.entry((msg.lane, msg.sequence)).or_default() += 1;
        }
        for ((lane, sequence), n) in per_block {
            self.ledger.complete(lane, sequence, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use shipindex_core::fork::{ForkDetected, ForkManager};
    use shipindex_core::queue::bounded;
    use shipindex_core::{AbiResolver, StoredDocument};
    use std::collections::HashMap;

    /// Fails chosen ids a number of times, or whole requests.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failures: Mutex<HashMap<String, u32>>,
        request_failures: Mutex<u32>,
        requests: Mutex<Vec<Vec<String>>>,
    }

    impl FlakyStore {
        fn fail_id(self, id: &str, times: u32) -> Self {
            self.failures.lock().insert(id.to_string(), times);
            self
        }

        fn fail_requests(self, times: u32) -> Self {
            *self.request_failures.lock() = times;
            self
        }
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn bulk_write(&self, docs: &[Document]) -> Result<Vec<WriteOutcome>, IndexerError> {
            self.requests.lock().push(docs.iter().map(|d| d.id.clone()).collect());
            {
                let mut left = self.request_failures.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(IndexerError::Storage("connection reset".into()));
                }
            }
            let mut outcomes = vec![];
            for doc in docs {
                let fail = {
                    let mut failures = self.failures.lock();
                    match failures.get_mut(&doc.id) {
                        Some(n) if *n > 0 => {
                            *n -= 1;
                            true
                        }
                        _ => false,
                    }
                };
                if fail {
                    outcomes.push(WriteOutcome::Failed("mapper_parsing_exception".into()));
                } else {
                    outcomes.extend(self.inner.bulk_write(std::slice::from_ref(doc)).await?);
                }
            }
            Ok(outcomes)
        }

        async fn get(&self, entity: EntityKind, id: &str) -> Result<Option<StoredDocument>, IndexerError> {
            self.inner.get(entity, id).await
        }

        async fn list(&self, entity: EntityKind) -> Result<Vec<StoredDocument>, IndexerError> {
            self.inner.list(entity).await
        }

        async fn purge_after(&self, block_num: u32) -> Result<u64, IndexerError> {
            self.inner.purge_after(block_num).await
        }

        async fn dead_letter(&self, letter: DeadLetter) -> Result<(), IndexerError> {
            self.inner.dead_letter(letter).await
        }

        async fn dead_letters(&self) -> Result<Vec<DeadLetter>, IndexerError> {
            self.inner.dead_letters().await
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        }
    }

    fn msg(lane: u32, sequence: u64, doc: Document) -> QueueMessage<Document> {
        QueueMessage {
            block_num: doc.block_num,
            sequence,
            lane,
            payload: doc,
        }
    }

    fn block_doc(num: u32, salt: &str) -> Document {
        Document::upsert(EntityKind::Block, num.to_string(), num, json!({ "block_num": num, "id": format!("{salt}{num}") }))
    }

    #[tokio::test]
    async fn only_failed_subset_is_retried() {
        let store = Arc::new(FlakyStore::default().fail_id("2", 1));
        let ledger = Arc::new(CompletionLedger::new());
        let sink = IndexingSink::new(EntityKind::Block, store.clone(), ledger.clone()).with_retry(fast_retry(3));

        for seq in 0..3u64 {
            ledger.register(1, seq, seq as u32 + 1);
            ledger.expect(1, seq, 1);
        }
        let batch = (0..3u64).map(|s| msg(1, s, block_doc(s as u32 + 1, "a"))).collect();
        sink.write_batch(batch).await.unwrap();

        let requests = store.requests.lock().clone();
        assert_eq!(requests, vec![vec!["1".to_string(), "2".into(), "3".into()], vec!["2".to_string()]]);
        assert_eq!(store.list(EntityKind::Block).await.unwrap().len(), 3);
        assert_eq!(ledger.watermark(1), Some(3));
        assert_eq!(sink.stats().retried.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausted_documents_are_dead_lettered_and_complete() {
        let store = Arc::new(FlakyStore::default().fail_id("2", u32::MAX));
        let ledger = Arc::new(CompletionLedger::new());
        let sink = IndexingSink::new(EntityKind::Block, store.clone(), ledger.clone()).with_retry(fast_retry(2));

        ledger.register(4, 0, 2);
        ledger.expect(4, 0, 1);
        sink.write_batch(vec![msg(4, 0, block_doc(2, "a"))]).await.unwrap();

        let letters = store.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, "2");
        assert_eq!(letters[0].entity, EntityKind::Block);
        assert_eq!(letters[0].reason, "mapper_parsing_exception");
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(store.requests.lock().len(), 3);
        assert_eq!(ledger.watermark(4), Some(2));
    }

    #[tokio::test]
    async fn whole_request_failures_are_retried() {
        let store = Arc::new(FlakyStore::default().fail_requests(2));
        let ledger = Arc::new(CompletionLedger::new());
        let sink = IndexingSink::new(EntityKind::Block, store.clone(), ledger).with_retry(fast_retry(3));

        sink.write_batch(vec![msg(1, 0, block_doc(1, "a")), msg(1, 1, block_doc(2, "a"))])
            .await
            .unwrap();
        assert_eq!(store.requests.lock().len(), 3);
        assert_eq!(store.list(EntityKind::Block).await.unwrap().len(), 2);
        assert!(store.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batches_flush_on_size_and_close() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CompletionLedger::new());
        let sink = Arc::new(
            IndexingSink::new(EntityKind::Block, store.clone(), ledger).with_batching(4, Duration::from_millis(20)),
        );
        let (tx, rx) = bounded("block", 32);
        let handles = sink.spawn(2, rx);

        for n in 1..=10u32 {
            tx.produce(msg(1, n as u64, block_doc(n, "a"))).await.unwrap();
        }
        drop(tx);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.count(EntityKind::Block), 10);
        assert_eq!(sink.stats().written.load(Ordering::Relaxed), 10);
        assert!(sink.stats().batches.load(Ordering::Relaxed) >= 3);
    }

    #[tokio::test]
    async fn fork_rollback_and_replay_leave_only_the_new_branch() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CompletionLedger::new());
        let sink = IndexingSink::new(EntityKind::Block, store.clone(), ledger);
        let codec = Arc::new(shipindex_core::codec::mock::MockCodec::new());
        let forks = ForkManager::new(store.clone(), Arc::new(AbiResolver::new(codec, 4)));

        let old: Vec<_> = (1..=10u32).map(|n| msg(1, n as u64, block_doc(n, "old"))).collect();
        sink.write_batch(old).await.unwrap();
        let before: Vec<StoredDocument> = store.list(EntityKind::Block).await.unwrap().into_iter().take(5).collect();

        let fork = ForkDetected {
            block_num: 6,
            block_id: "new6".into(),
            common_ancestor: 5,
            previous_head: 10,
        };
        for _ in 0..2 {
            let plan = forks.rollback(&fork, 0).await.unwrap();
            assert_eq!(plan.resume_from, 6);
        }
        let replay: Vec<_> = (6..=9u32).map(|n| msg(2, n as u64, block_doc(n, "new"))).collect();
        sink.write_batch(replay).await.unwrap();

        let after = store.list(EntityKind::Block).await.unwrap();
        assert_eq!(after.len(), 9);
        assert_eq!(after[..5], before[..]);
        assert!(after[5..].iter().all(|d| d.body["id"].as_str().unwrap().starts_with("new")));
        assert!(store.get(EntityKind::Block, "10").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replaying_a_block_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let sink = IndexingSink::new(EntityKind::Block, store.clone(), Arc::new(CompletionLedger::new()));
        sink.write_batch(vec![msg(1, 0, block_doc(3, "a"))]).await.unwrap();
        let once = store.list(EntityKind::Block).await.unwrap();
        sink.write_batch(vec![msg(1, 0, block_doc(3, "a"))]).await.unwrap();
        assert_eq!(store.list(EntityKind::Block).await.unwrap(), once);
    }
}
