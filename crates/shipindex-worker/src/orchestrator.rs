//! The orchestrator: owns the whole pipeline for one chain.
//!
//! # Setup
//! Probe every endpoint (statuses are persisted), seed the ABI resolver from
//! previously indexed ABI documents, start the deserializer pool and one
//! indexing sink per entity kind.
//!
//! # Backfill
//! `[start, lib]` is split into ranges; up to `scaling.readers` readers
//! stream them in parallel, each on its own lane and checkpoint key.
//! `setabi` order is only kept within a lane, so when readers overlap an ABI
//! scan pass streams the same interval first, decoding nothing but `setabi`
//! actions, and the index pass starts with every ABI version in the cache.
//!
//! # Live
//! A single reader follows the chain from `lib + 1`. Forks only happen here:
//! the reader drains its lane, the [`ForkManager`] purges the index and the
//! ABI cache past the common ancestor, and the stream resumes right after it.
//!
//! # Failures
//! A reader whose block cannot be decoded, or whose stream gives up, is
//! restarted from its checkpoint. After `scaling.max_worker_failures`
//! failures it is retired and a replacement takes over the range; a range
//! that wore out as many replacements is abandoned and reported.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shipindex_core::abi::abi_from_document;
use shipindex_core::codec::SHIP_CONTRACT;
use shipindex_core::config::IndexerConfig;
use shipindex_core::modules::builtin;
use shipindex_core::queue::bounded;
use shipindex_core::{
    AbiCodec, AbiPayload, AbiResolver, CheckpointManager, CheckpointStore, CompletionLedger, DocumentStore,
    EntityKind, ForkDetected, ForkManager, IndexerError, QueueMessage, QueueProducer, RawBlock, RollbackPlan,
    TransformModule, TransformRegistry,
};
use shipindex_deser::{AbiSequencer, BlockDecoder, BlockFailure, DeserializerPool, EntityQueues};
use shipindex_ship::{healthy_endpoints, validate_endpoints, ShipTransport, StreamClient, StreamEvent, StreamOptions, StreamRange};
use shipindex_storage::IndexingSink;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::planner::{BlockRange, Pass, RangeAssignment, RunPlan};
use crate::role::{WorkerDef, WorkerState};

/// Longest wait for a lane's in-flight blocks when a reader stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const HEADER_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Why a reader is asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    Shutdown,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderOutcome {
    /// The range was streamed and fully indexed.
    Completed,
    /// Stopped by shutdown.
    Stopped,
    Failed(String),
}

/// What one reader run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderReport {
    pub worker: WorkerDef,
    pub lane: u32,
    pub outcome: ReaderOutcome,
    pub blocks: u64,
    pub forks: u32,
    /// Highest block of the range known to be fully indexed.
    pub last_indexed: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub plan: Option<RunPlan>,
    /// Final report of every reader run, in completion order.
    pub readers: Vec<ReaderReport>,
    /// Blocks decoded by the deserializer pool.
    pub blocks: u64,
    pub documents: u64,
    pub flagged: u64,
    pub written: u64,
    pub dead_letters: u64,
    pub rollbacks: Vec<RollbackPlan>,
    /// Ranges given up after every replacement failed.
    pub abandoned: Vec<BlockRange>,
    /// The ABI scan that ran ahead of the backfill, if one was needed.
    pub abi_scan: Option<ScanSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    pub readers: Vec<ReaderReport>,
    pub blocks: u64,
    /// ABI documents written.
    pub abis: u64,
    pub abandoned: Vec<BlockRange>,
}

impl RunSummary {
    pub fn forks(&self) -> u32 {
        self.readers.iter().map(|r| r.forks).sum()
    }
}

/// What every pass of a run shares.
struct PassContext {
    endpoints: Vec<String>,
    lib: u32,
    resolver: Arc<AbiResolver>,
    registry: Arc<TransformRegistry>,
}

#[derive(Default)]
struct PassOutcome {
    readers: Vec<ReaderReport>,
    blocks: u64,
    documents: u64,
    flagged: u64,
    written: u64,
    dead_letters: u64,
    rollbacks: Vec<RollbackPlan>,
    abandoned: Vec<BlockRange>,
    /// Shutdown resolved before every reader finished.
    interrupted: bool,
}

/// State shared by every reader of a pass.
struct Shared {
    config: IndexerConfig,
    transport: Arc<dyn ShipTransport>,
    endpoints: Vec<String>,
    /// Last irreversible block the run was planned against.
    lib: u32,
    resolver: Arc<AbiResolver>,
    ledger: Arc<CompletionLedger>,
    sequencer: Arc<AbiSequencer>,
    raw: QueueProducer<RawBlock>,
    forks: ForkManager,
    checkpoints: Arc<dyn CheckpointStore>,
    rollbacks: Mutex<Vec<RollbackPlan>>,
}

pub struct Orchestrator {
    config: IndexerConfig,
    transport: Arc<dyn ShipTransport>,
    codec: Arc<dyn AbiCodec>,
    store: Arc<dyn DocumentStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    modules: Vec<TransformModule>,
    abis: Vec<(String, u32, AbiPayload)>,
    lanes: AtomicU32,
    worker_ids: AtomicU32,
}

impl Orchestrator {
    pub(crate) fn new(
        config: IndexerConfig,
        transport: Arc<dyn ShipTransport>,
        codec: Arc<dyn AbiCodec>,
        store: Arc<dyn DocumentStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        modules: Vec<TransformModule>,
        abis: Vec<(String, u32, AbiPayload)>,
    ) -> Self {
        Self {
            config,
            transport,
            codec,
            store,
            checkpoints,
            modules,
            abis,
            lanes: AtomicU32::new(1),
            worker_ids: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Run until every range is done. With a live reader this never returns
    /// on its own; see [`Orchestrator::run_until`].
    pub async fn run(self) -> Result<RunSummary, IndexerError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until every range is done or `shutdown` resolves. On shutdown
    /// readers stop streaming, wait for their in-flight blocks and save
    /// their checkpoints.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<RunSummary, IndexerError>
    where
        F: Future<Output = ()>,
    {
        let cfg = self.config.clone();
        cfg.validate()?;

        // ── Endpoints ──
        let timeout = Duration::from_millis(cfg.ship.connect_timeout_ms);
        let statuses =
            validate_endpoints(self.transport.as_ref(), &cfg.ship.endpoints, cfg.chain_id.as_deref(), timeout).await;
        for status in &statuses {
            self.checkpoints.save_endpoint(status.clone()).await?;
        }
        let endpoints = healthy_endpoints(&statuses);
        let Some(status) = statuses.iter().find(|s| s.healthy) else {
            return Err(IndexerError::Config("no healthy state-history endpoint".into()));
        };
        let lib = status.last_irreversible.unwrap_or(0);
        let first_available = status.trace_begin_block.unwrap_or(1);

        let saved = self.checkpoints.list(&cfg.chain).await?;
        let plan = RunPlan::build(&cfg, lib, first_available, &saved);
        info!(
            chain = %cfg.chain,
            start = plan.start,
            lib,
            head = ?status.head,
            ranges = plan.backfill.len(),
            backfill_blocks = plan.backfill_blocks(),
            live = ?plan.live.map(|r| r.start),
            endpoints = endpoints.len(),
            "Run planned"
        );

        // ── ABI cache ──
        let resolver = Arc::new(AbiResolver::new(self.codec.clone(), cfg.abi.retention));
        let stored = self.store.list(EntityKind::Abi).await?;
        let seeded = resolver.seed(
            stored
                .iter()
                .filter_map(|doc| abi_from_document(&doc.body))
                .chain(self.abis.iter().cloned()),
        );
        info!(seeded, accounts = resolver.account_count(), "ABI cache seeded");

        let mut registry = TransformRegistry::new(cfg.transform_context());
        for module in builtin(&cfg.system_contract)
            .into_iter()
            .chain(std::mem::take(&mut self.modules))
        {
            let name = module.name.clone();
            if !registry.register(module) {
                debug!(module = %name, "Transform module shadowed");
            }
        }

        let ctx = PassContext {
            endpoints,
            lib,
            resolver,
            registry: Arc::new(registry),
        };
        let mut summary = RunSummary {
            plan: Some(plan.clone()),
            ..RunSummary::default()
        };
        tokio::pin!(shutdown);

        // ── ABI scan ──
        if !plan.abi_scan.is_empty() {
            info!(
                ranges = plan.abi_scan.len(),
                blocks = plan.abi_scan_blocks(),
                "Scanning for ABI updates before the parallel backfill"
            );
            let mut scan_cfg = cfg.clone();
            scan_cfg.features.abi_scan_mode = true;
            let scan = self
                .run_pass(Pass::AbiScan, &scan_cfg, &ctx, &plan.abi_scan, None, shutdown.as_mut())
                .await;
            if !scan.abandoned.is_empty() {
                warn!(ranges = scan.abandoned.len(), "ABI scan incomplete, records past a missed update will be flagged");
            }
            let interrupted = scan.interrupted;
            summary.abi_scan = Some(ScanSummary {
                readers: scan.readers,
                blocks: scan.blocks,
                abis: scan.written,
                abandoned: scan.abandoned,
            });
            if interrupted {
                info!("Shut down during the ABI scan");
                return Ok(summary);
            }
        }

        // ── Index ──
        let index = self
            .run_pass(Pass::Index, &cfg, &ctx, &plan.backfill, plan.live, shutdown.as_mut())
            .await;
        summary.readers = index.readers;
        summary.blocks = index.blocks;
        summary.documents = index.documents;
        summary.flagged = index.flagged;
        summary.written = index.written;
        summary.dead_letters = index.dead_letters;
        summary.rollbacks = index.rollbacks;
        summary.abandoned = index.abandoned;

        info!(
            blocks = summary.blocks,
            documents = summary.documents,
            written = summary.written,
            dead_letters = summary.dead_letters,
            forks = summary.forks(),
            abandoned = summary.abandoned.len(),
            "Run finished"
        );
        Ok(summary)
    }

    /// One sweep of readers over `assignments` (plus the tail reader, if
    /// any), with its own deserializer pool, sinks and lanes. Returns when
    /// every reader is done or `shutdown` resolved.
    async fn run_pass<F>(
        &self,
        pass: Pass,
        cfg: &IndexerConfig,
        ctx: &PassContext,
        assignments: &[RangeAssignment],
        live: Option<BlockRange>,
        mut shutdown: Pin<&mut F>,
    ) -> PassOutcome
    where
        F: Future<Output = ()>,
    {
        let ledger = Arc::new(CompletionLedger::new());
        let sequencer = Arc::new(AbiSequencer::new());
        let decoder = Arc::new(BlockDecoder::new(ctx.resolver.clone(), ctx.registry.clone(), cfg));
        let (raw_tx, raw_rx) = bounded::<RawBlock>("blocks", cfg.prefetch.block);

        let mut queues = EntityQueues::new();
        let mut sinks = vec![];
        let mut handles: Vec<JoinHandle<()>> = vec![];
        for entity in EntityKind::ALL {
            let (tx, rx) = bounded(entity.as_str(), cfg.prefetch.index);
            queues = queues.with(entity, tx);
            let sink = Arc::new(
                IndexingSink::new(entity, self.store.clone(), ledger.clone())
                    .with_batching(
                        cfg.scaling.index_batch_size,
                        Duration::from_millis(cfg.scaling.flush_interval_ms),
                    )
                    .with_retry(cfg.write_retry.clone()),
            );
            handles.extend(sink.spawn(cfg.scaling.indexers_per_entity, rx));
            sinks.push(sink);
        }

        let (failure_tx, mut failures) = mpsc::channel::<BlockFailure>(64);
        let pool = Arc::new(
            DeserializerPool::new(decoder, sequencer.clone(), ledger.clone(), queues, failure_tx)
                .with_header_retries(cfg.scaling.header_retries, HEADER_RETRY_DELAY),
        );
        handles.extend(pool.spawn(cfg.scaling.ds_workers, raw_rx));

        let shared = Arc::new(Shared {
            config: cfg.clone(),
            transport: self.transport.clone(),
            endpoints: ctx.endpoints.clone(),
            lib: ctx.lib,
            resolver: ctx.resolver.clone(),
            ledger,
            sequencer,
            raw: raw_tx,
            forks: ForkManager::new(self.store.clone(), ctx.resolver.clone()),
            checkpoints: self.checkpoints.clone(),
            rollbacks: Mutex::new(vec![]),
        });

        // ── Readers ──
        let mut waiting: VecDeque<WorkerDef> = assignments
            .iter()
            .map(|a| WorkerDef::assigned(self.next_worker_id(), pass, a))
            .collect();
        let mut running: JoinSet<ReaderReport> = JoinSet::new();
        let mut stops: HashMap<u32, oneshot::Sender<Stop>> = HashMap::new();
        let mut backfilling = 0usize;
        let mut outcome = PassOutcome::default();

        if let Some(range) = live {
            let def = WorkerDef::reader(self.next_worker_id(), range);
            self.spawn_reader(&shared, def, &mut running, &mut stops);
        }

        let mut shutting_down = false;
        loop {
            while !shutting_down && backfilling < cfg.scaling.readers {
                let Some(def) = waiting.pop_front() else { break };
                self.spawn_reader(&shared, def, &mut running, &mut stops);
                backfilling += 1;
            }
            if running.is_empty() {
                break;
            }

            let signal = tokio::select! {
                joined = running.join_next() => Signal::Joined(joined),
                Some(failure) = failures.recv() => Signal::Failure(failure),
                _ = &mut shutdown, if !shutting_down => Signal::Shutdown,
            };
            match signal {
                Signal::Joined(joined) => {
                    let report = match joined {
                        Some(Ok(report)) => report,
                        Some(Err(e)) => {
                            error!(error = %e, "Reader task panicked");
                            continue;
                        }
                        None => continue,
                    };
                    stops.remove(&report.lane);
                    let tail = live.map_or(false, |live| live == report.worker.range);
                    if !tail {
                        backfilling = backfilling.saturating_sub(1);
                    }
                    if let Some(next) = self.after_reader(&report, shutting_down, &mut outcome.abandoned) {
                        if tail {
                            self.spawn_reader(&shared, next, &mut running, &mut stops);
                        } else {
                            waiting.push_front(next);
                        }
                    }
                    outcome.readers.push(report);
                }
                Signal::Failure(failure) => {
                    match stops.remove(&failure.lane) {
                        Some(stop) => {
                            let _ = stop.send(Stop::Failure(format!("block {}: {}", failure.block_num, failure.reason)));
                        }
                        None => debug!(lane = failure.lane, block_num = failure.block_num, "Failure for a finished lane"),
                    }
                }
                Signal::Shutdown => {
                    info!(?pass, readers = running.len(), "Shutting down");
                    shutting_down = true;
                    waiting.clear();
                    for (_, stop) in stops.drain() {
                        let _ = stop.send(Stop::Shutdown);
                    }
                }
            }
        }
        outcome.interrupted = shutting_down;

        // Closing the raw queue lets the pool finish, which closes the entity
        // queues and lets the sinks finish.
        outcome.rollbacks = std::mem::take(&mut *shared.rollbacks.lock());
        drop(shared);
        drop(failures);
        let stats = pool.stats();
        outcome.blocks = stats.blocks.load(Ordering::Relaxed);
        outcome.documents = stats.documents.load(Ordering::Relaxed);
        outcome.flagged = stats.flagged.load(Ordering::Relaxed);
        drop(pool);
        join_all(handles).await;

        for sink in &sinks {
            outcome.written += sink.stats().written.load(Ordering::Relaxed);
            outcome.dead_letters += sink.stats().dead_lettered.load(Ordering::Relaxed);
        }
        debug!(?pass, blocks = outcome.blocks, written = outcome.written, "Pass finished");
        outcome
    }

    fn next_worker_id(&self) -> u32 {
        self.worker_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_reader(
        &self,
        shared: &Arc<Shared>,
        def: WorkerDef,
        running: &mut JoinSet<ReaderReport>,
        stops: &mut HashMap<u32, oneshot::Sender<Stop>>,
    ) {
        let lane = self.lanes.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel();
        stops.insert(lane, stop_tx);
        info!(worker = def.id, lane, range = %def.range, generation = def.generation, "Spawning reader");
        let reader = Reader::new(shared.clone(), def, lane, stop_rx);
        running.spawn(reader.run());
    }

    /// Decide what follows a finished reader: a restart, a replacement or nothing.
    fn after_reader(&self, report: &ReaderReport, shutting_down: bool, abandoned: &mut Vec<BlockRange>) -> Option<WorkerDef> {
        let ReaderOutcome::Failed(reason) = &report.outcome else {
            return None;
        };
        if shutting_down {
            return None;
        }
        let threshold = self.config.scaling.max_worker_failures;
        let mut def = report.worker.clone();
        if !def.record_failure(threshold) {
            warn!(worker = def.id, range = %def.range, failures = def.failures, reason = %reason, "Restarting reader");
            return def.restart().ok().map(|_| def);
        }
        if def.generation + 1 >= threshold.max(1) {
            error!(
                range = %def.range,
                replacements = def.generation,
                reason = %reason,
                "Range abandoned, every replacement failed"
            );
            abandoned.push(def.range);
            return None;
        }
        let next = def.replacement(self.next_worker_id());
        warn!(
            retired = def.id,
            replacement = next.id,
            range = %def.range,
            reason = %reason,
            "Reader retired, range reassigned"
        );
        Some(next)
    }
}

enum Signal {
    Joined(Option<Result<ReaderReport, tokio::task::JoinError>>),
    Failure(BlockFailure),
    Shutdown,
}

enum Step {
    Event(Option<StreamEvent>),
    Tick,
    Stop(Stop),
}

enum End {
    /// The stream task finished and closed its event channel.
    Streamed,
    Stop(Stop),
}

/// One reader run: a stream task feeding the raw block queue, plus the
/// bookkeeping that turns the lane watermark into checkpoints.
struct Reader {
    shared: Arc<Shared>,
    def: WorkerDef,
    lane: u32,
    stop: Option<oneshot::Receiver<Stop>>,
    checkpoint: CheckpointManager,
    published: Option<u32>,
    sequence: u64,
    blocks: u64,
    forks: u32,
}

impl Reader {
    fn new(shared: Arc<Shared>, def: WorkerDef, lane: u32, stop: oneshot::Receiver<Stop>) -> Self {
        let checkpoint = CheckpointManager::new(
            shared.checkpoints.clone(),
            shared.config.chain.clone(),
            def.key(),
            shared.config.scaling.checkpoint_interval,
        );
        Self {
            shared,
            def,
            lane,
            stop: Some(stop),
            checkpoint,
            published: None,
            sequence: 0,
            blocks: 0,
            forks: 0,
        }
    }

    async fn run(mut self) -> ReaderReport {
        let outcome = match self.stream().await {
            Ok(outcome) => outcome,
            Err(e) => ReaderOutcome::Failed(e.to_string()),
        };
        self.shared.sequencer.retire(self.lane);
        self.shared.ledger.remove_lane(self.lane);
        ReaderReport {
            worker: self.def,
            lane: self.lane,
            outcome,
            blocks: self.blocks,
            forks: self.forks,
            last_indexed: self.published,
        }
    }

    async fn stream(&mut self) -> Result<ReaderOutcome, IndexerError> {
        let cfg = &self.shared.config;
        let range = self.def.range;
        let saved = self.checkpoint.load().await?.map(|cp| cp.block_number);
        let resume_from = saved
            .map_or(range.start, |b| b.saturating_add(1).max(range.start))
            .max(self.def.resume_from);
        self.published = saved
            .filter(|b| *b >= range.start)
            .max((resume_from > range.start).then(|| resume_from - 1));
        if resume_from >= range.end {
            info!(worker = self.def.id, range = %range, "Range already indexed");
            self.def.transition(WorkerState::Retired)?;
            return Ok(ReaderOutcome::Completed);
        }

        let live = range.start > self.shared.lib;
        self.def
            .transition(if live { WorkerState::Live } else { WorkerState::Backfilling })?;

        let (cp_tx, cp_rx) = watch::channel(resume_from.saturating_sub(1));
        let (events_tx, mut events) = mpsc::channel(cfg.prefetch.read.max(1) as usize);
        let client = StreamClient::new(
            self.shared.transport.clone(),
            self.shared.endpoints.clone(),
            StreamOptions::from_config(cfg),
            cfg.reconnect.clone(),
        )
        .with_name(self.def.key());
        let stream_range = if range.is_open() {
            StreamRange::open(range.start)
        } else {
            StreamRange::bounded(range.start, range.end)
        };
        let mut stream = tokio::spawn(async move { client.run(stream_range, cp_rx, events_tx).await });

        let mut ticker = tokio::time::interval(Duration::from_millis(cfg.scaling.flush_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let end = loop {
            let step = match self.stop.as_mut() {
                Some(stop) => tokio::select! {
                    event = events.recv() => Step::Event(event),
                    _ = ticker.tick() => Step::Tick,
                    received = stop => Step::Stop(received.unwrap_or(Stop::Shutdown)),
                },
                None => Step::Stop(Stop::Shutdown),
            };
            match step {
                Step::Event(Some(event)) => {
                    if let Err(stop) = self.on_event(event, &cp_tx).await {
                        break End::Stop(stop);
                    }
                }
                Step::Event(None) => break End::Streamed,
                Step::Tick => self.publish(&cp_tx, false).await,
                Step::Stop(stop) => {
                    self.stop = None;
                    break End::Stop(stop);
                }
            }
        };

        match end {
            End::Streamed => {
                let result = (&mut stream)
                    .await
                    .map_err(|e| IndexerError::Other(format!("stream task: {e}")))?;
                let summary = result?;
                self.def.transition(WorkerState::Draining)?;
                if let Some(stop) = self.drain().await {
                    return self.stopped(stop, &cp_tx).await;
                }
                self.publish(&cp_tx, true).await;
                self.def.last_processed_block = self.published;
                self.def.transition(WorkerState::Retired)?;
                info!(
                    worker = self.def.id,
                    range = %range,
                    blocks = summary.blocks,
                    reconnects = summary.reconnects,
                    forks = summary.forks,
                    last_indexed = ?self.published,
                    "Reader finished range"
                );
                Ok(ReaderOutcome::Completed)
            }
            End::Stop(stop) => {
                stream.abort();
                self.stopped(stop, &cp_tx).await
            }
        }
    }

    async fn stopped(&mut self, stop: Stop, cp_tx: &watch::Sender<u32>) -> Result<ReaderOutcome, IndexerError> {
        match stop {
            Stop::Shutdown => {
                if self.def.state != WorkerState::Draining {
                    self.def.transition(WorkerState::Draining)?;
                }
                if tokio::time::timeout(DRAIN_TIMEOUT, self.shared.ledger.wait_drained(self.lane))
                    .await
                    .is_err()
                {
                    warn!(worker = self.def.id, lane = self.lane, "Lane did not drain before shutdown");
                }
                self.publish(cp_tx, true).await;
                self.def.last_processed_block = self.published;
                self.def.transition(WorkerState::Retired)?;
                info!(worker = self.def.id, last_indexed = ?self.published, "Reader stopped");
                Ok(ReaderOutcome::Stopped)
            }
            Stop::Failure(reason) => {
                // Later blocks of the lane must not be applied past the failure.
                self.shared.sequencer.retire(self.lane);
                self.publish(cp_tx, true).await;
                self.def.last_processed_block = self.published;
                error!(worker = self.def.id, lane = self.lane, reason = %reason, "Reader failed");
                Ok(ReaderOutcome::Failed(reason))
            }
        }
    }

    async fn on_event(&mut self, event: StreamEvent, cp_tx: &watch::Sender<u32>) -> Result<(), Stop> {
        match event {
            StreamEvent::ShipAbi(abi) => self
                .shared
                .resolver
                .codec()
                .load_abi(SHIP_CONTRACT, &abi)
                .map_err(|e| Stop::Failure(e.to_string())),
            StreamEvent::Status { url, status } => {
                debug!(
                    worker = self.def.id,
                    url = %url,
                    head = status.head.block_num,
                    lib = status.last_irreversible.block_num,
                    "Node status"
                );
                Ok(())
            }
            StreamEvent::Block(block) => {
                let block_num = block.block_num();
                let sequence = self.sequence;
                self.sequence += 1;
                self.shared.ledger.register(self.lane, sequence, block_num);
                self.shared
                    .raw
                    .produce(QueueMessage {
                        block_num,
                        sequence,
                        lane: self.lane,
                        payload: block,
                    })
                    .await
                    .map_err(|e| Stop::Failure(e.to_string()))?;
                self.blocks += 1;
                Ok(())
            }
            StreamEvent::Fork {
                fork,
                last_irreversible,
                resume,
            } => {
                let plan = self.rollback(&fork, last_irreversible, cp_tx).await?;
                if resume.send(plan.resume_from).is_err() {
                    warn!(worker = self.def.id, "Stream went away during rollback");
                }
                Ok(())
            }
        }
    }

    async fn rollback(
        &mut self,
        fork: &ForkDetected,
        last_irreversible: u32,
        cp_tx: &watch::Sender<u32>,
    ) -> Result<RollbackPlan, Stop> {
        self.forks += 1;
        if let Some(stop) = self.drain().await {
            return Err(stop);
        }
        let plan = self
            .shared
            .forks
            .rollback(fork, last_irreversible)
            .await
            .map_err(|e| Stop::Failure(e.to_string()))?;

        let rolled_back = plan.rollback_block_num;
        self.shared.ledger.reset(self.lane, Some(rolled_back));
        cp_tx.send_replace(rolled_back);
        if self.published.map_or(false, |p| p > rolled_back) {
            self.published = Some(rolled_back);
        }
        if let Err(e) = self.checkpoint.force_save(rolled_back).await {
            warn!(worker = self.def.id, error = %e, "Checkpoint save failed after rollback");
        }
        self.shared.rollbacks.lock().push(plan.clone());
        Ok(plan)
    }

    /// Wait for the lane's in-flight blocks, unless told to stop first.
    async fn drain(&mut self) -> Option<Stop> {
        let ledger = self.shared.ledger.clone();
        let lane = self.lane;
        let received = match self.stop.as_mut() {
            Some(stop) => tokio::select! {
                _ = ledger.wait_drained(lane) => None,
                received = stop => Some(received.unwrap_or(Stop::Shutdown)),
            },
            None => {
                ledger.wait_drained(lane).await;
                None
            }
        };
        if received.is_some() {
            self.stop = None;
        }
        received
    }

    /// Move the stream's resume point to the lane watermark and checkpoint it.
    async fn publish(&mut self, cp_tx: &watch::Sender<u32>, force: bool) {
        let Some(watermark) = self.shared.ledger.watermark(self.lane) else {
            return;
        };
        let advanced = self.published.map_or(true, |p| watermark > p);
        if advanced {
            cp_tx.send_replace(watermark);
            self.published = Some(watermark);
            self.def.last_processed_block = Some(watermark);
        }
        let saved = if force {
            self.checkpoint.force_save(watermark).await
        } else if advanced {
            self.checkpoint.maybe_save(watermark).await
        } else {
            Ok(())
        };
        if let Err(e) = saved {
            warn!(worker = self.def.id, block = watermark, error = %e, "Checkpoint save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use serde_json::json;
    use shipindex_core::abi::abi_document_body;
    use shipindex_core::codec::mock::MockCodec;
    use shipindex_core::{Checkpoint, Document, MemoryCheckpointStore, RetryConfig};
    use shipindex_deser::fixtures::{setabi_data, system_abi, token_abi, BlockBuilder, TrxBuilder};
    use shipindex_ship::transport::mock::{BlockPayload, MockShip, MOCK_CHAIN_ID};
    use shipindex_storage::MemoryStore;

    use crate::builder::OrchestratorBuilder;

    const LIMIT: Duration = Duration::from_secs(20);

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        }
    }

    fn config() -> IndexerConfig {
        let mut cfg = IndexerConfig::default();
        cfg.chain_id = Some(MOCK_CHAIN_ID.to_string());
        cfg.ship.endpoints = vec!["ws://a".into()];
        cfg.ship.connect_timeout_ms = 1_000;
        cfg.start_block = 1;
        cfg.live = false;
        cfg.prefetch.read = 4;
        cfg.prefetch.block = 8;
        cfg.prefetch.index = 32;
        cfg.scaling.readers = 2;
        cfg.scaling.ds_workers = 2;
        cfg.scaling.batch_size = 10;
        cfg.scaling.index_batch_size = 16;
        cfg.scaling.flush_interval_ms = 5;
        cfg.scaling.checkpoint_interval = 1;
        cfg.scaling.header_retries = 1;
        cfg.reconnect = fast_retry();
        cfg.write_retry = fast_retry();
        // Exact request and checkpoint assertions below; the ABI scan has its own tests.
        cfg.features.abi_prescan = false;
        cfg
    }

    fn transfer_payload(num: u32, _id: &str, prev_id: &str) -> BlockPayload {
        let (block, traces, deltas) = BlockBuilder::new(num)
            .transaction(TrxBuilder::new(format!("t{num}")).action(
                "eosio.token",
                "transfer",
                json!({"from": "alice", "to": "bob", "quantity": "1.0000 EOS", "memo": ""}),
                &[],
            ))
            .segments(prev_id);
        BlockPayload { block, traces, deltas }
    }

    struct Harness {
        ship: MockShip,
        store: Arc<MemoryStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
    }

    impl Harness {
        fn new(ship: MockShip) -> Self {
            Self {
                ship,
                store: Arc::new(MemoryStore::new()),
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
            }
        }

        fn builder(&self, cfg: IndexerConfig) -> OrchestratorBuilder {
            OrchestratorBuilder::new()
                .config(cfg)
                .transport(Arc::new(self.ship.clone()))
                .codec(Arc::new(MockCodec::new()))
                .store(self.store.clone())
                .checkpoint_store(self.checkpoints.clone())
        }

        fn orchestrator(&self, cfg: IndexerConfig) -> Orchestrator {
            self.builder(cfg)
                .abi("eosio.token", 1, AbiPayload::Json(token_abi()))
                .build()
                .unwrap()
        }

        async fn saved(&self) -> Vec<(String, u32)> {
            self.checkpoints
                .list("eos")
                .await
                .unwrap()
                .into_iter()
                .map(|cp| (cp.worker, cp.block_number))
                .collect()
        }

        async fn block_id(&self, num: u32) -> Option<String> {
            self.store
                .get(EntityKind::Block, &num.to_string())
                .await
                .unwrap()
                .and_then(|doc| doc.body["block_id"].as_str().map(str::to_string))
        }
    }

    async fn run(orchestrator: Orchestrator) -> RunSummary {
        tokio::time::timeout(LIMIT, orchestrator.run()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn backfill_indexes_every_irreversible_block() {
        let h = Harness::new(MockShip::new(40, 35).with_payloads(transfer_payload));

        let summary = run(h.orchestrator(config())).await;

        assert_eq!(h.store.count(EntityKind::Block), 35);
        assert_eq!(h.store.count(EntityKind::Transaction), 35);
        assert_eq!(h.store.count(EntityKind::Action), 35);
        assert!(h.block_id(36).await.is_none());
        assert_eq!(h.block_id(12).await, h.ship.block_id(12));

        assert_eq!(summary.readers.len(), 4);
        assert!(summary.readers.iter().all(|r| r.outcome == ReaderOutcome::Completed));
        assert!(summary.readers.iter().all(|r| r.worker.state == WorkerState::Retired));
        assert!(summary.abandoned.is_empty());
        assert_eq!(summary.blocks, 35);
        assert_eq!(summary.written, 35 * 3);

        assert_eq!(
            h.saved().await,
            vec![
                ("reader:1-11".to_string(), 10),
                ("reader:11-21".to_string(), 20),
                ("reader:21-31".to_string(), 30),
                ("reader:31-36".to_string(), 35),
            ]
        );
        let endpoints = h.checkpoints.endpoints().await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert!(endpoints[0].healthy);
    }

    #[tokio::test]
    async fn restart_resumes_from_checkpoints() {
        let h = Harness::new(MockShip::new(30, 30).with_payloads(transfer_payload));
        for (worker, block_number) in [("reader:1-11", 10), ("reader:11-21", 15)] {
            h.checkpoints
                .save(Checkpoint {
                    chain_id: "eos".into(),
                    worker: worker.into(),
                    block_number,
                    updated_at: 0,
                })
                .await
                .unwrap();
        }

        let summary = run(h.orchestrator(config())).await;

        assert_eq!(summary.readers.len(), 2);
        let mut starts: Vec<u32> = h.ship.stats().requests.iter().map(|r| r.start_block_num).collect();
        starts.sort_unstable();
        assert_eq!(starts, vec![16, 21]);
        assert!(h.block_id(15).await.is_none());
        assert!(h.block_id(16).await.is_some());
        assert_eq!(h.store.count(EntityKind::Block), 15);
        assert!(h.saved().await.contains(&("reader:11-21".to_string(), 20)));
    }

    #[tokio::test]
    async fn failed_reader_restarts_from_its_checkpoint() {
        let served = Arc::new(AtomicU32::new(0));
        let counter = served.clone();
        let ship = MockShip::new(20, 20).with_payloads(move |num, id, prev| {
            let mut payload = transfer_payload(num, id, prev);
            if num == 5 && counter.fetch_add(1, Ordering::SeqCst) == 0 {
                payload.block = "not a header".into();
            }
            payload
        });
        let h = Harness::new(ship);
        let mut cfg = config();
        cfg.scaling.max_worker_failures = 2;

        let summary = run(h.orchestrator(cfg)).await;

        assert_eq!(served.load(Ordering::SeqCst), 2);
        assert_eq!(h.store.count(EntityKind::Block), 20);
        assert!(summary.abandoned.is_empty());

        let first: Vec<&ReaderReport> = summary
            .readers
            .iter()
            .filter(|r| r.worker.range == BlockRange::new(1, 11))
            .collect();
        assert_eq!(first.len(), 2);
        assert!(matches!(first[0].outcome, ReaderOutcome::Failed(ref reason) if reason.contains("block 5")));
        assert_eq!(first[1].outcome, ReaderOutcome::Completed);
        assert_eq!(first[1].worker.failures, 1);
        assert_eq!(first[1].worker.id, first[0].worker.id);
        assert_ne!(first[1].lane, first[0].lane);
        assert!(h.saved().await.contains(&("reader:1-11".to_string(), 10)));
    }

    #[tokio::test]
    async fn range_is_abandoned_after_every_replacement_fails() {
        let ship = MockShip::new(20, 20).with_payloads(|num, id, prev| {
            let mut payload = transfer_payload(num, id, prev);
            if num == 5 {
                payload.block = "not a header".into();
            }
            payload
        });
        let h = Harness::new(ship);
        let mut cfg = config();
        cfg.scaling.max_worker_failures = 2;

        let summary = run(h.orchestrator(cfg)).await;

        assert_eq!(summary.abandoned, vec![BlockRange::new(1, 11)]);
        let failed: Vec<&ReaderReport> = summary
            .readers
            .iter()
            .filter(|r| matches!(r.outcome, ReaderOutcome::Failed(_)))
            .collect();
        assert_eq!(failed.len(), 4);
        assert_eq!(failed.iter().map(|r| r.worker.generation).max(), Some(1));
        assert!(h.block_id(5).await.is_none());

        let saved = h.saved().await;
        assert!(saved.contains(&("reader:11-21".to_string(), 20)));
        assert!(saved.iter().all(|(w, b)| w != "reader:1-11" || *b < 5));
    }

    #[tokio::test]
    async fn live_reader_rolls_back_a_fork_and_indexes_the_new_branch() {
        let ship = MockShip::new(30, 20).with_payloads(transfer_payload);
        ship.reorg_after(28, 26, 7);
        let h = Harness::new(ship);
        let mut cfg = config();
        cfg.live = true;

        let store = h.store.clone();
        let node = h.ship.clone();
        let shutdown = async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let Some(expected) = node.block_id(30) else { continue };
                let indexed = store
                    .get(EntityKind::Block, "30")
                    .await
                    .ok()
                    .flatten()
                    .map(|doc| doc.body["block_id"] == json!(expected));
                if indexed == Some(true) {
                    return;
                }
            }
        };
        let summary = tokio::time::timeout(LIMIT, h.orchestrator(cfg).run_until(shutdown))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.forks(), 1);
        assert_eq!(summary.rollbacks.len(), 1);
        assert_eq!(summary.rollbacks[0].rollback_block_num, 25);
        assert_eq!(summary.rollbacks[0].resume_from, 26);

        for num in 1..=30 {
            assert_eq!(h.block_id(num).await, h.ship.block_id(num), "block {num}");
        }
        assert_eq!(h.store.count(EntityKind::Block), 30);

        let live = summary
            .readers
            .iter()
            .find(|r| r.worker.range.is_open())
            .unwrap();
        assert_eq!(live.outcome, ReaderOutcome::Stopped);
        assert_eq!(live.worker.state, WorkerState::Retired);
        assert!(h.saved().await.contains(&("reader:live".to_string(), 30)));
    }

    #[tokio::test]
    async fn abi_cache_is_seeded_from_indexed_abi_documents() {
        let h = Harness::new(MockShip::new(10, 10).with_payloads(transfer_payload));
        let body = abi_document_body("eosio.token", 1, &AbiPayload::Json(token_abi()));
        h.store
            .bulk_write(&[Document::upsert(EntityKind::Abi, "1-eosio.token", 1, body)])
            .await
            .unwrap();

        let summary = run(h.builder(config()).build().unwrap()).await;

        assert_eq!(summary.flagged, 0);
        let actions = h.store.list(EntityKind::Action).await.unwrap();
        assert_eq!(actions.len(), 10);
        assert!(actions.iter().all(|doc| doc.body.get("@transfer").is_some()));
    }

    const GAME_ABI: &str = r#"{"actions":[{"name":"play","type":"play"}],"tables":[]}"#;

    /// Block 9 publishes the `game` ABI, block 11 (next range) calls it.
    fn game_payload(num: u32, id: &str, prev_id: &str) -> BlockPayload {
        let trx = match num {
            9 => TrxBuilder::new("t9").action("eosio", "setabi", setabi_data("game", GAME_ABI), &[]),
            11 => TrxBuilder::new("t11").action("game", "play", json!({"move": "e4"}), &[]),
            _ => return transfer_payload(num, id, prev_id),
        };
        let (block, traces, deltas) = BlockBuilder::new(num).transaction(trx).segments(prev_id);
        BlockPayload { block, traces, deltas }
    }

    #[tokio::test]
    async fn abi_scan_runs_before_overlapping_readers() {
        let h = Harness::new(MockShip::new(20, 20).with_payloads(game_payload));
        let mut cfg = config();
        cfg.features.abi_prescan = true;
        let orchestrator = h
            .builder(cfg)
            .abi("eosio", 1, AbiPayload::Json(system_abi()))
            .abi("eosio.token", 1, AbiPayload::Json(token_abi()))
            .build()
            .unwrap();

        let summary = run(orchestrator).await;

        let plan = summary.plan.as_ref().unwrap();
        assert_eq!(plan.abi_scan.len(), 2);
        let scan = summary.abi_scan.as_ref().unwrap();
        assert_eq!(scan.blocks, 20);
        assert_eq!(scan.abis, 1);
        assert!(scan.readers.iter().all(|r| r.outcome == ReaderOutcome::Completed));
        assert!(scan.readers.iter().all(|r| r.worker.pass == Pass::AbiScan));

        // Block 11 is decoded with the ABI from block 9 whichever lane ran first.
        assert_eq!(summary.flagged, 0);
        assert_eq!(summary.blocks, 20);
        let play = h
            .store
            .list(EntityKind::Action)
            .await
            .unwrap()
            .into_iter()
            .find(|doc| doc.block_num == 11)
            .unwrap();
        assert!(play.body.get("ds_error").is_none());
        assert_eq!(h.store.count(EntityKind::Abi), 1);

        let saved = h.saved().await;
        assert!(saved.contains(&("abi-scan:1-11".to_string(), 10)));
        assert!(saved.contains(&("abi-scan:11-21".to_string(), 20)));
        assert!(saved.contains(&("reader:11-21".to_string(), 20)));
    }

    #[tokio::test]
    async fn finished_abi_scan_is_not_repeated() {
        let h = Harness::new(MockShip::new(20, 20).with_payloads(transfer_payload));
        for worker in ["abi-scan:1-11", "abi-scan:11-21"] {
            h.checkpoints
                .save(Checkpoint {
                    chain_id: "eos".into(),
                    worker: worker.into(),
                    block_number: 20,
                    updated_at: 0,
                })
                .await
                .unwrap();
        }
        let mut cfg = config();
        cfg.features.abi_prescan = true;

        let summary = run(h.orchestrator(cfg)).await;

        assert!(summary.abi_scan.is_none());
        assert_eq!(h.ship.stats().requests.len(), 2);
        assert_eq!(h.store.count(EntityKind::Block), 20);
    }

    #[tokio::test]
    async fn checkpoints_of_another_batch_size_are_resumed() {
        let h = Harness::new(MockShip::new(30, 30).with_payloads(transfer_payload));
        // Written by a run with ranges of 5.
        for (worker, block_number) in [("reader:1-6", 5), ("reader:6-11", 10), ("reader:11-16", 13)] {
            h.checkpoints
                .save(Checkpoint {
                    chain_id: "eos".into(),
                    worker: worker.into(),
                    block_number,
                    updated_at: 0,
                })
                .await
                .unwrap();
        }

        let summary = run(h.orchestrator(config())).await;

        let mut starts: Vec<u32> = h.ship.stats().requests.iter().map(|r| r.start_block_num).collect();
        starts.sort_unstable();
        assert_eq!(starts, vec![14, 21]);
        assert_eq!(summary.readers.len(), 2);
        assert!(h.block_id(13).await.is_none());
        assert_eq!(h.store.count(EntityKind::Block), 17);
        assert!(h.saved().await.contains(&("reader:11-21".to_string(), 20)));
    }

    #[tokio::test]
    async fn no_healthy_endpoint_is_a_config_error() {
        let h = Harness::new(MockShip::new(10, 10).unreachable("ws://a"));

        let err = h.orchestrator(config()).run().await.unwrap_err();

        assert!(matches!(err, IndexerError::Config(_)));
        let endpoints = h.checkpoints.endpoints().await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert!(!endpoints[0].healthy);
    }
}
