//! Stream client: one reader's connection to the state-history node.
//!
//! The client performs the handshake, requests a block range, forwards every
//! result downstream undecoded and acknowledges results only once they have
//! been handed over, which bounds the unacknowledged results to the prefetch
//! window. Linkage is checked against a [`BlockTracker`]; a mismatch is
//! reported as [`StreamEvent::Fork`] and the client waits for the rollback to
//! tell it where to continue.
//!
//! A broken connection is retried with exponential backoff, rotating through
//! the configured endpoints. The connection carries no resumable state, so
//! every new session starts from the checkpoint the owner publishes on the
//! `checkpoint` watch, plus one.

use std::sync::Arc;

use shipindex_core::config::IndexerConfig;
use shipindex_core::retry::{RetryConfig, RetryPolicy};
use shipindex_core::{BlockTracker, ForkDetected, IndexerError, RawBlock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::protocol::{GetBlocksRequest, ShipRequest, ShipResult, StatusResult};
use crate::transport::{Frame, ShipConnection, ShipTransport};
use crate::window::PrefetchWindow;

/// What the client hands to its owner.
#[derive(Debug)]
pub enum StreamEvent {
    /// Protocol ABI, sent by the node as the first frame of every session.
    ShipAbi(String),
    Status { url: String, status: StatusResult },
    Block(RawBlock),
    /// The client is paused until `resume` receives the block to continue from.
    Fork {
        fork: ForkDetected,
        last_irreversible: u32,
        resume: oneshot::Sender<u32>,
    },
}

/// `[start, end)`; an open range follows the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRange {
    pub start: u32,
    pub end: u32,
}

impl StreamRange {
    pub fn bounded(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn open(start: u32) -> Self {
        Self { start, end: u32::MAX }
    }

    pub fn is_open(&self) -> bool {
        self.end == u32::MAX
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// `max_messages_in_flight`.
    pub window: u32,
    pub fetch_block: bool,
    pub fetch_traces: bool,
    pub fetch_deltas: bool,
    pub irreversible_only: bool,
    pub reversible_window: usize,
    pub expected_chain_id: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            window: 50,
            fetch_block: true,
            fetch_traces: true,
            fetch_deltas: true,
            irreversible_only: false,
            reversible_window: 1_000,
            expected_chain_id: None,
        }
    }
}

impl StreamOptions {
    pub fn from_config(cfg: &IndexerConfig) -> Self {
        Self {
            window: cfg.prefetch.read,
            fetch_block: cfg.ship.fetch_block,
            fetch_traces: cfg.ship.fetch_traces,
            fetch_deltas: cfg.ship.fetch_deltas,
            irreversible_only: false,
            reversible_window: cfg.scaling.reversible_window,
            expected_chain_id: cfg.chain_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub blocks: u64,
    pub reconnects: u32,
    pub forks: u32,
    pub last_block: Option<u32>,
}

enum SessionEnd {
    Complete,
    /// Start a new session at the given block.
    Resume(u32),
}

struct RunState {
    tracker: BlockTracker,
    summary: StreamSummary,
    attempt: u32,
}

pub struct StreamClient {
    transport: Arc<dyn ShipTransport>,
    endpoints: Vec<String>,
    options: StreamOptions,
    policy: RetryPolicy,
    name: String,
}

impl StreamClient {
    pub fn new(
        transport: Arc<dyn ShipTransport>,
        endpoints: Vec<String>,
        options: StreamOptions,
        reconnect: RetryConfig,
    ) -> Self {
        Self {
            transport,
            endpoints,
            options,
            policy: RetryPolicy::new(reconnect),
            name: "reader".into(),
        }
    }

    /// Name used in log events.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Stream `range` into `events` until its last block has been forwarded,
    /// the consumer goes away, or reconnect attempts are exhausted.
    pub async fn run(
        &self,
        range: StreamRange,
        checkpoint: watch::Receiver<u32>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<StreamSummary, IndexerError> {
        if self.endpoints.is_empty() {
            return Err(IndexerError::Config("no state-history endpoints".into()));
        }
        let mut state = RunState {
            tracker: BlockTracker::new(self.options.reversible_window),
            summary: StreamSummary::default(),
            attempt: 0,
        };
        let mut endpoint = 0usize;
        let mut resume_override = None;

        loop {
            let resume_from = resume_override
                .take()
                .unwrap_or_else(|| checkpoint.borrow().saturating_add(1))
                .max(range.start);
            if resume_from >= range.end {
                return Ok(state.summary);
            }

            let url = &self.endpoints[endpoint % self.endpoints.len()];
            let outcome = match self.transport.connect(url).await {
                Ok(mut conn) => {
                    let outcome = self.session(conn.as_mut(), url, range, resume_from, &mut state, &events).await;
                    conn.close().await;
                    outcome
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(SessionEnd::Complete) => {
                    info!(
                        worker = %self.name,
                        blocks = state.summary.blocks,
                        reconnects = state.summary.reconnects,
                        forks = state.summary.forks,
                        "Stream range complete"
                    );
                    return Ok(state.summary);
                }
                Ok(SessionEnd::Resume(block)) => resume_override = Some(block),
                Err(e @ IndexerError::Aborted { .. }) => return Err(e),
                Err(e) => {
                    state.attempt += 1;
                    let Some(delay) = self.policy.next_delay(state.attempt) else {
                        error!(worker = %self.name, url = %url, error = %e, "Giving up on state-history stream");
                        return Err(e);
                    };
                    warn!(
                        worker = %self.name,
                        url = %url,
                        attempt = state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "State-history session failed, reconnecting"
                    );
                    state.summary.reconnects += 1;
                    endpoint += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn session(
        &self,
        conn: &mut dyn ShipConnection,
        url: &str,
        range: StreamRange,
        resume_from: u32,
        state: &mut RunState,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<SessionEnd, IndexerError> {
        match conn.recv().await? {
            Some(Frame::Text(abi)) => emit(events, StreamEvent::ShipAbi(abi)).await?,
            Some(Frame::Binary(_)) => {
                return Err(IndexerError::Protocol("expected the protocol ABI as first frame".into()))
            }
            None => return Err(IndexerError::Transport(format!("{url}: closed during handshake"))),
        }

        conn.send(ShipRequest::GetStatus.encode()).await?;
        let status = match ShipResult::decode(&next_binary(conn, url).await?)? {
            ShipResult::Status(status) => status,
            ShipResult::Blocks(_) => return Err(IndexerError::Protocol("expected a status result".into())),
        };
        self.check_status(url, resume_from, &status)?;
        emit(
            events,
            StreamEvent::Status {
                url: url.to_string(),
                status,
            },
        )
        .await?;

        state.tracker.rewind_to(resume_from.saturating_sub(1));
        let request = GetBlocksRequest {
            start_block_num: resume_from,
            end_block_num: range.end,
            max_messages_in_flight: self.options.window,
            have_positions: state.tracker.positions(),
            irreversible_only: self.options.irreversible_only,
            fetch_block: self.options.fetch_block,
            fetch_traces: self.options.fetch_traces,
            fetch_deltas: self.options.fetch_deltas,
        };
        info!(
            worker = %self.name,
            url = %url,
            start = resume_from,
            end = range.end,
            window = self.options.window,
            have_positions = request.have_positions.len(),
            "Requesting blocks"
        );
        conn.send(ShipRequest::GetBlocks(request).encode()).await?;

        let mut window = PrefetchWindow::new(self.options.window);
        loop {
            let frame = next_binary(conn, url).await?;
            let result = match ShipResult::decode(&frame)? {
                ShipResult::Blocks(result) => result,
                ShipResult::Status(_) => {
                    debug!(worker = %self.name, "Ignoring unsolicited status result");
                    continue;
                }
            };
            window.on_received()?;

            let last_irreversible = result.last_irreversible.block_num;
            let Some(this_block) = result.this_block else {
                ack(conn, window.on_skipped()).await?;
                continue;
            };
            let num = this_block.block_num;
            let prev_id = result.prev_block.as_ref().map(|p| p.block_id.as_str()).unwrap_or_default();

            state.tracker.prune_below(last_irreversible);
            if let Err(fork) = state.tracker.push(num, &this_block.block_id, prev_id) {
                state.summary.forks += 1;
                warn!(
                    worker = %self.name,
                    at = num,
                    common_ancestor = fork.common_ancestor,
                    previous_head = fork.previous_head,
                    last_irreversible,
                    "Fork detected"
                );
                let (tx, rx) = oneshot::channel();
                emit(
                    events,
                    StreamEvent::Fork {
                        fork,
                        last_irreversible,
                        resume: tx,
                    },
                )
                .await?;
                let resume = rx.await.map_err(|_| IndexerError::Aborted {
                    reason: "fork handler dropped without a resume point".into(),
                })?;
                if resume != num {
                    info!(worker = %self.name, resume, "Re-requesting from rollback point");
                    state.tracker.rewind_to(resume.saturating_sub(1));
                    return Ok(SessionEnd::Resume(resume));
                }
            }

            let block = RawBlock {
                head: result.head,
                last_irreversible: result.last_irreversible,
                this_block,
                prev_block: result.prev_block,
                block: result.block.unwrap_or_default(),
                traces: result.traces.unwrap_or_default(),
                deltas: result.deltas.unwrap_or_default(),
            };
            emit(events, StreamEvent::Block(block)).await?;
            state.summary.blocks += 1;
            state.summary.last_block = Some(num);
            state.attempt = 0;
            ack(conn, window.on_forwarded()).await?;

            if num.saturating_add(1) >= range.end {
                return Ok(SessionEnd::Complete);
            }
        }
    }

    fn check_status(&self, url: &str, resume_from: u32, status: &StatusResult) -> Result<(), IndexerError> {
        if let (Some(expected), Some(actual)) = (&self.options.expected_chain_id, &status.chain_id) {
            if expected != actual {
                return Err(IndexerError::Transport(format!(
                    "{url}: chain id {actual} does not match {expected}"
                )));
            }
        }
        if self.options.fetch_traces && resume_from < status.trace_begin_block {
            warn!(
                worker = %self.name,
                url = %url,
                resume_from,
                trace_begin_block = status.trace_begin_block,
                "Node has no traces for the start of the range"
            );
        }
        debug!(
            worker = %self.name,
            head = status.head.block_num,
            last_irreversible = status.last_irreversible.block_num,
            "Status received"
        );
        Ok(())
    }
}

async fn emit(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), IndexerError> {
    events.send(event).await.map_err(|_| IndexerError::Aborted {
        reason: "stream consumer closed".into(),
    })
}

async fn next_binary(conn: &mut dyn ShipConnection, url: &str) -> Result<bytes::Bytes, IndexerError> {
    match conn.recv().await? {
        Some(Frame::Binary(data)) => Ok(data),
        Some(Frame::Text(_)) => Err(IndexerError::Protocol("unexpected text frame".into())),
        None => Err(IndexerError::Transport(format!("{url}: connection closed"))),
    }
}

async fn ack(conn: &mut dyn ShipConnection, batch: Option<u32>) -> Result<(), IndexerError> {
    match batch {
        Some(num_messages) => conn.send(ShipRequest::GetBlocksAck { num_messages }.encode()).await,
        None => Ok(()),
    }
}
