//! Transport boundary for the state-history connection.
//!
//! [`ShipTransport`] opens connections; a [`ShipConnection`] exchanges whole
//! frames. [`WsTransport`] is the production implementation over
//! `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::SplitSink, stream::SplitStream, SinkExt, StreamExt};
use shipindex_core::IndexerError;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

/// One inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Only the protocol ABI is sent as text.
    Text(String),
    Binary(Bytes),
}

#[async_trait]
pub trait ShipTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn ShipConnection>, IndexerError>;
}

#[async_trait]
pub trait ShipConnection: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), IndexerError>;

    /// Next frame, or `None` once the peer closed the connection.
    async fn recv(&mut self) -> Result<Option<Frame>, IndexerError>;

    async fn close(&mut self);
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    max_payload: usize,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(max_payload_mb: usize, connect_timeout_ms: u64) -> Self {
        Self {
            max_payload: max_payload_mb.max(1) * 1024 * 1024,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        }
    }

    pub fn from_config(cfg: &shipindex_core::config::ShipConfig) -> Self {
        Self::new(cfg.max_payload_mb, cfg.connect_timeout_ms)
    }
}

#[async_trait]
impl ShipTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn ShipConnection>, IndexerError> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_payload);
        config.max_frame_size = Some(self.max_payload);

        debug!("Connecting to state-history endpoint: {}", url);
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async_with_config(url, Some(config), false))
            .await
            .map_err(|_| IndexerError::Transport(format!("{url}: connect timed out")))?
            .map_err(|e| IndexerError::Transport(format!("{url}: {e}")))?;
        info!("State-history connected: {}", url);

        let (write, read) = ws.split();
        Ok(Box::new(WsConnection {
            url: url.to_string(),
            write,
            read,
        }))
    }
}

struct WsConnection {
    url: String,
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl ShipConnection for WsConnection {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), IndexerError> {
        self.write
            .send(Message::Binary(frame))
            .await
            .map_err(|e| IndexerError::Transport(format!("{}: {e}", self.url)))
    }

    async fn recv(&mut self) -> Result<Option<Frame>, IndexerError> {
        while let Some(msg) = self.read.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Ok(Some(Frame::Binary(Bytes::from(data)))),
                Ok(Message::Text(text)) => return Ok(Some(Frame::Text(text))),
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.write.send(Message::Pong(payload)).await {
                        warn!("Failed to answer ping from {}: {}", self.url, e);
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!("State-history closed by peer: {} ({:?})", self.url, frame);
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) => return Err(IndexerError::Transport(format!("{}: {e}", self.url))),
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            debug!("Close of {} failed: {}", self.url, e);
        }
    }
}

// ─── Scripted node ───────────────────────────────────────────────────────────

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! An in-process state-history node with a synthetic chain.
    //!
    //! It honours `max_messages_in_flight` credits, answers status requests,
    //! resumes at the first mismatching `have_positions` entry, and can drop
    //! the connection or switch to another branch on cue. Everything it sees
    //! is recorded in [`MockStats`].

    use std::collections::{BTreeMap, HashSet, VecDeque};
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;
    use shipindex_core::types::BlockPosition;
    use shipindex_core::IndexerError;

    use super::{Frame, ShipConnection, ShipTransport};
    use crate::protocol::{synthetic_block_id, BlocksResult, GetBlocksRequest, ShipRequest, ShipResult, StatusResult};

    pub const MOCK_CHAIN_ID: &str = "aca376f206b8fc25a6ed44dbdc66547c36c6c33e3a119ffbeaef943642f0e906";

    /// `{actions, tables}` JSON accepted by the mock codec.
    pub const MOCK_SHIP_ABI: &str = r#"{"version":"eosio::abi/1.1","actions":[],"tables":[]}"#;

    #[derive(Debug, Clone)]
    pub struct BlockPayload {
        pub block: Bytes,
        pub traces: Bytes,
        pub deltas: Bytes,
    }

    pub type PayloadFn = Arc<dyn Fn(u32, &str, &str) -> BlockPayload + Send + Sync>;

    /// Header JSON in the shape the deserializer reads from `signed_block`.
    pub fn default_payload(num: u32, _id: &str, prev_id: &str) -> BlockPayload {
        let header = json!({
            "timestamp": format!("2024-01-01T00:{:02}:{:02}.000", (num / 120) % 60, (num / 2) % 60),
            "producer": "eosio",
            "confirmed": 0,
            "previous": prev_id,
            "schedule_version": 1,
        });
        BlockPayload {
            block: Bytes::from(header.to_string()),
            traces: Bytes::from_static(b"[]"),
            deltas: Bytes::from_static(b"[]"),
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MockStats {
        pub connections: Vec<String>,
        pub requests: Vec<GetBlocksRequest>,
        pub blocks_sent: u64,
        pub acks: u64,
        /// Highest `sent - acked` seen on any connection.
        pub max_outstanding: u64,
        /// Times the client waited for a block it had no credit for.
        pub stalls: u64,
    }

    #[derive(Debug, Clone, Copy)]
    struct Reorg {
        after: u32,
        from: u32,
        salt: u8,
    }

    struct MockBlock {
        id: String,
        prev_id: String,
    }

    struct ShipState {
        chain: BTreeMap<u32, MockBlock>,
        lib: u32,
        chain_id: Option<String>,
        unreachable: HashSet<String>,
        drop_before: Option<u32>,
        reorg: Option<Reorg>,
        payloads: PayloadFn,
        stats: MockStats,
    }

    impl ShipState {
        fn head(&self) -> u32 {
            self.chain.keys().next_back().copied().unwrap_or(0)
        }

        fn position(&self, num: u32) -> BlockPosition {
            let id = self.chain.get(&num).map(|b| b.id.clone()).unwrap_or_else(|| synthetic_block_id(num, 0));
            BlockPosition::new(num, id)
        }

        fn rebuild_from(&mut self, from: u32, salt: u8) {
            let head = self.head();
            for num in from..=head {
                let prev_id = self
                    .chain
                    .get(&(num - 1))
                    .map(|b| b.id.clone())
                    .unwrap_or_else(|| synthetic_block_id(num - 1, 0));
                self.chain.insert(num, MockBlock { id: synthetic_block_id(num, salt), prev_id });
            }
        }
    }

    /// Cheap to clone; clones share the node.
    #[derive(Clone)]
    pub struct MockShip {
        state: Arc<Mutex<ShipState>>,
    }

    impl MockShip {
        /// A chain of blocks `1..=head` with the given last irreversible block.
        pub fn new(head: u32, lib: u32) -> Self {
            let mut chain = BTreeMap::new();
            for num in 1..=head {
                chain.insert(
                    num,
                    MockBlock {
                        id: synthetic_block_id(num, 0),
                        prev_id: synthetic_block_id(num - 1, 0),
                    },
                );
            }
            Self {
                state: Arc::new(Mutex::new(ShipState {
                    chain,
                    lib,
                    chain_id: Some(MOCK_CHAIN_ID.to_string()),
                    unreachable: HashSet::new(),
                    drop_before: None,
                    reorg: None,
                    payloads: Arc::new(default_payload),
                    stats: MockStats::default(),
                })),
            }
        }

        pub fn with_payloads(self, payloads: impl Fn(u32, &str, &str) -> BlockPayload + Send + Sync + 'static) -> Self {
            self.state.lock().payloads = Arc::new(payloads);
            self
        }

        pub fn with_chain_id(self, chain_id: Option<&str>) -> Self {
            self.state.lock().chain_id = chain_id.map(str::to_string);
            self
        }

        /// Refuse connections to `url`.
        pub fn unreachable(self, url: &str) -> Self {
            self.state.lock().unreachable.insert(url.to_string());
            self
        }

        /// Close the connection instead of sending block `num`, once.
        pub fn drop_before(&self, num: u32) {
            self.state.lock().drop_before = Some(num);
        }

        /// After sending block `after`, replace blocks `from..` with another
        /// branch and continue streaming at `from`.
        pub fn reorg_after(&self, after: u32, from: u32, salt: u8) {
            self.state.lock().reorg = Some(Reorg { after, from, salt });
        }

        pub fn block_id(&self, num: u32) -> Option<String> {
            self.state.lock().chain.get(&num).map(|b| b.id.clone())
        }

        pub fn stats(&self) -> MockStats {
            self.state.lock().stats.clone()
        }
    }

    #[async_trait]
    impl ShipTransport for MockShip {
        async fn connect(&self, url: &str) -> Result<Box<dyn ShipConnection>, IndexerError> {
            let mut state = self.state.lock();
            state.stats.connections.push(url.to_string());
            if state.unreachable.contains(url) {
                return Err(IndexerError::Transport(format!("{url}: connection refused")));
            }
            Ok(Box::new(MockConnection {
                state: self.state.clone(),
                sent_abi: false,
                pending: VecDeque::new(),
                session: None,
            }))
        }
    }

    struct Session {
        next: u32,
        end: u32,
        window: u64,
        sent: u64,
        acked: u64,
        request: GetBlocksRequest,
    }

    struct MockConnection {
        state: Arc<Mutex<ShipState>>,
        sent_abi: bool,
        pending: VecDeque<Vec<u8>>,
        session: Option<Session>,
    }

    fn encode(result: ShipResult) -> Result<Vec<u8>, IndexerError> {
        result.encode().map_err(IndexerError::from)
    }

    #[async_trait]
    impl ShipConnection for MockConnection {
        async fn send(&mut self, frame: Vec<u8>) -> Result<(), IndexerError> {
            let request = ShipRequest::decode(&frame)?;
            let mut state = self.state.lock();
            match request {
                ShipRequest::GetStatus => {
                    let head = state.head();
                    let status = StatusResult {
                        head: state.position(head),
                        last_irreversible: state.position(state.lib),
                        trace_begin_block: 1,
                        trace_end_block: head + 1,
                        chain_state_begin_block: 1,
                        chain_state_end_block: head + 1,
                        chain_id: state.chain_id.clone(),
                    };
                    self.pending.push_back(encode(ShipResult::Status(status))?);
                }
                ShipRequest::GetBlocks(req) => {
                    state.stats.requests.push(req.clone());
                    let mut next = req.start_block_num;
                    for pos in &req.have_positions {
                        let matches = state.chain.get(&pos.block_num).map_or(false, |b| b.id == pos.block_id);
                        if !matches {
                            next = next.min(pos.block_num);
                        }
                    }
                    self.session = Some(Session {
                        next,
                        end: req.end_block_num,
                        window: req.max_messages_in_flight as u64,
                        sent: 0,
                        acked: 0,
                        request: req,
                    });
                }
                ShipRequest::GetBlocksAck { num_messages } => {
                    state.stats.acks += num_messages as u64;
                    if let Some(s) = self.session.as_mut() {
                        s.acked += num_messages as u64;
                    }
                }
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Frame>, IndexerError> {
            if !self.sent_abi {
                self.sent_abi = true;
                return Ok(Some(Frame::Text(MOCK_SHIP_ABI.to_string())));
            }
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(Frame::Binary(Bytes::from(frame))));
            }

            let frame = {
                let mut state = self.state.lock();
                let Some(s) = self.session.as_mut() else {
                    return Err(IndexerError::Transport("mock: recv without a request".into()));
                };
                if s.sent.saturating_sub(s.acked) >= s.window {
                    state.stats.stalls += 1;
                    return Err(IndexerError::Transport("mock: no credit left".into()));
                }
                if let Some(reorg) = state.reorg {
                    if s.next == reorg.after + 1 {
                        state.rebuild_from(reorg.from, reorg.salt);
                        state.reorg = None;
                        s.next = reorg.from;
                    }
                }
                if s.next >= s.end || s.next > state.head() {
                    None
                } else if state.drop_before == Some(s.next) {
                    state.drop_before = None;
                    return Ok(None);
                } else {
                    let num = s.next;
                    let (id, prev_id) = match state.chain.get(&num) {
                        Some(b) => (b.id.clone(), b.prev_id.clone()),
                        None => return Err(IndexerError::Transport(format!("mock: block {num} missing"))),
                    };
                    let payload = (state.payloads)(num, &id, &prev_id);
                    let head = state.head();
                    let result = BlocksResult {
                        head: state.position(head),
                        last_irreversible: state.position(state.lib),
                        this_block: Some(BlockPosition::new(num, id)),
                        prev_block: (num > 1).then(|| BlockPosition::new(num - 1, prev_id)),
                        block: s.request.fetch_block.then_some(payload.block),
                        traces: s.request.fetch_traces.then_some(payload.traces),
                        deltas: s.request.fetch_deltas.then_some(payload.deltas),
                    };
                    s.next += 1;
                    s.sent += 1;
                    state.stats.blocks_sent += 1;
                    state.stats.max_outstanding = state.stats.max_outstanding.max(s.sent.saturating_sub(s.acked));
                    Some(encode(ShipResult::Blocks(result))?)
                }
            };

            match frame {
                Some(frame) => Ok(Some(Frame::Binary(Bytes::from(frame)))),
                // A real node waits for the chain to grow.
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.session = None;
        }
    }
}
