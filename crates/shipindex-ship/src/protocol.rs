//! State-history wire format.
//!
//! Requests and results are variants tagged by a varuint32 index. Integers
//! are little-endian, `optional<T>` is a one-byte flag followed by `T`,
//! `bytes` and arrays carry a varuint32 length, checksums are 32 raw bytes.
//!
//! ```text
//! request  = 0 get_status_request_v0 {}
//!          | 1 get_blocks_request_v0 {start, end, max_messages_in_flight,
//!                                     have_positions[], irreversible_only,
//!                                     fetch_block, fetch_traces, fetch_deltas}
//!          | 2 get_blocks_ack_request_v0 {num_messages}
//! result   = 0 get_status_result_v0 {head, last_irreversible, trace_begin_block,
//!                                    trace_end_block, chain_state_begin_block,
//!                                    chain_state_end_block, chain_id?}
//!          | 1 get_blocks_result_v0 {head, last_irreversible, this_block?,
//!                                    prev_block?, block?, traces?, deltas?}
//! ```

use bytes::Bytes;
use shipindex_core::types::BlockPosition;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("unknown {kind} variant {index}")]
    UnknownVariant { kind: &'static str, index: u32 },
    #[error("varuint32 overflow at offset {0}")]
    VarintOverflow(usize),
    #[error("invalid bool {value} at offset {offset}")]
    InvalidBool { offset: usize, value: u8 },
    #[error("bad block id '{0}'")]
    BadBlockId(String),
    #[error("{0} trailing bytes after frame")]
    Trailing(usize),
}

impl From<FrameError> for shipindex_core::IndexerError {
    fn from(e: FrameError) -> Self {
        shipindex_core::IndexerError::Protocol(e.to_string())
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksRequest {
    pub start_block_num: u32,
    /// Exclusive; `u32::MAX` streams forever.
    pub end_block_num: u32,
    pub max_messages_in_flight: u32,
    pub have_positions: Vec<BlockPosition>,
    pub irreversible_only: bool,
    pub fetch_block: bool,
    pub fetch_traces: bool,
    pub fetch_deltas: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShipRequest {
    GetStatus,
    GetBlocks(GetBlocksRequest),
    GetBlocksAck { num_messages: u32 },
}

impl ShipRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        match self {
            Self::GetStatus => w.varuint32(0),
            Self::GetBlocks(req) => {
                w.varuint32(1);
                w.u32(req.start_block_num);
                w.u32(req.end_block_num);
                w.u32(req.max_messages_in_flight);
                w.varuint32(req.have_positions.len() as u32);
                for pos in &req.have_positions {
                    w.position(pos);
                }
                w.bool(req.irreversible_only);
                w.bool(req.fetch_block);
                w.bool(req.fetch_traces);
                w.bool(req.fetch_deltas);
            }
            Self::GetBlocksAck { num_messages } => {
                w.varuint32(2);
                w.u32(*num_messages);
            }
        }
        w.buf
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(frame);
        let req = match r.varuint32()? {
            0 => Self::GetStatus,
            1 => {
                let start_block_num = r.u32()?;
                let end_block_num = r.u32()?;
                let max_messages_in_flight = r.u32()?;
                let n = r.varuint32()? as usize;
                let mut have_positions = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    have_positions.push(r.position()?);
                }
                Self::GetBlocks(GetBlocksRequest {
                    start_block_num,
                    end_block_num,
                    max_messages_in_flight,
                    have_positions,
                    irreversible_only: r.bool()?,
                    fetch_block: r.bool()?,
                    fetch_traces: r.bool()?,
                    fetch_deltas: r.bool()?,
                })
            }
            2 => Self::GetBlocksAck { num_messages: r.u32()? },
            index => return Err(FrameError::UnknownVariant { kind: "request", index }),
        };
        r.finish()?;
        Ok(req)
    }
}

// ─── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResult {
    pub head: BlockPosition,
    pub last_irreversible: BlockPosition,
    pub trace_begin_block: u32,
    pub trace_end_block: u32,
    pub chain_state_begin_block: u32,
    pub chain_state_end_block: u32,
    /// Absent on nodes that predate the field.
    pub chain_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocksResult {
    pub head: BlockPosition,
    pub last_irreversible: BlockPosition,
    pub this_block: Option<BlockPosition>,
    pub prev_block: Option<BlockPosition>,
    pub block: Option<Bytes>,
    pub traces: Option<Bytes>,
    pub deltas: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShipResult {
    Status(StatusResult),
    Blocks(BlocksResult),
}

impl ShipResult {
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(frame);
        let result = match r.varuint32()? {
            0 => {
                let head = r.position()?;
                let last_irreversible = r.position()?;
                let trace_begin_block = r.u32()?;
                let trace_end_block = r.u32()?;
                let chain_state_begin_block = r.u32()?;
                let chain_state_end_block = r.u32()?;
                // Binary extension: may be missing entirely.
                let chain_id = if r.remaining() == 0 { None } else { Some(r.checksum()?) };
                Self::Status(StatusResult {
                    head,
                    last_irreversible,
                    trace_begin_block,
                    trace_end_block,
                    chain_state_begin_block,
                    chain_state_end_block,
                    chain_id,
                })
            }
            1 => Self::Blocks(BlocksResult {
                head: r.position()?,
                last_irreversible: r.position()?,
                this_block: r.optional(Reader::position)?,
                prev_block: r.optional(Reader::position)?,
                block: r.optional(Reader::bytes)?,
                traces: r.optional(Reader::bytes)?,
                deltas: r.optional(Reader::bytes)?,
            }),
            index => return Err(FrameError::UnknownVariant { kind: "result", index }),
        };
        r.finish()?;
        Ok(result)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut w = Writer::default();
        match self {
            Self::Status(s) => {
                w.varuint32(0);
                w.position_checked(&s.head)?;
                w.position_checked(&s.last_irreversible)?;
                w.u32(s.trace_begin_block);
                w.u32(s.trace_end_block);
                w.u32(s.chain_state_begin_block);
                w.u32(s.chain_state_end_block);
                if let Some(id) = &s.chain_id {
                    w.checksum(id)?;
                }
            }
            Self::Blocks(b) => {
                w.varuint32(1);
                w.position_checked(&b.head)?;
                w.position_checked(&b.last_irreversible)?;
                for pos in [&b.this_block, &b.prev_block] {
                    match pos {
                        Some(p) => {
                            w.bool(true);
                            w.position_checked(p)?;
                        }
                        None => w.bool(false),
                    }
                }
                for seg in [&b.block, &b.traces, &b.deltas] {
                    match seg {
                        Some(data) => {
                            w.bool(true);
                            w.varuint32(data.len() as u32);
                            w.buf.extend_from_slice(data);
                        }
                        None => w.bool(false),
                    }
                }
            }
        }
        Ok(w.buf)
    }
}

// ─── Primitive codec ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn varuint32(&mut self, mut v: u32) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    fn checksum(&mut self, hex_id: &str) -> Result<(), FrameError> {
        let raw = hex::decode(hex_id).map_err(|_| FrameError::BadBlockId(hex_id.to_string()))?;
        if raw.len() != 32 {
            return Err(FrameError::BadBlockId(hex_id.to_string()));
        }
        self.buf.extend_from_slice(&raw);
        Ok(())
    }

    fn position_checked(&mut self, pos: &BlockPosition) -> Result<(), FrameError> {
        self.u32(pos.block_num);
        self.checksum(&pos.block_id)
    }

    /// Request positions come from ids we decoded ourselves; a malformed one
    /// is written as zeros rather than failing the whole request.
    fn position(&mut self, pos: &BlockPosition) {
        let start = self.buf.len();
        if self.position_checked(pos).is_err() {
            self.buf.truncate(start);
            self.u32(pos.block_num);
            self.buf.extend_from_slice(&[0u8; 32]);
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < n {
            return Err(FrameError::Truncated { offset: self.pos, needed: n });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn varuint32(&mut self) -> Result<u32, FrameError> {
        let start = self.pos;
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.take(1)?[0];
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 28 {
                return Err(FrameError::VarintOverflow(start));
            }
        }
        u32::try_from(value).map_err(|_| FrameError::VarintOverflow(start))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn bool(&mut self) -> Result<bool, FrameError> {
        let offset = self.pos;
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(FrameError::InvalidBool { offset, value }),
        }
    }

    fn checksum(&mut self) -> Result<String, FrameError> {
        Ok(hex::encode(self.take(32)?))
    }

    fn position(&mut self) -> Result<BlockPosition, FrameError> {
        let block_num = self.u32()?;
        let block_id = self.checksum()?;
        Ok(BlockPosition { block_num, block_id })
    }

    fn bytes(&mut self) -> Result<Bytes, FrameError> {
        let len = self.varuint32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn optional<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, FrameError>) -> Result<Option<T>, FrameError> {
        if self.bool()? {
            f(self).map(Some)
        } else {
            Ok(None)
        }
    }

    fn finish(&self) -> Result<(), FrameError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(FrameError::Trailing(n)),
        }
    }
}

/// A 32-byte block id whose first four bytes are the big-endian block
/// number, as the chain builds them.
pub fn synthetic_block_id(block_num: u32, salt: u8) -> String {
    let mut raw = [salt; 32];
    raw[..4].copy_from_slice(&block_num.to_be_bytes());
    hex::encode(raw)
}
