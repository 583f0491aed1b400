//! Prefetch window accounting for one `get_blocks` request.
//!
//! The node may have at most `max_messages_in_flight` results unacknowledged.
//! A result counts as in flight from the moment it arrives until it has been
//! forwarded downstream and acknowledged, so a slow consumer throttles the
//! node instead of letting frames pile up in memory.

use shipindex_core::IndexerError;

#[derive(Debug, Clone)]
pub struct PrefetchWindow {
    size: u32,
    ack_batch: u32,
    received: u64,
    acked: u64,
    /// Forwarded but not yet acknowledged.
    forwarded: u32,
}

impl PrefetchWindow {
    /// Acknowledges in batches of half the window. Any batch size up to the
    /// window keeps the stream moving, since the node can always send enough
    /// results to fill one batch.
    pub fn new(size: u32) -> Self {
        let size = size.max(1);
        Self {
            size,
            ack_batch: (size / 2).max(1),
            received: 0,
            acked: 0,
            forwarded: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn ack_batch(&self) -> u32 {
        self.ack_batch
    }

    pub fn in_flight(&self) -> u64 {
        self.received - self.acked
    }

    /// Count an arriving result. A node that overruns the window is violating
    /// the protocol.
    pub fn on_received(&mut self) -> Result<(), IndexerError> {
        if self.in_flight() >= self.size as u64 {
            return Err(IndexerError::Protocol(format!(
                "node sent more than {} unacknowledged results",
                self.size
            )));
        }
        self.received += 1;
        Ok(())
    }

    /// Count a result handed downstream. Returns the number of messages to
    /// acknowledge once a batch is complete.
    pub fn on_forwarded(&mut self) -> Option<u32> {
        self.forwarded += 1;
        if self.forwarded >= self.ack_batch {
            Some(self.take_ack())
        } else {
            None
        }
    }

    /// Acknowledge a result that was consumed without being forwarded.
    pub fn on_skipped(&mut self) -> Option<u32> {
        self.on_forwarded()
    }

    fn take_ack(&mut self) -> u32 {
        let n = self.forwarded;
        self.forwarded = 0;
        self.acked += n as u64;
        n
    }
}
