//! Named, bounded inter-stage queues.
//!
//! Producers suspend when a queue is at capacity (`produce`) or get
//! [`IndexerError::QueueFull`] back (`try_produce`). Several consumers may
//! share one queue; each message goes to exactly one of them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::error::IndexerError;

/// Envelope carried on every queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage<T> {
    pub block_num: u32,
    /// Position of the block in its reader lane.
    pub sequence: u64,
    /// Reader lane that produced the block.
    pub lane: u32,
    pub payload: T,
}

pub struct QueueProducer<T> {
    name: Arc<str>,
    tx: mpsc::Sender<QueueMessage<T>>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

pub struct QueueConsumer<T> {
    name: Arc<str>,
    rx: Arc<Mutex<mpsc::Receiver<QueueMessage<T>>>>,
}

impl<T> Clone for QueueConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            rx: self.rx.clone(),
        }
    }
}

/// Create a queue holding at most `capacity` messages.
pub fn bounded<T>(name: impl Into<String>, capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let name: Arc<str> = Arc::from(name.into());
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueProducer { name: name.clone(), tx },
        QueueConsumer {
            name,
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl<T> QueueProducer<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue, waiting while the queue is full.
    pub async fn produce(&self, msg: QueueMessage<T>) -> Result<(), IndexerError> {
        self.tx.send(msg).await.map_err(|_| self.closed())
    }

    /// Enqueue without waiting.
    pub fn try_produce(&self, msg: QueueMessage<T>) -> Result<(), IndexerError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IndexerError::QueueFull {
                queue: self.name.to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => self.closed(),
        })
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    fn closed(&self) -> IndexerError {
        IndexerError::Aborted {
            reason: format!("queue '{}' closed", self.name),
        }
    }
}

impl<T> QueueConsumer<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next message, or `None` once every producer is gone and the queue is drained.
    pub async fn consume(&self) -> Option<QueueMessage<T>> {
        self.rx.lock().await.recv().await
    }

    /// Up to `max` messages. Waits for the first one, then collects whatever
    /// arrives until `linger` elapses. An empty batch means the queue closed.
    pub async fn consume_batch(&self, max: usize, linger: Duration) -> Vec<QueueMessage<T>> {
        let mut rx = self.rx.lock().await;
        let mut batch = Vec::with_capacity(max);
        let Some(first) = rx.recv().await else {
            return batch;
        };
        batch.push(first);

        let deadline = tokio::time::Instant::now() + linger;
        while batch.len() < max {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(msg)) => batch.push(msg),
                Ok(None) | Err(_) => break,
            }
        }
        batch
    }
}
