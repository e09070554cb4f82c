//! Handlers notified after blocks are committed, plus a broadcast-channel
//! handler for API subscribers.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::checkpoint::IngestMode;
use crate::error::IndexerError;
use crate::types::{BlockHeader, FetchResult, IndexedTransaction};

/// A block as announced to subscribers: the header plus its user transactions.
#[derive(Debug, Clone)]
pub struct CommittedBlock {
    pub header: BlockHeader,
    /// Non-system transactions, in block order.
    pub transactions: Vec<IndexedTransaction>,
}

impl CommittedBlock {
    pub fn from_fetch(result: &FetchResult) -> Self {
        Self {
            header: result.header.clone(),
            transactions: result.user_transactions().cloned().collect(),
        }
    }
}

/// Called once per committed block, in commit order (forward mode only).
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn on_block(&self, block: &CommittedBlock) -> Result<(), IndexerError>;

    fn name(&self) -> &str {
        "block-handler"
    }
}

/// Called once per committed batch with the half-open range `[from, to)`.
#[async_trait]
pub trait RangeHandler: Send + Sync {
    async fn on_range(&self, mode: IngestMode, from: u64, to: u64) -> Result<(), IndexerError>;
}

/// Registry of block + range handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    block_handlers: Vec<Arc<dyn BlockHandler>>,
    range_handlers: Vec<Arc<dyn RangeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block handler (called for every committed block).
    pub fn on_block(&mut self, handler: Arc<dyn BlockHandler>) {
        self.block_handlers.push(handler);
    }

    /// Register a range handler.
    pub fn on_range(&mut self, handler: Arc<dyn RangeHandler>) {
        self.range_handlers.push(handler);
    }

    pub fn has_block_handlers(&self) -> bool {
        !self.block_handlers.is_empty()
    }

    /// Dispatch a block to all block handlers. Every handler runs; the first
    /// error is returned.
    pub async fn dispatch_block(&self, block: &CommittedBlock) -> Result<(), IndexerError> {
        let mut first_err = None;
        for handler in &self.block_handlers {
            if let Err(e) = handler.on_block(block).await {
                tracing::warn!(handler = handler.name(), height = block.header.height, error = %e, "block handler failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Dispatch a committed range to all range handlers.
    pub async fn dispatch_range(
        &self,
        mode: IngestMode,
        from: u64,
        to: u64,
    ) -> Result<(), IndexerError> {
        for handler in &self.range_handlers {
            handler.on_range(mode, from, to).await?;
        }
        Ok(())
    }
}

// ─── Broadcast channel ────────────────────────────────────────────────────────

/// Fans committed blocks out to any number of `tokio::sync::broadcast` receivers.
///
/// Slow receivers lag and drop the oldest blocks; the ingester never waits.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<Arc<CommittedBlock>>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to committed blocks.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CommittedBlock>> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl BlockHandler for ChannelBroadcaster {
    async fn on_block(&self, block: &CommittedBlock) -> Result<(), IndexerError> {
        // No receivers is not an error: nobody is listening yet.
        let _ = self.tx.send(Arc::new(block.clone()));
        Ok(())
    }

    fn name(&self) -> &str {
        "channel-broadcaster"
    }
}
