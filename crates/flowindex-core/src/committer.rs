//! The persistence contract the ingestion engine writes through.
//!
//! Backends live in `flowindex-storage`; the engine only sees this trait and
//! [`CheckpointStore`](crate::checkpoint::CheckpointStore).

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::error::IndexerError;
use crate::types::FetchResult;

/// What a commit actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The block was new and has been written.
    Inserted,
    /// The same block id was already stored; nothing changed.
    AlreadyPresent,
    /// A different block was stored at this height and has been replaced.
    Replaced,
}

/// All-or-nothing writes of fetched blocks.
#[async_trait]
pub trait BlockCommitter: Send + Sync {
    /// Write the header, transactions, results and events of one block in a
    /// single atomic unit. Committing a block that is already stored is a
    /// successful no-op.
    async fn commit(&self, block: &FetchResult) -> Result<CommitOutcome, IndexerError>;

    /// Id of the committed block at `height`, if any.
    async fn block_id_at(&self, height: u64) -> Result<Option<String>, IndexerError>;

    /// Delete every committed row above `height`. When `checkpoint` is given
    /// it is written in the same atomic unit. Returns the number of blocks removed.
    async fn rollback_above(
        &self,
        height: u64,
        checkpoint: Option<Checkpoint>,
    ) -> Result<u64, IndexerError>;

    /// Highest committed height, if anything has been committed.
    async fn highest_height(&self) -> Result<Option<u64>, IndexerError>;

    /// Lowest committed height, if anything has been committed.
    async fn lowest_height(&self) -> Result<Option<u64>, IndexerError>;
}
