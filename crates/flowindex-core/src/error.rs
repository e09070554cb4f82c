//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Errors that can occur while fetching, committing or reconciling blocks.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("fetch failed at height {height}: {reason}")]
    Fetch { height: u64, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Reorg at height {height} exceeds max depth {max_depth} (walked back {depth} blocks)")]
    ReorgTooDeep {
        height: u64,
        depth: u64,
        max_depth: u64,
    },

    #[error("Checkpoint for '{service}' cannot move {direction} from {from} to {to}")]
    CheckpointRegression {
        service: String,
        direction: &'static str,
        from: u64,
        to: u64,
    },

    #[error("no access node can serve height {height} (history floor {floor})")]
    HistoryFloor { height: u64, floor: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Wrap any displayable error as a fetch failure for `height`.
    pub fn fetch(height: u64, reason: impl std::fmt::Display) -> Self {
        Self::Fetch {
            height,
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if the error must stop the service.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReorgTooDeep { .. } | Self::Aborted { .. } | Self::CheckpointRegression { .. }
        )
    }
}
