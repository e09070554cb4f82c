//! Ingester configuration and state types.

use serde::{Deserialize, Serialize};

use crate::checkpoint::IngestMode;

/// Configuration for one ingester instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngesterConfig {
    /// Unique name for this service (used for checkpoint keys).
    pub service: String,
    pub mode: IngestMode,
    /// First height to ingest when no checkpoint exists yet.
    pub start_height: u64,
    /// Forward: last height to ingest. Backward: lowest height to ingest.
    /// `None` = run until the head (forward) or genesis (backward).
    pub stop_height: Option<u64>,
    /// Heights dispatched per cycle.
    pub batch_size: u64,
    /// Concurrent fetch workers.
    pub worker_count: usize,
    /// Deepest divergence that is rolled back automatically.
    pub max_reorg_depth: u64,
    /// Recently committed block ids kept in memory for reorg checks.
    pub reorg_window: usize,
    /// Sleep when caught up with the head (milliseconds).
    pub poll_interval_ms: u64,
    /// Sleep after a failed cycle (milliseconds).
    pub error_backoff_ms: u64,
    /// Shrink forward batches near the head.
    pub adaptive_batch: bool,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            service: "main_ingester".into(),
            mode: IngestMode::Forward,
            start_height: 0,
            stop_height: None,
            batch_size: 50,
            worker_count: 10,
            max_reorg_depth: 1000,
            reorg_window: 256,
            poll_interval_ms: 1000,
            error_backoff_ms: 5000,
            adaptive_batch: true,
        }
    }
}

impl IngesterConfig {
    /// Defaults for a historical backfill instance.
    pub fn backward() -> Self {
        Self {
            service: "history_ingester".into(),
            mode: IngestMode::Backward,
            batch_size: 100,
            worker_count: 20,
            adaptive_batch: false,
            ..Self::default()
        }
    }

    /// Forward batch size for a node that is `behind` blocks behind the head.
    pub fn effective_batch(&self, behind: u64) -> u64 {
        let configured = self.batch_size.max(1);
        if !self.adaptive_batch || self.mode == IngestMode::Backward {
            return configured;
        }
        let near_head = match behind {
            0..=3 => 1,
            4..=20 => 5,
            21..=100 => 10,
            _ => configured,
        };
        near_head.min(configured)
    }
}

/// Runtime state of an ingester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngesterState {
    /// Waiting for the next cycle.
    Idle,
    /// Workers are fetching a batch.
    Fetching,
    /// Committing fetched blocks in height order.
    Committing,
    /// Rolling back a divergent range.
    ReorgRecovery,
    /// Backfill reached its lower bound.
    Completed,
    /// Terminated by cancellation.
    Stopped,
    /// Encountered an unrecoverable error.
    Error,
}

impl std::fmt::Display for IngesterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching => write!(f, "fetching"),
            Self::Committing => write!(f, "committing"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
