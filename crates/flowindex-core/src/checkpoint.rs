//! Checkpoints: the persisted "last fully committed height" per ingest mode.
//!
//! A forward checkpoint only moves up and a backward checkpoint only moves
//! down, except during reorg recovery when the forward checkpoint is reset
//! to the last common ancestor. On restart each service resumes from its
//! checkpoint instead of re-ingesting from scratch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Direction of an ingestion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Live tailing towards the chain head.
    Forward,
    /// Historical backfill towards genesis.
    Backward,
}

impl IngestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }

    /// The height after `height` in this mode's direction, if any.
    pub fn step(&self, height: u64) -> Option<u64> {
        match self {
            Self::Forward => height.checked_add(1),
            Self::Backward => height.checked_sub(1),
        }
    }

    /// Returns `true` if moving from `from` to `to` follows this mode's direction.
    pub fn is_progress(&self, from: u64, to: u64) -> bool {
        match self {
            Self::Forward => to >= from,
            Self::Backward => to <= from,
        }
    }
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IngestMode {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "live" => Ok(Self::Forward),
            "backward" | "history" | "backfill" => Ok(Self::Backward),
            other => Err(IndexerError::Other(format!("unknown ingest mode '{other}'"))),
        }
    }
}

/// A persisted checkpoint for one service/mode pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Service name (e.g. `"main_ingester"`).
    pub service: String,
    pub mode: IngestMode,
    /// Last fully committed height.
    pub height: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
///
/// Implemented by the storage backends in `flowindex-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a service/mode pair.
    async fn load(&self, service: &str, mode: IngestMode)
        -> Result<Option<Checkpoint>, IndexerError>;

    /// Save (upsert) a checkpoint.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    /// Delete a checkpoint (e.g. when resetting a service).
    async fn delete(&self, service: &str, mode: IngestMode) -> Result<(), IndexerError>;
}

/// Owns the checkpoint of a single service/mode pair.
///
/// Caches the last value so the orchestration loop reads it without a
/// storage round trip.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    service: String,
    mode: IngestMode,
    current: Option<u64>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, service: impl Into<String>, mode: IngestMode) -> Self {
        Self {
            store,
            service: service.into(),
            mode,
            current: None,
        }
    }

    pub fn mode(&self) -> IngestMode {
        self.mode
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Last committed height known to this manager.
    pub fn current(&self) -> Option<u64> {
        self.current
    }

    /// Load the persisted checkpoint into the cache.
    pub async fn load(&mut self) -> Result<Option<u64>, IndexerError> {
        let cp = self.store.load(&self.service, self.mode).await?;
        self.current = cp.map(|c| c.height);
        Ok(self.current)
    }

    /// Next height to ingest: one step past the checkpoint, or `start` when
    /// no checkpoint exists yet. `None` when the checkpoint sits at the end
    /// of the mode's range (height 0 for backward).
    pub fn next_height(&self, start: u64) -> Option<u64> {
        match self.current {
            Some(h) => self.mode.step(h),
            None => Some(start),
        }
    }

    /// Advance after a successful commit. Refuses to move against the mode's direction.
    pub async fn advance(&mut self, height: u64) -> Result<(), IndexerError> {
        if let Some(from) = self.current {
            if !self.mode.is_progress(from, height) {
                return Err(IndexerError::CheckpointRegression {
                    service: self.service.clone(),
                    direction: match self.mode {
                        IngestMode::Forward => "backward",
                        IngestMode::Backward => "forward",
                    },
                    from,
                    to: height,
                });
            }
        }
        self.persist(height).await
    }

    /// Move the checkpoint to `height` regardless of direction (reorg recovery).
    pub async fn reset_to(&mut self, height: u64) -> Result<(), IndexerError> {
        tracing::warn!(
            service = %self.service,
            mode = %self.mode,
            from = ?self.current,
            to = height,
            "checkpoint reset"
        );
        self.persist(height).await
    }

    async fn persist(&mut self, height: u64) -> Result<(), IndexerError> {
        let cp = Checkpoint {
            service: self.service.clone(),
            mode: self.mode,
            height,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(cp).await?;
        self.current = Some(height);
        Ok(())
    }
}
