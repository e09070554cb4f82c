//! Fluent builder API for ingester services.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowindex_ingest::IngesterBuilder;
//!
//! let config = IngesterBuilder::forward()
//!     .service("main_ingester")
//!     .start_height(85_981_135)
//!     .batch_size(50)
//!     .worker_count(10)
//!     .build_config();
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use flowindex_core::checkpoint::CheckpointStore;
use flowindex_core::committer::BlockCommitter;
use flowindex_core::config::IngesterConfig;
use flowindex_core::handler::{BlockHandler, HandlerRegistry, RangeHandler};

use crate::service::IngesterService;
use crate::worker::BlockSource;

/// Fluent builder for [`IngesterService`].
#[derive(Default)]
pub struct IngesterBuilder {
    config: IngesterConfig,
    handlers: HandlerRegistry,
    cancel: Option<CancellationToken>,
}

impl IngesterBuilder {
    /// Start from the forward (live) defaults.
    pub fn forward() -> Self {
        Self::default()
    }

    /// Start from the backward (history) defaults.
    pub fn backward() -> Self {
        Self::from_config(IngesterConfig::backward())
    }

    pub fn from_config(config: IngesterConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Set the service name (used for checkpoint keys).
    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.config.service = name.into();
        self
    }

    /// Set the first height to ingest when no checkpoint exists.
    pub fn start_height(mut self, height: u64) -> Self {
        self.config.start_height = height;
        self
    }

    /// Set the last height (forward) or lowest height (backward) to ingest.
    pub fn stop_height(mut self, height: u64) -> Self {
        self.config.stop_height = Some(height);
        self
    }

    /// Set the number of heights dispatched per cycle.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the number of concurrent fetch workers.
    pub fn worker_count(mut self, n: usize) -> Self {
        self.config.worker_count = n;
        self
    }

    /// Set the deepest divergence that is rolled back automatically.
    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    pub fn reorg_window(mut self, blocks: usize) -> Self {
        self.config.reorg_window = blocks;
        self
    }

    /// Set the caught-up polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the sleep after a failed cycle in milliseconds.
    pub fn error_backoff_ms(mut self, ms: u64) -> Self {
        self.config.error_backoff_ms = ms;
        self
    }

    pub fn adaptive_batch(mut self, on: bool) -> Self {
        self.config.adaptive_batch = on;
        self
    }

    /// Register a committed-block handler (forward mode only).
    pub fn on_block(mut self, handler: Arc<dyn BlockHandler>) -> Self {
        self.handlers.on_block(handler);
        self
    }

    /// Register a committed-range handler.
    pub fn on_range(mut self, handler: Arc<dyn RangeHandler>) -> Self {
        self.handlers.on_range(handler);
        self
    }

    /// Stop the service when `token` is cancelled.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Build the `IngesterConfig`.
    pub fn build_config(self) -> IngesterConfig {
        self.config
    }

    /// Build the service over its collaborators.
    pub fn build(
        self,
        source: Arc<dyn BlockSource>,
        committer: Arc<dyn BlockCommitter>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> IngesterService {
        IngesterService::new(
            self.config,
            source,
            committer,
            checkpoints,
            self.handlers,
            self.cancel.unwrap_or_default(),
        )
    }
}
