//! The ingester service: one instance per direction.
//!
//! # Forward
//! Next height = checkpoint + 1, else the configured start, else 100 blocks
//! behind the sealed head. A batch is fetched by a bounded pool of workers,
//! committed in ascending order no matter the order in which fetches finish,
//! then the checkpoint moves to the batch max
//! and committed blocks are handed to the block handlers. Every block is
//! checked against the stored parent before it is committed; a divergence is
//! rolled back to the last common ancestor and ingestion resumes from there.
//!
//! # Backward
//! Descends from checkpoint − 1 towards the configured stop height or the
//! lowest height any access node can serve, committing in descending order.
//! Never calls block handlers.
//!
//! In both modes a failed height ends the batch: the contiguous prefix before
//! it is committed and acknowledged, the failure is recorded, and the failed
//! height is retried next cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use flowindex_core::checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, IngestMode};
use flowindex_core::committer::BlockCommitter;
use flowindex_core::config::{IngesterConfig, IngesterState};
use flowindex_core::error::IndexerError;
use flowindex_core::handler::{CommittedBlock, HandlerRegistry};
use flowindex_core::reorg::{Divergence, ReorgWindow};
use flowindex_core::types::FetchResult;

use crate::status::StatusHandle;
use crate::worker::{BlockSource, Canonical};

/// What one ingestion cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Blocks `first..=last` (in commit order) were committed.
    Committed { first: u64, last: u64, blocks: usize },
    /// A divergence was rolled back.
    Reorg(Divergence),
    /// Nothing new to ingest yet.
    CaughtUp,
    /// The configured range is exhausted.
    Finished,
}

/// How far behind the head a forward service without a checkpoint starts.
const FRESH_START_LAG: u64 = 100;

enum Plan {
    Batch(Vec<u64>),
    CaughtUp,
    Finished,
}

/// Drives one ingest mode from its checkpoint.
pub struct IngesterService {
    config: IngesterConfig,
    source: Arc<dyn BlockSource>,
    committer: Arc<dyn BlockCommitter>,
    checkpoint: CheckpointManager,
    handlers: HandlerRegistry,
    window: ReorgWindow,
    status: StatusHandle,
    cancel: CancellationToken,
    loaded: bool,
}

impl IngesterService {
    pub fn new(
        config: IngesterConfig,
        source: Arc<dyn BlockSource>,
        committer: Arc<dyn BlockCommitter>,
        checkpoints: Arc<dyn CheckpointStore>,
        handlers: HandlerRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            checkpoint: CheckpointManager::new(checkpoints, config.service.clone(), config.mode),
            window: ReorgWindow::new(config.reorg_window, config.max_reorg_depth),
            status: StatusHandle::new(config.service.clone(), config.mode),
            source,
            committer,
            handlers,
            cancel,
            loaded: false,
            config,
        }
    }

    pub fn config(&self) -> &IngesterConfig {
        &self.config
    }

    pub fn mode(&self) -> IngestMode {
        self.config.mode
    }

    /// Shareable status handle; stays valid after the service is moved into a task.
    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Last acknowledged height.
    pub fn checkpoint(&self) -> Option<u64> {
        self.checkpoint.current()
    }

    /// Run until cancelled, finished, or a fatal error.
    pub async fn run(&mut self) -> Result<(), IndexerError> {
        self.init().await?;
        tracing::info!(
            service = %self.config.service,
            mode = %self.mode(),
            checkpoint = ?self.checkpoint.current(),
            batch_size = self.config.batch_size,
            workers = self.config.worker_count,
            "ingester started"
        );

        loop {
            if self.cancel.is_cancelled() {
                self.status.set_state(IngesterState::Stopped);
                tracing::info!(service = %self.config.service, checkpoint = ?self.checkpoint.current(), "ingester stopped");
                return Ok(());
            }

            match self.tick().await {
                Ok(Cycle::Committed { .. }) | Ok(Cycle::Reorg(_)) => {
                    self.status.set_state(IngesterState::Idle);
                }
                Ok(Cycle::CaughtUp) => {
                    self.status.set_state(IngesterState::Idle);
                    self.pause(self.config.poll_interval_ms).await;
                }
                Ok(Cycle::Finished) => {
                    self.status.set_state(IngesterState::Completed);
                    tracing::info!(service = %self.config.service, checkpoint = ?self.checkpoint.current(), "ingester finished");
                    return Ok(());
                }
                Err(IndexerError::Cancelled) => {}
                Err(e) if e.is_fatal() => {
                    self.status.set_state(IngesterState::Error);
                    self.status.set_error(&e);
                    tracing::error!(service = %self.config.service, error = %e, "ingester aborted");
                    return Err(e);
                }
                Err(e) => {
                    self.status.set_state(IngesterState::Idle);
                    self.status.set_error(&e);
                    tracing::warn!(
                        service = %self.config.service,
                        error = %e,
                        backoff_ms = self.config.error_backoff_ms,
                        "ingest cycle failed"
                    );
                    self.pause(self.config.error_backoff_ms).await;
                }
            }
        }
    }

    /// Run a single cycle: plan a batch, fetch it, commit what can be committed.
    pub async fn tick(&mut self) -> Result<Cycle, IndexerError> {
        self.init().await?;
        let heights = match self.plan().await? {
            Plan::Batch(h) => h,
            Plan::CaughtUp => return Ok(Cycle::CaughtUp),
            Plan::Finished => return Ok(Cycle::Finished),
        };

        self.status.set_state(IngesterState::Fetching);
        let mut fetched = self.fetch_batch(&heights).await?;

        self.status.set_state(IngesterState::Committing);
        let forward = self.mode() == IngestMode::Forward;
        let mut committed: Vec<FetchResult> = Vec::with_capacity(heights.len());
        let mut failure: Option<IndexerError> = None;

        for h in &heights {
            let block = match fetched.remove(h) {
                Some(Ok(b)) => b,
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                None => break,
            };

            if forward {
                let divergence = {
                    let canonical = Canonical(self.source.as_ref());
                    self.window
                        .check(&block.header, self.committer.as_ref(), &canonical)
                        .await?
                };
                if let Some(div) = divergence {
                    return self.recover(div, committed).await;
                }
            }

            self.committer.commit(&block).await?;
            if forward {
                self.window.record(block.height(), block.id());
            }
            committed.push(block);
        }

        let (Some(first), Some(last)) = (committed.first(), committed.last()) else {
            return match failure {
                Some(e) if self.is_history_floor(&e) => {
                    tracing::info!(height = ?heights.first(), error = %e, "backfill reached history floor");
                    Ok(Cycle::Finished)
                }
                Some(e) => Err(e),
                None => Err(IndexerError::Cancelled),
            };
        };
        let (first, last) = (first.height(), last.height());

        self.checkpoint.advance(last).await?;
        self.acknowledge(&committed).await;

        match failure {
            Some(e) if !self.is_history_floor(&e) => {
                tracing::warn!(mode = %self.mode(), committed_to = last, error = %e, "batch partially committed");
                self.status.set_error(&e);
            }
            _ => self.status.clear_error(),
        }

        Ok(Cycle::Committed {
            first,
            last,
            blocks: committed.len(),
        })
    }

    // ─── Internals ───────────────────────────────────────────────────────────────

    async fn init(&mut self) -> Result<(), IndexerError> {
        if self.loaded {
            return Ok(());
        }
        if let Some(h) = self.checkpoint.load().await? {
            self.status.set_last_committed(h);
            tracing::info!(service = %self.config.service, mode = %self.mode(), height = h, "resuming from checkpoint");
        }
        self.loaded = true;
        Ok(())
    }

    async fn plan(&self) -> Result<Plan, IndexerError> {
        match self.mode() {
            IngestMode::Forward => self.plan_forward().await,
            IngestMode::Backward => self.plan_backward().await,
        }
    }

    async fn plan_forward(&self) -> Result<Plan, IndexerError> {
        let latest = self.source.latest_sealed_height().await?;
        let start = match (self.checkpoint.current(), self.config.start_height) {
            (None, 0) => self.fresh_start(latest),
            (_, start) => start,
        };
        let Some(next) = self.checkpoint.next_height(start) else {
            return Ok(Plan::Finished);
        };
        if matches!(self.config.stop_height, Some(stop) if next > stop) {
            return Ok(Plan::Finished);
        }

        if next > latest {
            return Ok(Plan::CaughtUp);
        }

        let batch = self.config.effective_batch(latest - next);
        let mut end = next.saturating_add(batch - 1).min(latest);
        if let Some(stop) = self.config.stop_height {
            end = end.min(stop);
        }
        Ok(Plan::Batch((next..=end).collect()))
    }

    async fn plan_backward(&self) -> Result<Plan, IndexerError> {
        let start = match self.checkpoint.current() {
            Some(_) => self.config.start_height,
            None => match self.backward_start().await? {
                Some(h) => h,
                None => return Ok(Plan::Finished),
            },
        };
        let Some(next) = self.checkpoint.next_height(start) else {
            return Ok(Plan::Finished);
        };

        let floor = self
            .config
            .stop_height
            .unwrap_or(0)
            .max(self.source.history_floor().unwrap_or(0));
        if next < floor {
            tracing::info!(service = %self.config.service, next, floor, "backfill reached history floor");
            return Ok(Plan::Finished);
        }

        let end = next
            .saturating_sub(self.config.batch_size.max(1) - 1)
            .max(floor);
        Ok(Plan::Batch((end..=next).rev().collect()))
    }

    /// First forward height with neither a checkpoint nor a configured start:
    /// a short way behind the head, never below what the nodes can serve.
    fn fresh_start(&self, latest: u64) -> u64 {
        let start = latest
            .saturating_sub(FRESH_START_LAG)
            .max(self.source.history_floor().unwrap_or(0));
        tracing::info!(service = %self.config.service, latest, start, "no checkpoint, starting near the head");
        start
    }

    /// First backward height without a checkpoint: the configured start, else
    /// just below what is already stored, else the sealed head.
    async fn backward_start(&self) -> Result<Option<u64>, IndexerError> {
        if self.config.start_height > 0 {
            return Ok(Some(self.config.start_height));
        }
        match self.committer.lowest_height().await? {
            Some(lowest) => Ok(lowest.checked_sub(1)),
            None => self.source.latest_sealed_height().await.map(Some),
        }
    }

    async fn fetch_batch(
        &self,
        heights: &[u64],
    ) -> Result<BTreeMap<u64, Result<FetchResult, IndexerError>>, IndexerError> {
        let source = &self.source;
        let fetches = futures::stream::iter(heights.iter().copied())
            .map(|h| async move { (h, source.fetch(h).await) })
            .buffer_unordered(self.config.worker_count.max(1))
            .collect::<BTreeMap<_, _>>();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IndexerError::Cancelled),
            results = fetches => Ok(results),
        }
    }

    /// Roll back above the common ancestor and reset the checkpoint there.
    async fn recover(
        &mut self,
        div: Divergence,
        committed: Vec<FetchResult>,
    ) -> Result<Cycle, IndexerError> {
        self.status.set_state(IngesterState::ReorgRecovery);
        let ancestor = div.common_ancestor;

        let cp = Checkpoint {
            service: self.config.service.clone(),
            mode: self.mode(),
            height: ancestor,
            updated_at: chrono::Utc::now().timestamp(),
        };
        let removed = self.committer.rollback_above(ancestor, Some(cp)).await?;
        self.window.truncate_above(ancestor);
        self.checkpoint.reset_to(ancestor).await?;
        self.status.set_last_committed(ancestor);

        tracing::warn!(
            detected_at = div.detected_at,
            common_ancestor = ancestor,
            depth = div.depth,
            removed,
            "rolled back divergent blocks"
        );

        // Blocks of this batch at or below the ancestor stay committed.
        let kept: Vec<FetchResult> = committed
            .into_iter()
            .filter(|b| b.height() <= ancestor)
            .collect();
        if !kept.is_empty() {
            self.acknowledge(&kept).await;
        }
        Ok(Cycle::Reorg(div))
    }

    /// Publish an acknowledged run of blocks to status and handlers.
    async fn acknowledge(&self, blocks: &[FetchResult]) {
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            return;
        };
        let (lo, hi) = (
            first.height().min(last.height()),
            first.height().max(last.height()),
        );
        self.status.set_last_committed(last.height());
        self.status.add_committed(blocks.len() as u64);

        tracing::info!(
            service = %self.config.service,
            mode = %self.mode(),
            from = lo,
            to = hi,
            blocks = blocks.len(),
            events = blocks.iter().map(FetchResult::event_count).sum::<usize>(),
            "batch committed"
        );

        if let Err(e) = self.handlers.dispatch_range(self.mode(), lo, hi + 1).await {
            tracing::warn!(from = lo, to = hi + 1, error = %e, "range handler failed");
        }

        if self.mode() == IngestMode::Forward && self.handlers.has_block_handlers() {
            for block in blocks {
                // Failures are logged per handler by the registry.
                let _ = self
                    .handlers
                    .dispatch_block(&CommittedBlock::from_fetch(block))
                    .await;
            }
        }
    }

    fn is_history_floor(&self, e: &IndexerError) -> bool {
        self.mode() == IngestMode::Backward && matches!(e, IndexerError::HistoryFloor { .. })
    }

    async fn pause(&self, ms: u64) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        }
    }
}
