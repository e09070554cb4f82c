//! `flowindex run`: forward and backward ingesters over one shared client.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use flowindex_access::AccessNodeClient;
use flowindex_core::checkpoint::IngestMode;
use flowindex_core::error::IndexerError;
use flowindex_core::handler::{ChannelBroadcaster, CommittedBlock, RangeHandler};
use flowindex_ingest::{BlockSource, FetchWorker, IngesterService, StatusSnapshot};
use flowindex_storage::SqliteStorage;

use crate::config::FileConfig;

const BROADCAST_CAPACITY: usize = 1024;

/// Logs every committed range.
struct RangeLog;

#[async_trait]
impl RangeHandler for RangeLog {
    async fn on_range(&self, mode: IngestMode, from: u64, to: u64) -> Result<(), IndexerError> {
        tracing::debug!(%mode, from, to, "range indexed");
        Ok(())
    }
}

pub async fn run(config: FileConfig) -> Result<()> {
    if !config.forward_enabled() && !config.backward_enabled() {
        anyhow::bail!("both ingesters are disabled");
    }

    let cancel = CancellationToken::new();
    let storage = Arc::new(
        SqliteStorage::open(config.database())
            .await
            .with_context(|| format!("opening database {}", config.database()))?,
    );
    let client = Arc::new(
        AccessNodeClient::connect(config.access.pool(), config.access.client_config(), cancel.clone())
            .context("building access client")?,
    );
    let mut worker = FetchWorker::new(client);
    if let Some(n) = config.access.tx_concurrency {
        worker = worker.with_tx_concurrency(n);
    }
    let source: Arc<dyn BlockSource> = Arc::new(worker);

    let broadcaster = ChannelBroadcaster::new(BROADCAST_CAPACITY);
    tokio::spawn(follow(broadcaster.subscribe(), cancel.clone()));

    let mut services = Vec::new();
    if config.forward_enabled() {
        services.push(
            config
                .forward_builder()
                .on_block(Arc::new(broadcaster))
                .on_range(Arc::new(RangeLog))
                .cancel_token(cancel.clone())
                .build(source.clone(), storage.clone(), storage.clone()),
        );
    }
    if config.backward_enabled() {
        services.push(
            config
                .backward_builder()
                .on_range(Arc::new(RangeLog))
                .cancel_token(cancel.clone())
                .build(source.clone(), storage.clone(), storage.clone()),
        );
    }

    let mut tasks = JoinSet::new();
    for service in services {
        tasks.spawn(drive(service));
    }

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        interrupt.cancel();
    });

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let (snapshot, result) = joined.context("ingester task panicked")?;
        match result {
            Ok(()) => tracing::info!(
                service = %snapshot.service,
                state = %snapshot.state,
                last_committed = ?snapshot.last_committed,
                blocks = snapshot.committed_blocks,
                "ingester exited"
            ),
            Err(e) => {
                // A fatal error in one ingester stops the other.
                cancel.cancel();
                failure.get_or_insert(anyhow::Error::new(e).context(format!("ingester {}", snapshot.service)));
            }
        }
    }
    cancel.cancel();
    failure.map_or(Ok(()), Err)
}

async fn drive(mut service: IngesterService) -> (StatusSnapshot, Result<(), IndexerError>) {
    let result = service.run().await;
    (service.status().snapshot(), result)
}

/// Debug-logs committed blocks as an in-process subscriber would see them.
async fn follow(
    mut rx: tokio::sync::broadcast::Receiver<Arc<CommittedBlock>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = rx.recv() => next,
        };
        match next {
            Ok(block) => tracing::debug!(
                height = block.header.height,
                id = %block.header.id,
                transactions = block.transactions.len(),
                "new block"
            ),
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "block subscriber lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}
