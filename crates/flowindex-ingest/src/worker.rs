//! Fetch workers: turn a height into a self-contained [`FetchResult`].
//!
//! A worker owns no mutable state: it resolves the block's collections,
//! fetches every transaction and its result through the shared
//! [`AccessNodeClient`], and derives the per-transaction signals (EVM usage,
//! script hash, participants). It never writes to storage and never retries
//! beyond what the client already does.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};

use flowindex_access::{AccessError, AccessNodeClient, RpcCode};
use flowindex_core::error::IndexerError;
use flowindex_core::reorg::HeaderSource;
use flowindex_core::types::{
    BlockHeader, EventType, FetchResult, FetchWarning, IndexedTransaction, Transaction, TransactionResult,
};

/// Script marker of transactions that use the EVM environment.
const EVM_IMPORT: &str = "import EVM";

/// Where the ingester gets blocks from.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn latest_sealed_height(&self) -> Result<u64, IndexerError>;

    /// Header only; used to walk back the canonical chain during reorg checks.
    async fn header(&self, height: u64) -> Result<BlockHeader, IndexerError>;

    /// The full block at `height`.
    async fn fetch(&self, height: u64) -> Result<FetchResult, IndexerError>;

    /// Lowest height any configured node can serve, if known.
    fn history_floor(&self) -> Option<u64> {
        None
    }
}

/// Lets a block source answer reorg walk-backs.
pub(crate) struct Canonical<'a>(pub &'a dyn BlockSource);

#[async_trait]
impl HeaderSource for Canonical<'_> {
    async fn header(&self, height: u64) -> Result<BlockHeader, IndexerError> {
        self.0.header(height).await
    }
}

/// [`BlockSource`] backed by the multi-node access client.
#[derive(Clone)]
pub struct FetchWorker {
    client: Arc<AccessNodeClient>,
    tx_concurrency: usize,
}

impl FetchWorker {
    pub fn new(client: Arc<AccessNodeClient>) -> Self {
        Self {
            client,
            tx_concurrency: 8,
        }
    }

    /// Transactions fetched concurrently within one block.
    pub fn with_tx_concurrency(mut self, n: usize) -> Self {
        self.tx_concurrency = n.max(1);
        self
    }

    pub fn client(&self) -> &Arc<AccessNodeClient> {
        &self.client
    }

    async fn fetch_transaction(
        &self,
        height: u64,
        index: u32,
        collection_id: String,
        tx_id: String,
    ) -> Result<(IndexedTransaction, Option<FetchWarning>), IndexerError> {
        let (tx, result) = futures::join!(
            self.client.transaction(height, &tx_id),
            self.client.transaction_result(height, &tx_id),
        );
        let transaction = tx.map_err(|e| e.into_indexer_error(height))?;

        let (result, warning) = match result {
            Ok(r) => (r, None),
            Err(e) if result_unavailable(&e) => {
                tracing::warn!(height, tx = %tx_id, error = %e, "transaction result unavailable, storing empty sealed result");
                let warning = FetchWarning {
                    transaction_id: tx_id.clone(),
                    transaction_index: index,
                    message: e.to_string(),
                };
                (TransactionResult::empty_sealed(), Some(warning))
            }
            Err(e) => return Err(e.into_indexer_error(height)),
        };

        Ok((index_transaction(index, collection_id, transaction, result), warning))
    }
}

/// Derive the per-transaction signals and wrap the pair.
pub fn index_transaction(
    index: u32,
    collection_id: String,
    transaction: Transaction,
    result: TransactionResult,
) -> IndexedTransaction {
    IndexedTransaction {
        index,
        collection_id,
        is_evm: is_evm(&transaction, &result),
        script_hash: script_hash(&transaction.script),
        participants: transaction.participants(),
        transaction,
        result,
    }
}

/// Hex SHA-256 of a script's text.
pub fn script_hash(script: &str) -> String {
    hex::encode(Sha256::digest(script.as_bytes()))
}

/// A transaction touches EVM if its script imports the contract or it
/// emitted an `EVM.TransactionExecuted` event.
pub fn is_evm(tx: &Transaction, result: &TransactionResult) -> bool {
    tx.script.contains(EVM_IMPORT)
        || result.events.iter().any(|e| {
            let ty = EventType::parse(&e.event_type);
            ty.contract == "EVM" && ty.name == "TransactionExecuted"
        })
}

/// Answers from nodes that pruned a result, never had it, or could not
/// replay it on an execution node.
const RESULT_UNAVAILABLE: &[&str] = &[
    "key not found",
    "could not retrieve",
    "failed to execute the script on the execution node",
    "failed to retrieve result from execution node",
    "upstream request timeout",
    "cadence runtime error",
    "ccf: failed to decode",
];

fn result_unavailable(e: &AccessError) -> bool {
    if e.code() == Some(RpcCode::NotFound) {
        return true;
    }
    let msg = e.to_string().to_ascii_lowercase();
    RESULT_UNAVAILABLE.iter().any(|pattern| msg.contains(pattern))
}

#[async_trait]
impl BlockSource for FetchWorker {
    async fn latest_sealed_height(&self) -> Result<u64, IndexerError> {
        self.client
            .latest_sealed_height()
            .await
            .map_err(|e| match e {
                AccessError::Cancelled => IndexerError::Cancelled,
                other => IndexerError::Other(format!("latest sealed height: {other}")),
            })
    }

    async fn header(&self, height: u64) -> Result<BlockHeader, IndexerError> {
        self.client
            .block_header(height)
            .await
            .map_err(|e| e.into_indexer_error(height))
    }

    async fn fetch(&self, height: u64) -> Result<FetchResult, IndexerError> {
        let (header, collections) = self
            .client
            .block_by_height(height)
            .await
            .map_err(|e| e.into_indexer_error(height))?;

        let entries: Vec<(u32, String, String)> = collections
            .into_iter()
            .flat_map(|c| {
                let cid = c.id;
                c.transaction_ids.into_iter().map(move |t| (cid.clone(), t))
            })
            .enumerate()
            .map(|(i, (cid, tid))| (i as u32, cid, tid))
            .collect();

        let fetched: Vec<(IndexedTransaction, Option<FetchWarning>)> = futures::stream::iter(entries)
            .map(|(index, cid, tid)| self.fetch_transaction(height, index, cid, tid))
            .buffered(self.tx_concurrency)
            .try_collect()
            .await?;

        let mut transactions = Vec::with_capacity(fetched.len());
        let mut warnings = Vec::new();
        for (tx, warning) in fetched {
            transactions.push(tx);
            warnings.extend(warning);
        }

        tracing::debug!(
            height,
            transactions = transactions.len(),
            warnings = warnings.len(),
            "block fetched"
        );
        Ok(FetchResult {
            header,
            transactions,
            warnings,
        })
    }

    fn history_floor(&self) -> Option<u64> {
        self.client.endpoints().lowest_floor()
    }
}
