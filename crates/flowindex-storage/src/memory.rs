//! In-memory storage backend.
//!
//! Keeps committed blocks and checkpoints in RAM behind a single lock, so a
//! commit or a rollback plus checkpoint reset is observed all at once.
//! Useful for testing and short-lived indexers that don't need persistence.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use flowindex_core::checkpoint::{Checkpoint, CheckpointStore, IngestMode};
use flowindex_core::committer::{BlockCommitter, CommitOutcome};
use flowindex_core::error::IndexerError;
use flowindex_core::types::{Event, FetchResult, IndexedTransaction};

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<u64, FetchResult>,
    checkpoints: HashMap<(String, IngestMode), Checkpoint>,
}

/// In-memory block and checkpoint storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The committed block at `height`.
    pub fn block(&self, height: u64) -> Option<FetchResult> {
        self.lock().blocks.get(&height).cloned()
    }

    /// Committed heights in ascending order.
    pub fn heights(&self) -> Vec<u64> {
        self.lock().blocks.keys().copied().collect()
    }

    pub fn block_count(&self) -> usize {
        self.lock().blocks.len()
    }

    /// Total number of committed transactions.
    pub fn transaction_count(&self) -> usize {
        self.lock().blocks.values().map(|b| b.transactions.len()).sum()
    }

    /// Total number of committed events.
    pub fn event_count(&self) -> usize {
        self.lock().blocks.values().map(FetchResult::event_count).sum()
    }

    /// Events of one fully qualified type (e.g. `A.1654653399040a61.FlowToken.TokensDeposited`),
    /// in height then event order.
    pub fn events_of_type(&self, event_type: &str) -> Vec<Event> {
        self.lock()
            .blocks
            .values()
            .flat_map(|b| b.transactions.iter())
            .flat_map(|t| t.result.events.iter())
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Transactions in which `address` took part as payer, proposer or authorizer.
    pub fn transactions_of(&self, address: &str) -> Vec<IndexedTransaction> {
        self.lock()
            .blocks
            .values()
            .flat_map(|b| b.transactions.iter())
            .filter(|t| t.participants.iter().any(|p| p == address))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BlockCommitter for InMemoryStorage {
    async fn commit(&self, block: &FetchResult) -> Result<CommitOutcome, IndexerError> {
        let mut inner = self.lock();
        let outcome = match inner.blocks.get(&block.height()) {
            Some(existing) if existing.id() == block.id() => return Ok(CommitOutcome::AlreadyPresent),
            Some(_) => CommitOutcome::Replaced,
            None => CommitOutcome::Inserted,
        };
        inner.blocks.insert(block.height(), block.clone());
        tracing::debug!(height = block.height(), id = %block.id(), ?outcome, "block committed");
        Ok(outcome)
    }

    async fn block_id_at(&self, height: u64) -> Result<Option<String>, IndexerError> {
        Ok(self.lock().blocks.get(&height).map(|b| b.id().to_string()))
    }

    async fn rollback_above(
        &self,
        height: u64,
        checkpoint: Option<Checkpoint>,
    ) -> Result<u64, IndexerError> {
        let mut inner = self.lock();
        let removed = match height.checked_add(1) {
            Some(from) => inner.blocks.split_off(&from).len() as u64,
            None => 0,
        };
        if let Some(cp) = checkpoint {
            inner.checkpoints.insert((cp.service.clone(), cp.mode), cp);
        }
        tracing::debug!(height, removed, "rolled back storage");
        Ok(removed)
    }

    async fn highest_height(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.lock().blocks.keys().next_back().copied())
    }

    async fn lowest_height(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.lock().blocks.keys().next().copied())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(
        &self,
        service: &str,
        mode: IngestMode,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.lock().checkpoints.get(&(service.to_string(), mode)).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        self.lock()
            .checkpoints
            .insert((checkpoint.service.clone(), checkpoint.mode), checkpoint);
        Ok(())
    }

    async fn delete(&self, service: &str, mode: IngestMode) -> Result<(), IndexerError> {
        self.lock().checkpoints.remove(&(service.to_string(), mode));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use flowindex_core::types::{BlockHeader, ProposalKey, Transaction, TransactionResult};

    fn block(h: u64, fork: &str) -> FetchResult {
        let tx = Transaction {
            id: format!("tx{h}"),
            script: "transaction {}".into(),
            arguments: vec![],
            reference_block_id: String::new(),
            gas_limit: 100,
            proposal_key: ProposalKey {
                address: "e467b9dd11fa00df".into(),
                key_index: 0,
                sequence_number: h,
            },
            payer: "f919ee77447b7497".into(),
            authorizers: vec!["e467b9dd11fa00df".into()],
        };
        let mut result = TransactionResult::empty_sealed();
        result.events.push(Event {
            event_type: "A.1654653399040a61.FlowToken.TokensDeposited".into(),
            transaction_id: tx.id.clone(),
            transaction_index: 0,
            event_index: 0,
            payload: vec![],
        });
        FetchResult {
            header: BlockHeader {
                height: h,
                id: format!("{fork}{h}"),
                parent_id: format!("{fork}{}", h - 1),
                timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
                collection_guarantees: vec![],
            },
            transactions: vec![IndexedTransaction {
                index: 0,
                collection_id: "c".into(),
                participants: tx.participants(),
                transaction: tx,
                result,
                is_evm: false,
                script_hash: String::new(),
            }],
            warnings: vec![],
        }
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let store = InMemoryStorage::new();
        assert_eq!(store.commit(&block(10, "a")).await.unwrap(), CommitOutcome::Inserted);
        assert_eq!(store.commit(&block(10, "a")).await.unwrap(), CommitOutcome::AlreadyPresent);
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn different_block_replaces() {
        let store = InMemoryStorage::new();
        store.commit(&block(10, "a")).await.unwrap();
        assert_eq!(store.commit(&block(10, "b")).await.unwrap(), CommitOutcome::Replaced);
        assert_eq!(store.block_id_at(10).await.unwrap().as_deref(), Some("b10"));
    }

    #[tokio::test]
    async fn rollback_clears_above_and_resets_checkpoint() {
        let store = InMemoryStorage::new();
        for h in 45..=50 {
            store.commit(&block(h, "a")).await.unwrap();
        }
        let cp = Checkpoint {
            service: "main_ingester".into(),
            mode: IngestMode::Forward,
            height: 48,
            updated_at: 0,
        };
        let removed = store.rollback_above(48, Some(cp)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.heights(), vec![45, 46, 47, 48]);
        assert_eq!(store.highest_height().await.unwrap(), Some(48));
        assert_eq!(store.lowest_height().await.unwrap(), Some(45));
        let loaded = store.load("main_ingester", IngestMode::Forward).await.unwrap().unwrap();
        assert_eq!(loaded.height, 48);
    }

    #[tokio::test]
    async fn queries() {
        let store = InMemoryStorage::new();
        store.commit(&block(1, "a")).await.unwrap();
        store.commit(&block(2, "a")).await.unwrap();
        assert_eq!(store.transaction_count(), 2);
        assert_eq!(store.events_of_type("A.1654653399040a61.FlowToken.TokensDeposited").len(), 2);
        assert_eq!(store.transactions_of("f919ee77447b7497").len(), 2);
        assert!(store.transactions_of("0000000000000001").is_empty());
    }

    #[tokio::test]
    async fn checkpoints_keyed_by_service_and_mode() {
        let store = InMemoryStorage::new();
        for (mode, height) in [(IngestMode::Forward, 100), (IngestMode::Backward, 40)] {
            store
                .save(Checkpoint {
                    service: "svc".into(),
                    mode,
                    height,
                    updated_at: 0,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.load("svc", IngestMode::Forward).await.unwrap().unwrap().height, 100);
        assert_eq!(store.load("svc", IngestMode::Backward).await.unwrap().unwrap().height, 40);
        store.delete("svc", IngestMode::Forward).await.unwrap();
        assert!(store.load("svc", IngestMode::Forward).await.unwrap().is_none());
    }
}
