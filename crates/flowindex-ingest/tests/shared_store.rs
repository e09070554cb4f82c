//! A forward and a backward ingester running side by side over one access
//! client and one SQLite store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use flowindex_access::{AccessClientConfig, AccessError, AccessNodeClient, AccessTransport, RpcCode};
use flowindex_core::checkpoint::{Checkpoint, CheckpointStore, IngestMode};
use flowindex_core::committer::{BlockCommitter, CommitOutcome};
use flowindex_core::error::IndexerError;
use flowindex_core::types::{
    Account, BlockHeader, Collection, CollectionGuarantee, Event, FetchResult, ProposalKey, Transaction,
    TransactionResult,
};
use flowindex_ingest::{BlockSource, Cycle, FetchWorker, IngesterBuilder, IngesterService};
use flowindex_storage::SqliteStorage;

const HEAD: u64 = 300;

fn block_id(h: u64) -> String {
    format!("{h:064x}")
}

/// A linear chain up to `HEAD`: one collection and one transaction per block.
struct LinearChain;

#[async_trait]
impl AccessTransport for LinearChain {
    fn address(&self) -> &str {
        "localhost:8888"
    }

    async fn latest_sealed_height(&self) -> Result<u64, AccessError> {
        Ok(HEAD)
    }

    async fn block_by_height(&self, height: u64) -> Result<BlockHeader, AccessError> {
        if height > HEAD {
            return Err(AccessError::rpc(RpcCode::NotFound, format!("block {height} not sealed")));
        }
        Ok(BlockHeader {
            height,
            id: block_id(height),
            parent_id: block_id(height.saturating_sub(1)),
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + height as i64, 0).unwrap(),
            collection_guarantees: vec![CollectionGuarantee {
                collection_id: format!("c{height}"),
            }],
        })
    }

    async fn collection(&self, id: &str) -> Result<Collection, AccessError> {
        Ok(Collection {
            id: id.into(),
            transaction_ids: vec![format!("t{}", &id[1..])],
        })
    }

    async fn transaction(&self, id: &str) -> Result<Transaction, AccessError> {
        Ok(Transaction {
            id: id.into(),
            script: "transaction { execute {} }".into(),
            arguments: vec![],
            reference_block_id: String::new(),
            gas_limit: 9999,
            proposal_key: ProposalKey {
                address: "1654653399040a61".into(),
                key_index: 0,
                sequence_number: 0,
            },
            payer: "1654653399040a61".into(),
            authorizers: vec!["1654653399040a61".into()],
        })
    }

    async fn transaction_result(&self, id: &str) -> Result<TransactionResult, AccessError> {
        let mut result = TransactionResult::empty_sealed();
        result.events.push(Event {
            event_type: "A.1654653399040a61.FlowToken.TokensWithdrawn".into(),
            transaction_id: id.into(),
            transaction_index: 0,
            event_index: 0,
            payload: vec![7],
        });
        Ok(result)
    }

    async fn account(&self, _address: &str) -> Result<Account, AccessError> {
        Err(AccessError::rpc(RpcCode::NotFound, "account not found"))
    }
}

/// Delegates to the store and records every commit.
struct Counting {
    store: Arc<SqliteStorage>,
    commits: Mutex<Vec<(u64, CommitOutcome)>>,
}

#[async_trait]
impl BlockCommitter for Counting {
    async fn commit(&self, block: &FetchResult) -> Result<CommitOutcome, IndexerError> {
        let outcome = self.store.commit(block).await?;
        self.commits.lock().unwrap().push((block.height(), outcome));
        Ok(outcome)
    }
    async fn block_id_at(&self, height: u64) -> Result<Option<String>, IndexerError> {
        self.store.block_id_at(height).await
    }
    async fn rollback_above(&self, height: u64, cp: Option<Checkpoint>) -> Result<u64, IndexerError> {
        self.store.rollback_above(height, cp).await
    }
    async fn highest_height(&self) -> Result<Option<u64>, IndexerError> {
        self.store.highest_height().await
    }
    async fn lowest_height(&self) -> Result<Option<u64>, IndexerError> {
        self.store.lowest_height().await
    }
}

/// Tick until the service has nothing left to do.
async fn drain(mut service: IngesterService, done: Cycle) -> IngesterService {
    for _ in 0..100 {
        if service.tick().await.unwrap() == done {
            return service;
        }
        tokio::task::yield_now().await;
    }
    panic!("{} did not reach {done:?}", service.config().service);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forward_and_backward_share_client_and_store() {
    let config = AccessClientConfig {
        rate_limit: None,
        spork_overrides: HashMap::new(),
        ..Default::default()
    };
    let transport: Arc<dyn AccessTransport> = Arc::new(LinearChain);
    let client = AccessNodeClient::new(vec![transport], config, CancellationToken::new()).unwrap();
    let source: Arc<dyn BlockSource> = Arc::new(FetchWorker::new(Arc::new(client)));

    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let committer = Arc::new(Counting {
        store: storage.clone(),
        commits: Mutex::new(Vec::new()),
    });

    let forward = IngesterBuilder::forward()
        .start_height(150)
        .batch_size(20)
        .worker_count(4)
        .adaptive_batch(false)
        .build(source.clone(), committer.clone(), storage.clone());
    let backward = IngesterBuilder::backward()
        .start_height(149)
        .stop_height(1)
        .batch_size(20)
        .worker_count(4)
        .build(source.clone(), committer.clone(), storage.clone());

    let forward = tokio::spawn(drain(forward, Cycle::CaughtUp));
    let backward = tokio::spawn(drain(backward, Cycle::Finished));
    let forward = forward.await.unwrap();
    let backward = backward.await.unwrap();

    assert_eq!(forward.checkpoint(), Some(HEAD));
    assert_eq!(backward.checkpoint(), Some(1));
    let saved = storage.load("main_ingester", IngestMode::Forward).await.unwrap();
    assert_eq!(saved.map(|c| c.height), Some(HEAD));
    let saved = storage.load("history_ingester", IngestMode::Backward).await.unwrap();
    assert_eq!(saved.map(|c| c.height), Some(1));

    // Every height committed exactly once, with nothing replaced.
    let commits = committer.commits.lock().unwrap().clone();
    let mut heights: Vec<u64> = commits.iter().map(|(h, _)| *h).collect();
    heights.sort_unstable();
    assert_eq!(heights, (1..=HEAD).collect::<Vec<_>>());
    assert!(commits.iter().all(|(_, o)| *o == CommitOutcome::Inserted));

    assert_eq!(storage.block_count().await.unwrap(), HEAD);
    assert_eq!(storage.event_count().await.unwrap(), HEAD);
    assert_eq!(storage.lowest_height().await.unwrap(), Some(1));
    assert_eq!(storage.highest_height().await.unwrap(), Some(HEAD));
}
