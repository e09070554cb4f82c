//! SQLite storage backend for FlowIndex.
//!
//! Persists blocks, transactions, events and checkpoints to a single SQLite
//! file. Every block commit and every rollback runs in one SQL transaction.
//!
//! Writes go through a dedicated single-connection pool, so a forward and a
//! backward ingester sharing one store queue behind each other instead of
//! failing with `SQLITE_BUSY`. Reads use a separate pool and never block the
//! writer (WAL). A busy timeout covers other processes on the same file.
//!
//! # Usage
//! ```rust,no_run
//! use flowindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./flowindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction as SqlTx};
use tracing::debug;

use flowindex_core::checkpoint::{Checkpoint, CheckpointStore, IngestMode};
use flowindex_core::committer::{BlockCommitter, CommitOutcome};
use flowindex_core::error::IndexerError;
use flowindex_core::types::{BlockHeader, Event, EventType, FetchResult};

fn storage(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        height           INTEGER PRIMARY KEY,
        id               TEXT    NOT NULL,
        parent_id        TEXT    NOT NULL,
        timestamp        TEXT    NOT NULL,
        collection_count INTEGER NOT NULL,
        tx_count         INTEGER NOT NULL,
        event_count      INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS transactions (
        height           INTEGER NOT NULL,
        tx_index         INTEGER NOT NULL,
        id               TEXT    NOT NULL,
        collection_id    TEXT    NOT NULL,
        payer            TEXT    NOT NULL,
        proposer         TEXT    NOT NULL,
        authorizers      TEXT    NOT NULL,
        participants     TEXT    NOT NULL,
        script_hash      TEXT    NOT NULL,
        gas_limit        INTEGER NOT NULL,
        status           TEXT    NOT NULL,
        status_code      INTEGER NOT NULL,
        error_message    TEXT    NOT NULL,
        computation_used INTEGER NOT NULL,
        is_evm           INTEGER NOT NULL,
        PRIMARY KEY (height, tx_index)
    );",
    "CREATE TABLE IF NOT EXISTS events (
        height            INTEGER NOT NULL,
        transaction_id    TEXT    NOT NULL,
        transaction_index INTEGER NOT NULL,
        event_index       INTEGER NOT NULL,
        event_type        TEXT    NOT NULL,
        contract_address  TEXT    NOT NULL,
        contract_name     TEXT    NOT NULL,
        event_name        TEXT    NOT NULL,
        payload           BLOB    NOT NULL,
        PRIMARY KEY (height, transaction_id, event_index)
    );",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        service    TEXT    NOT NULL,
        mode       TEXT    NOT NULL,
        height     INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (service, mode)
    );",
    "CREATE INDEX IF NOT EXISTS idx_transactions_id ON transactions (id);",
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type);",
];

/// How long a connection waits for a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CONNECTIONS: u32 = 8;

/// SQLite-backed storage for blocks, transactions, events and checkpoints.
pub struct SqliteStorage {
    /// Read-only queries.
    pool: SqlitePool,
    /// Every write; capped at one connection.
    writer: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./flowindex.db"`) or a full
    /// SQLite URL (`"sqlite:./flowindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(storage)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(storage)?;
        let store = Self {
            pool: SqlitePoolOptions::new()
                .max_connections(READ_CONNECTIONS)
                .connect_with(options)
                .await
                .map_err(storage)?,
            writer,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Pinned to a single connection that is never recycled, since each
    /// connection to `:memory:` sees its own database. All data is lost when
    /// the store is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;
        let store = Self {
            writer: pool.clone(),
            pool,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.writer).await.map_err(storage)?;
        }
        Ok(())
    }

    // ─── Queries ─────────────────────────────────────────────────────────────────

    /// Header of the committed block at `height` (without guarantees).
    pub async fn block_header(&self, height: u64) -> Result<Option<BlockHeader>, IndexerError> {
        let row = sqlx::query("SELECT height, id, parent_id, timestamp FROM blocks WHERE height = ?")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(|r| BlockHeader {
            height: r.get::<i64, _>("height") as u64,
            id: r.get("id"),
            parent_id: r.get("parent_id"),
            timestamp: r.get::<DateTime<Utc>, _>("timestamp"),
            collection_guarantees: vec![],
        }))
    }

    pub async fn block_count(&self) -> Result<u64, IndexerError> {
        self.count("SELECT COUNT(*) AS cnt FROM blocks").await
    }

    pub async fn transaction_count(&self) -> Result<u64, IndexerError> {
        self.count("SELECT COUNT(*) AS cnt FROM transactions").await
    }

    pub async fn event_count(&self) -> Result<u64, IndexerError> {
        self.count("SELECT COUNT(*) AS cnt FROM events").await
    }

    async fn count(&self, sql: &str) -> Result<u64, IndexerError> {
        let row = sqlx::query(sql).fetch_one(&self.pool).await.map_err(storage)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    /// Events of one fully qualified type, ordered by height then position.
    pub async fn events_of_type(&self, event_type: &str) -> Result<Vec<Event>, IndexerError> {
        let rows = sqlx::query(
            "SELECT event_type, transaction_id, transaction_index, event_index, payload
             FROM events WHERE event_type = ?
             ORDER BY height, transaction_index, event_index",
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows
            .into_iter()
            .map(|r| Event {
                event_type: r.get("event_type"),
                transaction_id: r.get("transaction_id"),
                transaction_index: r.get::<i64, _>("transaction_index") as u32,
                event_index: r.get::<i64, _>("event_index") as u32,
                payload: r.get("payload"),
            })
            .collect())
    }

    // ─── Writes ──────────────────────────────────────────────────────────────────

    async fn insert_block(tx: &mut SqlTx<'_, Sqlite>, block: &FetchResult) -> Result<(), IndexerError> {
        let header = &block.header;
        sqlx::query(
            "INSERT INTO blocks (height, id, parent_id, timestamp, collection_count, tx_count, event_count)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(header.height as i64)
        .bind(&header.id)
        .bind(&header.parent_id)
        .bind(header.timestamp)
        .bind(header.collection_guarantees.len() as i64)
        .bind(block.transactions.len() as i64)
        .bind(block.event_count() as i64)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;

        for t in &block.transactions {
            let authorizers = serde_json::to_string(&t.transaction.authorizers)
                .map_err(|e| IndexerError::Storage(e.to_string()))?;
            let participants = serde_json::to_string(&t.participants)
                .map_err(|e| IndexerError::Storage(e.to_string()))?;
            sqlx::query(
                "INSERT OR IGNORE INTO transactions
                 (height, tx_index, id, collection_id, payer, proposer, authorizers, participants,
                  script_hash, gas_limit, status, status_code, error_message, computation_used, is_evm)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(header.height as i64)
            .bind(t.index as i64)
            .bind(&t.transaction.id)
            .bind(&t.collection_id)
            .bind(&t.transaction.payer)
            .bind(&t.transaction.proposal_key.address)
            .bind(authorizers)
            .bind(participants)
            .bind(&t.script_hash)
            .bind(t.transaction.gas_limit as i64)
            .bind(t.result.status.to_string())
            .bind(t.result.status_code as i64)
            .bind(&t.result.error_message)
            .bind(t.result.computation_used as i64)
            .bind(t.is_evm)
            .execute(&mut **tx)
            .await
            .map_err(storage)?;

            for e in &t.result.events {
                let ty = EventType::parse(&e.event_type);
                sqlx::query(
                    "INSERT OR IGNORE INTO events
                     (height, transaction_id, transaction_index, event_index, event_type,
                      contract_address, contract_name, event_name, payload)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(header.height as i64)
                .bind(&e.transaction_id)
                .bind(e.transaction_index as i64)
                .bind(e.event_index as i64)
                .bind(&e.event_type)
                .bind(ty.address)
                .bind(ty.contract)
                .bind(ty.name)
                .bind(&e.payload)
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
            }
        }
        Ok(())
    }

    async fn delete_from(tx: &mut SqlTx<'_, Sqlite>, op: &str, height: u64) -> Result<u64, IndexerError> {
        let mut removed = 0;
        for table in ["events", "transactions", "blocks"] {
            let res = sqlx::query(&format!("DELETE FROM {table} WHERE height {op} ?"))
                .bind(height as i64)
                .execute(&mut **tx)
                .await
                .map_err(storage)?;
            if table == "blocks" {
                removed = res.rows_affected();
            }
        }
        Ok(removed)
    }

    async fn upsert_checkpoint(tx: &mut SqlTx<'_, Sqlite>, cp: &Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO checkpoints (service, mode, height, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (service, mode) DO UPDATE SET height = excluded.height, updated_at = excluded.updated_at",
        )
        .bind(&cp.service)
        .bind(cp.mode.as_str())
        .bind(cp.height as i64)
        .bind(cp.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;
        Ok(())
    }
}

// ─── BlockCommitter impl ─────────────────────────────────────────────────────

#[async_trait]
impl BlockCommitter for SqliteStorage {
    async fn commit(&self, block: &FetchResult) -> Result<CommitOutcome, IndexerError> {
        let mut tx = self.writer.begin().await.map_err(storage)?;

        let existing: Option<String> = sqlx::query("SELECT id FROM blocks WHERE height = ?")
            .bind(block.height() as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .map(|r| r.get("id"));

        let outcome = match existing {
            Some(id) if id == block.id() => {
                tx.rollback().await.map_err(storage)?;
                return Ok(CommitOutcome::AlreadyPresent);
            }
            Some(_) => {
                Self::delete_from(&mut tx, "=", block.height()).await?;
                CommitOutcome::Replaced
            }
            None => CommitOutcome::Inserted,
        };

        Self::insert_block(&mut tx, block).await?;
        tx.commit().await.map_err(storage)?;

        debug!(height = block.height(), id = %block.id(), ?outcome, "block committed");
        Ok(outcome)
    }

    async fn block_id_at(&self, height: u64) -> Result<Option<String>, IndexerError> {
        let row = sqlx::query("SELECT id FROM blocks WHERE height = ?")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(|r| r.get::<String, _>("id")))
    }

    async fn rollback_above(
        &self,
        height: u64,
        checkpoint: Option<Checkpoint>,
    ) -> Result<u64, IndexerError> {
        let mut tx = self.writer.begin().await.map_err(storage)?;
        let removed = Self::delete_from(&mut tx, ">", height).await?;
        if let Some(cp) = &checkpoint {
            Self::upsert_checkpoint(&mut tx, cp).await?;
        }
        tx.commit().await.map_err(storage)?;

        debug!(height, removed, "rolled back storage");
        Ok(removed)
    }

    async fn highest_height(&self) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query("SELECT MAX(height) AS h FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.get::<Option<i64>, _>("h").map(|h| h as u64))
    }

    async fn lowest_height(&self) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query("SELECT MIN(height) AS h FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.get::<Option<i64>, _>("h").map(|h| h as u64))
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(
        &self,
        service: &str,
        mode: IngestMode,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT service, height, updated_at FROM checkpoints WHERE service = ? AND mode = ?",
        )
        .bind(service)
        .bind(mode.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        Ok(row.map(|r| Checkpoint {
            service: r.get("service"),
            mode,
            height: r.get::<i64, _>("height") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        let mut tx = self.writer.begin().await.map_err(storage)?;
        Self::upsert_checkpoint(&mut tx, &checkpoint).await?;
        tx.commit().await.map_err(storage)?;

        debug!(
            service = %checkpoint.service,
            mode = %checkpoint.mode,
            height = checkpoint.height,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, service: &str, mode: IngestMode) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE service = ? AND mode = ?")
            .bind(service)
            .bind(mode.as_str())
            .execute(&self.writer)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use flowindex_core::types::{IndexedTransaction, ProposalKey, Transaction, TransactionResult};

    fn block(h: u64, fork: &str) -> FetchResult {
        let tx = Transaction {
            id: format!("{fork}tx{h}"),
            script: "import EVM from 0xe467b9dd11fa00df".into(),
            arguments: vec![],
            reference_block_id: String::new(),
            gas_limit: 9999,
            proposal_key: ProposalKey {
                address: "e467b9dd11fa00df".into(),
                key_index: 0,
                sequence_number: 1,
            },
            payer: "f919ee77447b7497".into(),
            authorizers: vec!["e467b9dd11fa00df".into()],
        };
        let mut result = TransactionResult::empty_sealed();
        result.events = (0..2)
            .map(|i| Event {
                event_type: "A.e467b9dd11fa00df.EVM.TransactionExecuted".into(),
                transaction_id: tx.id.clone(),
                transaction_index: 0,
                event_index: i,
                payload: vec![1, 2, 3],
            })
            .collect();
        FetchResult {
            header: BlockHeader {
                height: h,
                id: format!("{fork}{h}"),
                parent_id: format!("{fork}{}", h - 1),
                timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + h as i64, 0).unwrap(),
                collection_guarantees: vec![],
            },
            transactions: vec![IndexedTransaction {
                index: 0,
                collection_id: "c0".into(),
                participants: tx.participants(),
                transaction: tx,
                result,
                is_evm: true,
                script_hash: "ab".repeat(32),
            }],
            warnings: vec![],
        }
    }

    fn checkpoint(height: u64) -> Checkpoint {
        Checkpoint {
            service: "main_ingester".into(),
            mode: IngestMode::Forward,
            height,
            updated_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn commit_writes_all_tables() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert_eq!(store.commit(&block(100, "a")).await.unwrap(), CommitOutcome::Inserted);

        assert_eq!(store.block_count().await.unwrap(), 1);
        assert_eq!(store.transaction_count().await.unwrap(), 1);
        assert_eq!(store.event_count().await.unwrap(), 2);

        let header = store.block_header(100).await.unwrap().unwrap();
        assert_eq!(header.parent_id, "a99");
        assert_eq!(header.timestamp.timestamp(), 1_700_000_100);

        let events = store
            .events_of_type("A.e467b9dd11fa00df.EVM.TransactionExecuted")
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_index, 1);
        assert_eq!(events[0].payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn recommit_is_noop() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.commit(&block(7, "a")).await.unwrap();
        assert_eq!(store.commit(&block(7, "a")).await.unwrap(), CommitOutcome::AlreadyPresent);
        assert_eq!(store.event_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fork_block_replaces_rows() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.commit(&block(7, "a")).await.unwrap();
        assert_eq!(store.commit(&block(7, "b")).await.unwrap(), CommitOutcome::Replaced);
        assert_eq!(store.block_id_at(7).await.unwrap().as_deref(), Some("b7"));
        assert_eq!(store.transaction_count().await.unwrap(), 1);
        assert_eq!(store.event_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rollback_with_checkpoint() {
        let store = SqliteStorage::in_memory().await.unwrap();
        for h in 45..=50 {
            store.commit(&block(h, "a")).await.unwrap();
        }
        store.save(checkpoint(50)).await.unwrap();

        let removed = store.rollback_above(48, Some(checkpoint(48))).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.highest_height().await.unwrap(), Some(48));
        assert_eq!(store.lowest_height().await.unwrap(), Some(45));
        assert_eq!(store.event_count().await.unwrap(), 8);
        let cp = store.load("main_ingester", IngestMode::Forward).await.unwrap().unwrap();
        assert_eq!(cp.height, 48);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowindex.db");
        let store = std::sync::Arc::new(SqliteStorage::open(path.to_str().unwrap()).await.unwrap());

        let forward = {
            let store = store.clone();
            tokio::spawn(async move {
                for h in 1_001..=1_300 {
                    store.commit(&block(h, "a")).await?;
                    store.save(checkpoint(h)).await?;
                }
                Ok::<_, IndexerError>(())
            })
        };
        let backward = {
            let store = store.clone();
            tokio::spawn(async move {
                for h in (701..=1_000).rev() {
                    store.commit(&block(h, "a")).await?;
                    store
                        .save(Checkpoint {
                            mode: IngestMode::Backward,
                            ..checkpoint(h)
                        })
                        .await?;
                    // Readers run alongside the writers.
                    store.lowest_height().await?;
                }
                Ok::<_, IndexerError>(())
            })
        };
        forward.await.unwrap().unwrap();
        backward.await.unwrap().unwrap();

        assert_eq!(store.block_count().await.unwrap(), 600);
        assert_eq!(store.event_count().await.unwrap(), 1_200);
        assert_eq!(store.lowest_height().await.unwrap(), Some(701));
        assert_eq!(store.highest_height().await.unwrap(), Some(1_300));
        assert_eq!(store.load("main_ingester", IngestMode::Forward).await.unwrap().unwrap().height, 1_300);
        assert_eq!(store.load("main_ingester", IngestMode::Backward).await.unwrap().unwrap().height, 701);
    }

    #[tokio::test]
    async fn reopened_file_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowindex.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteStorage::open(path).await.unwrap();
            store.commit(&block(5, "a")).await.unwrap();
            store.save(checkpoint(5)).await.unwrap();
        }
        let store = SqliteStorage::open(path).await.unwrap();
        assert_eq!(store.block_id_at(5).await.unwrap().as_deref(), Some("a5"));
        assert_eq!(store.load("main_ingester", IngestMode::Forward).await.unwrap().unwrap().height, 5);
    }

    #[tokio::test]
    async fn empty_store_heights() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert_eq!(store.highest_height().await.unwrap(), None);
        assert_eq!(store.lowest_height().await.unwrap(), None);
        assert!(store.block_id_at(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_modes_isolated() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.save(checkpoint(10)).await.unwrap();
        store
            .save(Checkpoint {
                mode: IngestMode::Backward,
                height: 3,
                ..checkpoint(0)
            })
            .await
            .unwrap();
        assert_eq!(store.load("main_ingester", IngestMode::Forward).await.unwrap().unwrap().height, 10);
        assert_eq!(store.load("main_ingester", IngestMode::Backward).await.unwrap().unwrap().height, 3);

        store.delete("main_ingester", IngestMode::Forward).await.unwrap();
        assert!(store.load("main_ingester", IngestMode::Forward).await.unwrap().is_none());
        assert!(store.load("main_ingester", IngestMode::Backward).await.unwrap().is_some());
    }
}
