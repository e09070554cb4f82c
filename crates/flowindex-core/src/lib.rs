//! flowindex-core: foundation for the reorg-aware Flow ingestion engine.
//!
//! # Architecture
//!
//! ```text
//! IngesterService (forward | backward)
//!        ├── BlockSource        (fetch workers over the access client)
//!        ├── ReorgWindow        (parent-id walk-back, bounded depth)
//!        ├── CheckpointManager  (per-mode resume height)
//!        ├── BlockCommitter     (atomic, idempotent per-block writes)
//!        └── HandlerRegistry    (committed-block fan-out, forward only)
//! ```
//!
//! This crate holds the data model and the persistence contract. The
//! access client lives in `flowindex-access`, the orchestration loop in
//! `flowindex-ingest`, and the storage backends in `flowindex-storage`.

pub mod checkpoint;
pub mod committer;
pub mod config;
pub mod error;
pub mod handler;
pub mod reorg;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, IngestMode};
pub use committer::{BlockCommitter, CommitOutcome};
pub use config::{IngesterConfig, IngesterState};
pub use error::IndexerError;
pub use handler::{BlockHandler, ChannelBroadcaster, CommittedBlock, HandlerRegistry, RangeHandler};
pub use reorg::{Divergence, HeaderSource, ReorgWindow};
pub use types::{BlockHeader, EventType, FetchResult, IndexedTransaction, TransactionStatus};
