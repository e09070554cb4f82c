//! flowindex-storage: persistence backends for FlowIndex.
//!
//! Both backends implement [`BlockCommitter`](flowindex_core::BlockCommitter)
//! and [`CheckpointStore`](flowindex_core::CheckpointStore), so one value can
//! serve as both and keep block rollbacks atomic with checkpoint resets.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
