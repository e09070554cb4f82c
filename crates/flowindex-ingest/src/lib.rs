//! flowindex-ingest: forward and backward ingestion over Flow access nodes.
//!
//! - [`FetchWorker`] turns a height into a self-contained `FetchResult`
//! - [`IngesterService`] batches heights across a worker pool, commits them
//!   in order, maintains the checkpoint and recovers from reorgs
//! - [`StatusHandle`] exposes state, last committed height and last error
//! - [`IngesterBuilder`] assembles a service fluently
//!
//! A forward and a backward service can run side by side over the same
//! `AccessNodeClient`; they share nothing else.

pub mod builder;
pub mod service;
pub mod status;
pub mod worker;

pub use builder::IngesterBuilder;
pub use service::{Cycle, IngesterService};
pub use status::{StatusHandle, StatusSnapshot};
pub use worker::{BlockSource, FetchWorker};
