//! flowindex-access: resilient, spork-aware access to Flow access nodes.
//!
//! # Overview
//!
//! Flow history is split into sporks; each access node only serves heights
//! at or above its spork's root. This crate turns a list of such nodes into a
//! single client:
//!
//! - [`AccessTransport`]: the async trait every node connection implements
//! - [`HttpAccessTransport`]: the REST implementation backed by `reqwest`
//! - [`pool`]: the endpoint-health table and height routing
//! - [`policy`]: retry, quarantine and rate limiting
//! - [`legacy`]: translation of legacy transaction-result responses
//! - [`AccessNodeClient`]: routed, retried calls with legacy fallback
//!
//! ```text
//! call(height) → [RateLimiter] → pick_for_height → [Retry] → AccessTransport
//!                                      ↑                          │
//!                      floor learning / quarantine  ←─────────────┘
//! ```

pub mod client;
pub mod error;
pub mod http;
pub mod legacy;
pub mod policy;
pub mod pool;
pub mod spork;
pub mod transport;

pub use client::{AccessClientConfig, AccessNodeClient};
pub use error::{AccessError, RpcCode};
pub use http::{HttpAccessTransport, HttpTransportConfig};
pub use legacy::{LegacyTransactionResult, ResultPayload};
pub use pool::{Endpoint, EndpointTable};
pub use spork::SporkTable;
pub use transport::AccessTransport;

/// Split a node list on commas, semicolons and whitespace.
pub fn parse_node_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
