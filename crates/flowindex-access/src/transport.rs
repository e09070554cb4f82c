//! The `AccessTransport` trait: one connection to one access node.

use async_trait::async_trait;

use flowindex_core::types::{Account, BlockHeader, Collection, Transaction, TransactionResult};

use crate::error::{AccessError, RpcCode};
use crate::legacy::LegacyTransactionResult;

/// The calls the ingestion engine needs from a single access node.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and is stored as `Arc<dyn AccessTransport>`.
#[async_trait]
pub trait AccessTransport: Send + Sync + 'static {
    /// The node's address as configured (used for spork labels and logs).
    fn address(&self) -> &str;

    async fn latest_sealed_height(&self) -> Result<u64, AccessError>;

    /// Sealed block header at `height`, including its collection guarantees.
    async fn block_by_height(&self, height: u64) -> Result<BlockHeader, AccessError>;

    async fn collection(&self, id: &str) -> Result<Collection, AccessError>;

    async fn transaction(&self, id: &str) -> Result<Transaction, AccessError>;

    async fn transaction_result(&self, id: &str) -> Result<TransactionResult, AccessError>;

    /// Transaction result in the legacy protocol shape.
    ///
    /// Nodes that only speak the modern protocol keep the default.
    async fn transaction_result_legacy(
        &self,
        _id: &str,
    ) -> Result<LegacyTransactionResult, AccessError> {
        Err(AccessError::rpc(
            RpcCode::Unimplemented,
            "unknown service flow.legacy.access.AccessAPI",
        ))
    }

    async fn account(&self, address: &str) -> Result<Account, AccessError>;
}
