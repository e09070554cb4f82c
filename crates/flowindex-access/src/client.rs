//! `AccessNodeClient`: routed, retried access calls over a pool of nodes.
//!
//! Each call is routed to the endpoint whose floor best matches the height
//! it concerns, then retried with backoff on transient errors. Node feedback
//! updates the shared health table:
//!
//! - a spork-root error raises the node's floor and the call is re-routed
//! - an exhausted retry burst quarantines the node and the call moves on to
//!   another node with the same floor, if any
//! - "unknown service" on transaction results switches the node to the
//!   legacy result service; elsewhere it quarantines the node

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use flowindex_core::types::{Account, BlockHeader, Collection, Transaction, TransactionResult};

use crate::error::AccessError;
use crate::http::{HttpAccessTransport, HttpTransportConfig};
use crate::legacy::ResultPayload;
use crate::policy::{retry, QuarantineConfig, RateLimiter, RateLimiterConfig, RetryConfig, RetryError, RetryPolicy};
use crate::pool::{Endpoint, EndpointStatus, EndpointTable};
use crate::spork::SporkTable;
use crate::transport::AccessTransport;

/// Configuration for `AccessNodeClient`.
#[derive(Debug, Clone)]
pub struct AccessClientConfig {
    pub retry: RetryConfig,
    pub quarantine: QuarantineConfig,
    /// `None` disables client-side rate limiting.
    pub rate_limit: Option<RateLimiterConfig>,
    /// Extra or replacement spork label → root height entries.
    pub spork_overrides: HashMap<String, u64>,
    /// Concurrent collection lookups per block.
    pub collection_concurrency: usize,
    /// Request timeout and legacy prefix for nodes opened with [`AccessNodeClient::connect`].
    pub transport: HttpTransportConfig,
}

impl Default for AccessClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            quarantine: QuarantineConfig::default(),
            rate_limit: Some(RateLimiterConfig::default()),
            spork_overrides: HashMap::new(),
            collection_concurrency: 4,
            transport: HttpTransportConfig::default(),
        }
    }
}

/// Which endpoint a call should be routed to.
#[derive(Debug, Clone, Copy)]
enum Route {
    /// Data at a specific height.
    Height(u64),
    /// Current chain state.
    Latest,
}

impl Route {
    fn height(&self) -> u64 {
        match self {
            Self::Height(h) => *h,
            Self::Latest => 0,
        }
    }
}

/// Multi-node Flow access client.
///
/// Safe to share between the forward and backward ingesters behind an `Arc`.
pub struct AccessNodeClient {
    table: EndpointTable,
    retry: RetryPolicy,
    quarantine: QuarantineConfig,
    limiter: Option<RateLimiter>,
    collection_concurrency: usize,
    cancel: CancellationToken,
}

impl AccessNodeClient {
    /// Build a client over `transports`. Calls stop early once `cancel` fires.
    pub fn new(
        transports: Vec<Arc<dyn AccessTransport>>,
        config: AccessClientConfig,
        cancel: CancellationToken,
    ) -> Result<Self, AccessError> {
        if transports.is_empty() {
            return Err(AccessError::NoEndpoints);
        }
        let sporks = SporkTable::builtin().with_overrides(config.spork_overrides);
        let table = EndpointTable::new(transports, &sporks);
        for ep in table.iter() {
            tracing::info!(
                endpoint = %ep.address(),
                spork = ep.spork().unwrap_or("-"),
                floor = ep.floor(),
                "access node registered"
            );
        }
        Ok(Self {
            table,
            retry: RetryPolicy::new(config.retry),
            quarantine: config.quarantine,
            limiter: config.rate_limit.and_then(RateLimiter::new),
            collection_concurrency: config.collection_concurrency.max(1),
            cancel,
        })
    }

    /// Open an HTTP transport per address and build a client over them.
    pub fn connect<I, S>(
        addresses: I,
        config: AccessClientConfig,
        cancel: CancellationToken,
    ) -> Result<Self, AccessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transports = addresses
            .into_iter()
            .map(|addr| {
                HttpAccessTransport::new(addr, config.transport.clone())
                    .map(|t| Arc::new(t) as Arc<dyn AccessTransport>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(transports, config, cancel)
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.table
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.table.status()
    }

    /// Address of the endpoint a call for `height` would currently use.
    pub fn route(&self, height: u64) -> Result<String, AccessError> {
        self.table
            .pick_for_height(height)
            .map(|e| e.address().to_string())
    }

    // ─── Public calls ───────────────────────────────────────────────────────

    pub async fn latest_sealed_height(&self) -> Result<u64, AccessError> {
        self.call(Route::Latest, "latest_sealed_height", |ep| async move {
            ep.transport().latest_sealed_height().await
        })
        .await
    }

    /// Sealed block header at `height`.
    pub async fn block_header(&self, height: u64) -> Result<BlockHeader, AccessError> {
        self.call(Route::Height(height), "block_by_height", move |ep| async move {
            ep.transport().block_by_height(height).await
        })
        .await
    }

    /// Block header plus every collection referenced by its guarantees, in
    /// guarantee order. Any collection failure fails the whole block.
    pub async fn block_by_height(
        &self,
        height: u64,
    ) -> Result<(BlockHeader, Vec<Collection>), AccessError> {
        let header = self.block_header(height).await?;
        let collections = futures::stream::iter(
            header
                .collection_guarantees
                .iter()
                .map(|g| g.collection_id.clone())
                .collect::<Vec<String>>(),
        )
        .map(|collection_id: String| async move {
            self.collection(height, &collection_id)
                .await
                .map_err(|e| AccessError::Collection {
                    height,
                    collection_id,
                    source: Box::new(e),
                })
        })
        .buffered(self.collection_concurrency)
        .try_collect::<Vec<_>>()
        .await?;
        Ok((header, collections))
    }

    pub async fn collection(&self, height: u64, id: &str) -> Result<Collection, AccessError> {
        self.call(Route::Height(height), "collection", move |ep| async move {
            ep.transport().collection(id).await
        })
        .await
    }

    /// Transaction body; `height` is the block it was included in.
    pub async fn transaction(&self, height: u64, id: &str) -> Result<Transaction, AccessError> {
        self.call(Route::Height(height), "transaction", move |ep| async move {
            ep.transport().transaction(id).await
        })
        .await
    }

    /// Transaction result in the modern shape, translating legacy responses.
    pub async fn transaction_result(
        &self,
        height: u64,
        id: &str,
    ) -> Result<TransactionResult, AccessError> {
        let payload = self.transaction_result_payload(height, id).await?;
        Ok(payload.into_result(id))
    }

    /// Transaction result as the node answered it.
    pub async fn transaction_result_payload(
        &self,
        height: u64,
        id: &str,
    ) -> Result<ResultPayload, AccessError> {
        self.call(Route::Height(height), "transaction_result", move |ep| async move {
            if ep.uses_legacy_results() {
                return ep.transport().transaction_result_legacy(id).await.map(ResultPayload::Legacy);
            }
            match ep.transport().transaction_result(id).await {
                Ok(r) => Ok(ResultPayload::Modern(r)),
                Err(e) if e.is_unknown_service() => {
                    tracing::debug!(endpoint = %ep.address(), tx = id, "modern result service unknown, trying legacy");
                    let legacy = ep.transport().transaction_result_legacy(id).await?;
                    ep.mark_legacy_results();
                    Ok(ResultPayload::Legacy(legacy))
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn account(&self, address: &str) -> Result<Account, AccessError> {
        self.call(Route::Latest, "account", move |ep| async move {
            ep.transport().account(address).await
        })
        .await
    }

    // ─── Routing core ───────────────────────────────────────────────────────

    fn pick(&self, route: Route) -> Result<Arc<Endpoint>, AccessError> {
        match route {
            Route::Height(h) => self.table.pick_for_height(h),
            Route::Latest => self.table.pick_latest(),
        }
    }

    async fn throttle(&self) -> Result<(), AccessError> {
        match &self.limiter {
            Some(l) if !l.acquire(&self.cancel).await => Err(AccessError::Cancelled),
            _ => Ok(()),
        }
    }

    fn quarantine(&self, ep: &Endpoint, err: &AccessError) {
        if let Some(d) = self.quarantine.duration_for(err) {
            ep.disable_for(d);
        }
    }

    async fn call<T, F, Fut>(&self, route: Route, call: &'static str, op: F) -> Result<T, AccessError>
    where
        F: Fn(Arc<Endpoint>) -> Fut,
        Fut: Future<Output = Result<T, AccessError>>,
    {
        let mut tried: Vec<usize> = Vec::new();
        let mut last_err: Option<AccessError> = None;

        // Each pass either succeeds, fails for good, or moves to a node not yet tried.
        for _ in 0..=self.table.len() {
            let ep = self.pick(route)?;
            if tried.contains(&ep.index()) {
                break;
            }
            tried.push(ep.index());

            let outcome = retry(&self.retry, &self.cancel, AccessError::is_transient, |_| {
                let fut = op(Arc::clone(&ep));
                async move {
                    self.throttle().await?;
                    fut.await
                }
            })
            .await;

            match outcome {
                Ok(v) => {
                    ep.record_success();
                    return Ok(v);
                }
                Err(RetryError::Cancelled) => return Err(AccessError::Cancelled),
                Err(RetryError::Exhausted { attempts, last }) => {
                    if ep.record_failure() >= self.quarantine.failure_threshold {
                        self.quarantine(&ep, &last);
                    }
                    tracing::warn!(
                        call,
                        height = route.height(),
                        endpoint = %ep.address(),
                        attempts,
                        error = %last,
                        "access node exhausted retries"
                    );
                    last_err = Some(AccessError::MaxRetries {
                        call,
                        height: route.height(),
                        attempts,
                        endpoint: ep.address().to_string(),
                        source: Box::new(last),
                    });
                }
                Err(RetryError::Permanent(e)) => {
                    if let Some(root) = e.spork_root_height() {
                        ep.raise_floor(root);
                        if let Route::Height(h) = route {
                            if h < root {
                                // Floor moved above h; the next pick avoids this node.
                                last_err = Some(e);
                                continue;
                            }
                        }
                        return Err(e);
                    }
                    if e.is_unknown_service() || e.is_resolver_failure() {
                        self.quarantine(&ep, &e);
                    }
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or(AccessError::NoEndpoints))
    }
}
