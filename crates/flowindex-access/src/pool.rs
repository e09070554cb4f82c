//! Endpoint-health table and height routing.
//!
//! Every field a routing decision reads is an atomic, so routing never
//! blocks the tasks that mark floors or quarantine nodes. Endpoints are
//! created once at startup and never removed.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AccessError;
use crate::spork::{spork_label, SporkTable};
use crate::transport::AccessTransport;

/// One remote access node and its health.
pub struct Endpoint {
    index: usize,
    transport: Arc<dyn AccessTransport>,
    spork: Option<String>,
    /// Lowest height the node can serve (0 = unknown / archival).
    floor: AtomicU64,
    /// Milliseconds since `epoch` until which the node is quarantined.
    disabled_until_ms: AtomicU64,
    failure_streak: AtomicU32,
    /// Set once the node answered "unknown service" for modern results.
    legacy_results: AtomicBool,
    epoch: Instant,
}

impl Endpoint {
    fn new(index: usize, transport: Arc<dyn AccessTransport>, floor: u64, epoch: Instant) -> Self {
        let spork = spork_label(transport.address());
        Self {
            index,
            transport,
            spork,
            floor: AtomicU64::new(floor),
            disabled_until_ms: AtomicU64::new(0),
            failure_streak: AtomicU32::new(0),
            legacy_results: AtomicBool::new(false),
            epoch,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn address(&self) -> &str {
        self.transport.address()
    }

    pub fn spork(&self) -> Option<&str> {
        self.spork.as_deref()
    }

    pub fn transport(&self) -> &Arc<dyn AccessTransport> {
        &self.transport
    }

    pub fn floor(&self) -> u64 {
        self.floor.load(Ordering::Acquire)
    }

    /// Overwrite the floor (configuration and tests).
    pub fn set_floor(&self, height: u64) {
        self.floor.store(height, Ordering::Release);
    }

    /// Raise the floor to `height`; never lowers it. Returns `true` if it moved.
    pub fn raise_floor(&self, height: u64) -> bool {
        let prev = self.floor.fetch_max(height, Ordering::AcqRel);
        if prev < height {
            tracing::info!(endpoint = %self.address(), from = prev, to = height, "learned node floor");
            true
        } else {
            false
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn disabled_until(&self) -> u64 {
        self.disabled_until_ms.load(Ordering::Acquire)
    }

    /// Returns `true` while the node is quarantined.
    pub fn is_disabled(&self) -> bool {
        self.disabled_until() > self.now_ms()
    }

    /// Remaining quarantine, if any.
    pub fn disabled_for(&self) -> Option<Duration> {
        let until = self.disabled_until();
        let now = self.now_ms();
        (until > now).then(|| Duration::from_millis(until - now))
    }

    /// Quarantine the node for `d` from now.
    pub fn disable_for(&self, d: Duration) {
        let until = self.now_ms() + d.as_millis() as u64;
        self.disabled_until_ms.store(until, Ordering::Release);
        tracing::warn!(endpoint = %self.address(), secs = d.as_secs(), "access node quarantined");
    }

    pub fn enable(&self) {
        self.disabled_until_ms.store(0, Ordering::Release);
    }

    /// Reset the failure streak after a successful call.
    pub fn record_success(&self) {
        self.failure_streak.store(0, Ordering::Relaxed);
    }

    /// Count an exhausted retry burst; returns the new streak length.
    pub fn record_failure(&self) -> u32 {
        self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn uses_legacy_results(&self) -> bool {
        self.legacy_results.load(Ordering::Acquire)
    }

    pub fn mark_legacy_results(&self) {
        if !self.legacy_results.swap(true, Ordering::AcqRel) {
            tracing::info!(endpoint = %self.address(), "switching to legacy transaction results");
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("index", &self.index)
            .field("address", &self.address())
            .field("floor", &self.floor())
            .field("disabled_for", &self.disabled_for())
            .finish()
    }
}

/// Point-in-time view of one endpoint, for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub index: usize,
    pub address: String,
    pub spork: Option<String>,
    pub floor: u64,
    pub disabled_for: Option<Duration>,
    pub legacy_results: bool,
}

/// The pool of endpoints with floor-aware routing.
pub struct EndpointTable {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: AtomicUsize,
}

impl EndpointTable {
    /// Build the table, seeding each floor from the spork label in its address.
    pub fn new(transports: Vec<Arc<dyn AccessTransport>>, sporks: &SporkTable) -> Self {
        let epoch = Instant::now();
        let endpoints = transports
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                let floor = sporks.floor_for_address(t.address());
                Arc::new(Endpoint::new(i, t, floor, epoch))
            })
            .collect();
        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Number of endpoints in the table.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Returns `true` if the table has no endpoints.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Endpoint>> {
        self.endpoints.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.iter()
    }

    /// Lowest floor across all endpoints.
    pub fn lowest_floor(&self) -> Option<u64> {
        self.endpoints.iter().map(|e| e.floor()).min()
    }

    /// Choose the endpoint for a height-specific call.
    ///
    /// The endpoint with the greatest floor ≤ `height` wins, even while
    /// quarantined. Ties prefer enabled endpoints in round-robin order; if all
    /// tied endpoints are quarantined the one released soonest is chosen.
    pub fn pick_for_height(&self, height: u64) -> Result<Arc<Endpoint>, AccessError> {
        if self.endpoints.is_empty() {
            return Err(AccessError::NoEndpoints);
        }
        let best = self
            .endpoints
            .iter()
            .map(|e| e.floor())
            .filter(|f| *f <= height)
            .max()
            .ok_or_else(|| AccessError::NoEndpointForHeight {
                height,
                lowest_floor: self.lowest_floor().unwrap_or(0),
            })?;
        let group: Vec<&Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|e| e.floor() == best)
            .collect();
        Ok(self.choose(&group))
    }

    /// Choose an endpoint for calls about the current chain state.
    ///
    /// Prefers unlabeled endpoints (which follow the live spork); without any,
    /// falls back to the endpoints with the greatest floor.
    pub fn pick_latest(&self) -> Result<Arc<Endpoint>, AccessError> {
        if self.endpoints.is_empty() {
            return Err(AccessError::NoEndpoints);
        }
        let mut group: Vec<&Arc<Endpoint>> =
            self.endpoints.iter().filter(|e| e.spork().is_none()).collect();
        if group.is_empty() {
            let top = self.endpoints.iter().map(|e| e.floor()).max().unwrap_or(0);
            group = self.endpoints.iter().filter(|e| e.floor() == top).collect();
        }
        Ok(self.choose(&group))
    }

    fn choose(&self, group: &[&Arc<Endpoint>]) -> Arc<Endpoint> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % group.len();
        let rotated = group.iter().cycle().skip(start).take(group.len());
        for ep in rotated {
            if !ep.is_disabled() {
                return Arc::clone(ep);
            }
        }
        let soonest = group
            .iter()
            .min_by_key(|e| e.disabled_until())
            .unwrap_or(&group[0]);
        Arc::clone(soonest)
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints
            .iter()
            .map(|e| EndpointStatus {
                index: e.index(),
                address: e.address().to_string(),
                spork: e.spork().map(str::to_string),
                floor: e.floor(),
                disabled_for: e.disabled_for(),
                legacy_results: e.uses_legacy_results(),
            })
            .collect()
    }
}
