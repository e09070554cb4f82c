//! Configuration for the `flowindex` binary.
//!
//! Values are layered, lowest precedence first: built-in defaults, the
//! optional YAML file, then command-line flags (each of which also reads an
//! environment variable).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use serde::{Deserialize, Serialize};

use flowindex_access::policy::{QuarantineConfig, RateLimiterConfig};
use flowindex_access::{parse_node_list, AccessClientConfig};
use flowindex_core::config::IngesterConfig;
use flowindex_ingest::IngesterBuilder;

use crate::logging::LogConfig;

/// Used when no live node is configured.
pub const DEFAULT_ACCESS_NODE: &str = "https://rest-mainnet.onflow.org";
pub const DEFAULT_DATABASE: &str = "flowindex.db";
const DEFAULT_RPS: f64 = 5.0;

/// Contents of the YAML configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// SQLite database path.
    pub database: Option<String>,
    pub log: LogConfig,
    pub access: AccessSettings,
    pub forward: IngesterSection,
    pub backward: IngesterSection,
}

/// Access pool and client policy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSettings {
    pub nodes: Vec<String>,
    /// Nodes of earlier sporks, appended to the pool after `nodes`.
    pub historic_nodes: Vec<String>,
    pub archive_node: Option<String>,
    /// Quarantine length in seconds, clamped to [1, 300].
    pub unavailable_disable_sec: Option<i64>,
    pub rps: Option<f64>,
    pub burst: Option<f64>,
    /// Per-node budget; takes precedence over `rps`/`burst` when set.
    pub rps_per_node: Option<f64>,
    pub burst_per_node: Option<f64>,
    pub request_timeout_ms: Option<u64>,
    pub collection_concurrency: Option<usize>,
    pub tx_concurrency: Option<usize>,
    /// Spork label → root height, for sporks newer than this build.
    pub spork_overrides: HashMap<String, u64>,
}

/// Optional overrides for one ingester. Unset fields keep the mode's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngesterSection {
    pub enabled: Option<bool>,
    pub service: Option<String>,
    pub start_height: Option<u64>,
    pub stop_height: Option<u64>,
    pub batch_size: Option<u64>,
    pub worker_count: Option<usize>,
    pub max_reorg_depth: Option<u64>,
    pub reorg_window: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub error_backoff_ms: Option<u64>,
    pub adaptive_batch: Option<bool>,
}

/// Access flags shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct AccessArgs {
    /// Live access nodes (comma, semicolon or whitespace separated)
    #[arg(long, global = true, env = "FLOW_ACCESS_NODES")]
    pub access_nodes: Option<String>,
    /// Single live access node, used when no list is given
    #[arg(long, global = true, env = "FLOW_ACCESS_NODE")]
    pub access_node: Option<String>,
    /// Access nodes of earlier sporks
    #[arg(long, global = true, env = "FLOW_HISTORIC_ACCESS_NODES")]
    pub historic_access_nodes: Option<String>,
    /// Archive node appended to the pool
    #[arg(long, global = true, env = "FLOW_ARCHIVE_NODE")]
    pub archive_node: Option<String>,
    /// Seconds a failing node is skipped (1..=300, default 20)
    #[arg(long, global = true, env = "FLOW_NODE_UNAVAILABLE_DISABLE_SEC")]
    pub node_unavailable_disable_sec: Option<String>,
    /// Client-wide requests per second (0 disables limiting)
    #[arg(long, global = true, env = "FLOW_RPC_RPS")]
    pub rpc_rps: Option<f64>,
    #[arg(long, global = true, env = "FLOW_RPC_BURST")]
    pub rpc_burst: Option<f64>,
    /// Requests per second per node, scaled by the pool size
    #[arg(long, global = true, env = "FLOW_RPC_RPS_PER_NODE")]
    pub rpc_rps_per_node: Option<f64>,
    #[arg(long, global = true, env = "FLOW_RPC_BURST_PER_NODE")]
    pub rpc_burst_per_node: Option<f64>,
    /// Per-request timeout in milliseconds
    #[arg(long, global = true, env = "FLOW_RPC_TIMEOUT_MS")]
    pub rpc_timeout_ms: Option<u64>,
}

/// Flags of the `run` subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Run the forward (live) ingester
    #[arg(long, env = "ENABLE_FORWARD_INGESTER", action = ArgAction::Set)]
    pub forward: Option<bool>,
    /// Run the backward (history) ingester
    #[arg(long, env = "ENABLE_HISTORY_INGESTER", action = ArgAction::Set)]
    pub history: Option<bool>,
    #[arg(long, env = "FORWARD_SERVICE_NAME")]
    pub forward_service: Option<String>,
    #[arg(long, env = "HISTORY_SERVICE_NAME")]
    pub history_service: Option<String>,
    /// First forward height when no checkpoint exists
    #[arg(long, env = "START_BLOCK")]
    pub start_block: Option<u64>,
    /// First backward height when no checkpoint exists
    #[arg(long, env = "HISTORY_START_BLOCK")]
    pub history_start_block: Option<u64>,
    /// Lowest height the backward ingester descends to
    #[arg(long, env = "HISTORY_STOP_HEIGHT")]
    pub history_stop_height: Option<u64>,
    #[arg(long, env = "LATEST_BATCH_SIZE")]
    pub latest_batch_size: Option<u64>,
    #[arg(long, env = "HISTORY_BATCH_SIZE")]
    pub history_batch_size: Option<u64>,
    #[arg(long, env = "LATEST_WORKER_COUNT")]
    pub latest_worker_count: Option<usize>,
    #[arg(long, env = "HISTORY_WORKER_COUNT")]
    pub history_worker_count: Option<usize>,
    #[arg(long, env = "MAX_REORG_DEPTH")]
    pub max_reorg_depth: Option<u64>,
}

fn set<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

fn non_empty(raw: &Option<String>) -> Option<Vec<String>> {
    raw.as_deref().map(parse_node_list).filter(|n| !n.is_empty())
}

impl FileConfig {
    /// Load `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or(DEFAULT_DATABASE)
    }

    pub fn overlay_run(&mut self, args: &RunArgs) {
        let f = &mut self.forward;
        set(&mut f.enabled, &args.forward);
        set(&mut f.service, &args.forward_service);
        set(&mut f.start_height, &args.start_block);
        set(&mut f.batch_size, &args.latest_batch_size);
        set(&mut f.worker_count, &args.latest_worker_count);
        set(&mut f.max_reorg_depth, &args.max_reorg_depth);

        let b = &mut self.backward;
        set(&mut b.enabled, &args.history);
        set(&mut b.service, &args.history_service);
        set(&mut b.start_height, &args.history_start_block);
        set(&mut b.stop_height, &args.history_stop_height);
        set(&mut b.batch_size, &args.history_batch_size);
        set(&mut b.worker_count, &args.history_worker_count);
    }

    pub fn forward_enabled(&self) -> bool {
        self.forward.enabled.unwrap_or(true)
    }

    pub fn backward_enabled(&self) -> bool {
        self.backward.enabled.unwrap_or(true)
    }

    pub fn forward_builder(&self) -> IngesterBuilder {
        self.forward.apply(IngesterBuilder::forward())
    }

    pub fn backward_builder(&self) -> IngesterBuilder {
        self.backward.apply(IngesterBuilder::backward())
    }

    pub fn forward_config(&self) -> IngesterConfig {
        self.forward_builder().build_config()
    }

    pub fn backward_config(&self) -> IngesterConfig {
        self.backward_builder().build_config()
    }
}

impl IngesterSection {
    /// Apply the set fields on top of `builder`.
    pub fn apply(&self, mut builder: IngesterBuilder) -> IngesterBuilder {
        if let Some(v) = &self.service {
            builder = builder.service(v.clone());
        }
        if let Some(v) = self.start_height {
            builder = builder.start_height(v);
        }
        if let Some(v) = self.stop_height {
            builder = builder.stop_height(v);
        }
        if let Some(v) = self.batch_size {
            builder = builder.batch_size(v);
        }
        if let Some(v) = self.worker_count {
            builder = builder.worker_count(v);
        }
        if let Some(v) = self.max_reorg_depth {
            builder = builder.max_reorg_depth(v);
        }
        if let Some(v) = self.reorg_window {
            builder = builder.reorg_window(v);
        }
        if let Some(v) = self.poll_interval_ms {
            builder = builder.poll_interval_ms(v);
        }
        if let Some(v) = self.error_backoff_ms {
            builder = builder.error_backoff_ms(v);
        }
        if let Some(v) = self.adaptive_batch {
            builder = builder.adaptive_batch(v);
        }
        builder
    }
}

impl AccessSettings {
    pub fn overlay(&mut self, args: &AccessArgs) {
        if let Some(nodes) = non_empty(&args.access_nodes).or_else(|| non_empty(&args.access_node)) {
            self.nodes = nodes;
        }
        if let Some(nodes) = non_empty(&args.historic_access_nodes) {
            self.historic_nodes = nodes;
        }
        if let Some(node) = args.archive_node.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            self.archive_node = Some(node.to_string());
        }
        if let Some(raw) = &args.node_unavailable_disable_sec {
            // Unparsable input falls back to the default quarantine.
            self.unavailable_disable_sec = raw.trim().parse().ok();
        }
        set(&mut self.rps, &args.rpc_rps);
        set(&mut self.burst, &args.rpc_burst);
        set(&mut self.rps_per_node, &args.rpc_rps_per_node);
        set(&mut self.burst_per_node, &args.rpc_burst_per_node);
        set(&mut self.request_timeout_ms, &args.rpc_timeout_ms);
    }

    /// Pool addresses: live nodes first, then historic and archive nodes,
    /// without duplicates.
    pub fn pool(&self) -> Vec<String> {
        let live = if self.nodes.is_empty() {
            vec![DEFAULT_ACCESS_NODE.to_string()]
        } else {
            self.nodes.clone()
        };
        let mut pool: Vec<String> = Vec::new();
        for addr in live
            .into_iter()
            .chain(self.historic_nodes.iter().cloned())
            .chain(self.archive_node.iter().cloned())
        {
            if !pool.contains(&addr) {
                pool.push(addr);
            }
        }
        pool
    }

    /// Rate limit for a pool of `nodes` endpoints; `None` when disabled.
    pub fn rate_limit(&self, nodes: usize) -> Option<RateLimiterConfig> {
        if let Some(per_node) = self.rps_per_node {
            return (per_node > 0.0)
                .then(|| RateLimiterConfig::per_node(per_node, self.burst_per_node, nodes));
        }
        let rps = self.rps.unwrap_or(DEFAULT_RPS);
        (rps > 0.0).then(|| RateLimiterConfig {
            requests_per_sec: rps,
            burst: self.burst.unwrap_or(rps).max(1.0),
        })
    }

    pub fn client_config(&self) -> AccessClientConfig {
        let mut config = AccessClientConfig {
            rate_limit: self.rate_limit(self.pool().len()),
            spork_overrides: self.spork_overrides.clone(),
            ..Default::default()
        };
        if let Some(secs) = self.unavailable_disable_sec {
            config.quarantine = QuarantineConfig::default().with_secs(secs);
        }
        if let Some(ms) = self.request_timeout_ms {
            config.transport.request_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.collection_concurrency {
            config.collection_concurrency = n;
        }
        config
    }
}
