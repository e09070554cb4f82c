//! Temporary quarantine of misbehaving access nodes.
//!
//! A node is quarantined when it keeps failing transiently after a full
//! retry burst, or when it does not implement a required service. While
//! quarantined it is skipped by routing unless it is the only node able to
//! serve a height.

use std::time::Duration;

use crate::error::AccessError;

/// Lower bound of the quarantine duration.
pub const MIN_QUARANTINE: Duration = Duration::from_secs(1);
/// Upper bound of the quarantine duration.
pub const MAX_QUARANTINE: Duration = Duration::from_secs(300);
/// Default quarantine duration.
pub const DEFAULT_QUARANTINE: Duration = Duration::from_secs(20);

/// Configuration for node quarantine.
#[derive(Debug, Clone)]
pub struct QuarantineConfig {
    /// How long a failing node is skipped.
    pub duration: Duration,
    /// Consecutive exhausted retry bursts before a node is quarantined.
    pub failure_threshold: u32,
    /// How long a node whose name does not resolve is skipped.
    pub resolver_failure_duration: Duration,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            duration: DEFAULT_QUARANTINE,
            failure_threshold: 1,
            resolver_failure_duration: MAX_QUARANTINE,
        }
    }
}

impl QuarantineConfig {
    /// Duration from whole seconds, clamped to [1s, 300s].
    pub fn with_secs(mut self, secs: i64) -> Self {
        self.duration = clamp_secs(secs);
        self
    }

    /// Duration from a raw setting such as an environment variable. Empty or
    /// unparsable input falls back to the 20s default; numbers are clamped.
    pub fn from_setting(raw: Option<&str>) -> Self {
        let base = Self::default();
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => match s.parse::<i64>() {
                Ok(secs) => base.with_secs(secs),
                Err(_) => base,
            },
            None => base,
        }
    }

    /// How long to quarantine a node after `err`, or `None` if `err` says
    /// nothing about the node's health.
    pub fn duration_for(&self, err: &AccessError) -> Option<Duration> {
        if err.is_resolver_failure() {
            Some(self.resolver_failure_duration)
        } else if err.is_unknown_service() || err.is_transient() {
            Some(self.duration)
        } else {
            None
        }
    }
}

fn clamp_secs(secs: i64) -> Duration {
    let secs = secs.clamp(MIN_QUARANTINE.as_secs() as i64, MAX_QUARANTINE.as_secs() as i64);
    Duration::from_secs(secs as u64)
}
