//! Cheap, shareable view of what an ingester is doing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use flowindex_core::checkpoint::IngestMode;
use flowindex_core::config::IngesterState;

const NONE: u64 = u64::MAX;

struct Inner {
    service: String,
    mode: IngestMode,
    state: Mutex<IngesterState>,
    last_committed: AtomicU64,
    committed_blocks: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Handle onto an ingester's live status. Clones share the same state.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<Inner>,
}

/// Point-in-time copy of a [`StatusHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub service: String,
    pub mode: IngestMode,
    pub state: IngesterState,
    pub last_committed: Option<u64>,
    pub committed_blocks: u64,
    pub last_error: Option<String>,
}

impl StatusHandle {
    pub fn new(service: impl Into<String>, mode: IngestMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                service: service.into(),
                mode,
                state: Mutex::new(IngesterState::Idle),
                last_committed: AtomicU64::new(NONE),
                committed_blocks: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> IngesterState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_committed(&self) -> Option<u64> {
        match self.inner.last_committed.load(Ordering::Acquire) {
            NONE => None,
            h => Some(h),
        }
    }

    pub fn committed_blocks(&self) -> u64 {
        self.inner.committed_blocks.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            service: self.inner.service.clone(),
            mode: self.inner.mode,
            state: self.state(),
            last_committed: self.last_committed(),
            committed_blocks: self.committed_blocks(),
            last_error: self.last_error(),
        }
    }

    pub(crate) fn set_state(&self, state: IngesterState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn set_last_committed(&self, height: u64) {
        self.inner.last_committed.store(height, Ordering::Release);
    }

    pub(crate) fn add_committed(&self, n: u64) {
        self.inner.committed_blocks.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn set_error(&self, err: impl ToString) {
        *self.inner.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }

    pub(crate) fn clear_error(&self) {
        *self.inner.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
