//! Reorg detection and common-ancestor search.
//!
//! Before block `h` is committed its parent id is compared with the stored
//! id at `h - 1`. On mismatch the window walks back one height at a time,
//! fetching canonical headers, until the stored id agrees with the canonical
//! chain. Everything above that ancestor must then be rolled back.
//!
//! Recently committed ids are kept in a bounded in-memory window so the
//! common case needs no storage read.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::committer::BlockCommitter;
use crate::error::IndexerError;
use crate::types::BlockHeader;

/// Source of canonical headers used during the walk-back.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    async fn header(&self, height: u64) -> Result<BlockHeader, IndexerError>;
}

/// A detected divergence between the stored chain and the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    /// Height of the incoming block whose parent did not match.
    pub detected_at: u64,
    /// Highest height at which stored and canonical chains agree.
    pub common_ancestor: u64,
    /// Number of stored blocks that must be dropped.
    pub depth: u64,
}

/// Bounded window of recently committed `(height, id)` pairs.
pub struct ReorgWindow {
    recent: VecDeque<(u64, String)>,
    capacity: usize,
    max_depth: u64,
}

impl ReorgWindow {
    /// `capacity` bounds the in-memory cache; `max_depth` bounds the walk-back.
    pub fn new(capacity: usize, max_depth: u64) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Remember a committed block. Out-of-sequence heights reset the window.
    pub fn record(&mut self, height: u64, id: &str) {
        if let Some((last, _)) = self.recent.back() {
            if height != last + 1 {
                self.recent.clear();
            }
        }
        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back((height, id.to_string()));
    }

    /// Forget everything above `height`.
    pub fn truncate_above(&mut self, height: u64) {
        while matches!(self.recent.back(), Some((h, _)) if *h > height) {
            self.recent.pop_back();
        }
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    async fn stored_id(
        &self,
        height: u64,
        store: &dyn BlockCommitter,
    ) -> Result<Option<String>, IndexerError> {
        if let Some((_, id)) = self.recent.iter().rev().find(|(h, _)| *h == height) {
            return Ok(Some(id.clone()));
        }
        store.block_id_at(height).await
    }

    /// Returns `Ok(None)` if `incoming` extends what is stored (or nothing is
    /// stored below it), otherwise the divergence to roll back.
    ///
    /// Fails with [`IndexerError::ReorgTooDeep`] when no common ancestor is
    /// found within `max_depth` blocks.
    pub async fn check(
        &self,
        incoming: &BlockHeader,
        store: &dyn BlockCommitter,
        canonical: &dyn HeaderSource,
    ) -> Result<Option<Divergence>, IndexerError> {
        let h = incoming.height;
        if h == 0 {
            return Ok(None);
        }

        let mut height = h - 1;
        let mut expected = incoming.parent_id.clone();
        loop {
            let stored = match self.stored_id(height, store).await? {
                Some(id) => id,
                None if height == h - 1 => return Ok(None),
                None => {
                    // Nothing stored this low; the rollback can stop here.
                    return Ok(Some(self.divergence(h, height)));
                }
            };
            if stored == expected {
                return if height == h - 1 {
                    Ok(None)
                } else {
                    Ok(Some(self.divergence(h, height)))
                };
            }

            let depth = h - height;
            if depth > self.max_depth {
                tracing::error!(height = h, depth, max_depth = self.max_depth, "reorg exceeds max depth");
                return Err(IndexerError::ReorgTooDeep {
                    height: h,
                    depth,
                    max_depth: self.max_depth,
                });
            }
            if height == 0 {
                return Err(IndexerError::Aborted {
                    reason: format!("stored genesis block {stored} differs from canonical {expected}"),
                });
            }

            tracing::debug!(height, stored = %stored, expected = %expected, "stored block diverges, walking back");
            let header = canonical.header(height).await?;
            expected = header.parent_id;
            height -= 1;
        }
    }

    fn divergence(&self, detected_at: u64, common_ancestor: u64) -> Divergence {
        let d = Divergence {
            detected_at,
            common_ancestor,
            depth: detected_at - 1 - common_ancestor,
        };
        tracing::warn!(
            detected_at = d.detected_at,
            common_ancestor = d.common_ancestor,
            depth = d.depth,
            "chain reorganization detected"
        );
        d
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::committer::CommitOutcome;
    use crate::types::fixtures::{block_id, header};
    use crate::types::FetchResult;

    /// Stored ids only; enough for the walk-back.
    #[derive(Default)]
    struct Ids(Mutex<BTreeMap<u64, String>>);

    impl Ids {
        fn with(range: std::ops::RangeInclusive<u64>, fork: &str) -> Self {
            let ids = Self::default();
            for h in range {
                ids.0.lock().unwrap().insert(h, block_id(h, fork));
            }
            ids
        }
    }

    #[async_trait]
    impl BlockCommitter for Ids {
        async fn commit(&self, b: &FetchResult) -> Result<CommitOutcome, IndexerError> {
            self.0.lock().unwrap().insert(b.height(), b.id().to_string());
            Ok(CommitOutcome::Inserted)
        }
        async fn block_id_at(&self, height: u64) -> Result<Option<String>, IndexerError> {
            Ok(self.0.lock().unwrap().get(&height).cloned())
        }
        async fn rollback_above(&self, height: u64, _: Option<Checkpoint>) -> Result<u64, IndexerError> {
            let mut m = self.0.lock().unwrap();
            let before = m.len();
            m.retain(|h, _| *h <= height);
            Ok((before - m.len()) as u64)
        }
        async fn highest_height(&self) -> Result<Option<u64>, IndexerError> {
            Ok(self.0.lock().unwrap().keys().next_back().copied())
        }
        async fn lowest_height(&self) -> Result<Option<u64>, IndexerError> {
            Ok(self.0.lock().unwrap().keys().next().copied())
        }
    }

    /// Canonical chain "b" forked off "a" above `fork_at`.
    struct Canonical {
        fork_at: u64,
    }

    #[async_trait]
    impl HeaderSource for Canonical {
        async fn header(&self, height: u64) -> Result<BlockHeader, IndexerError> {
            let fork = if height > self.fork_at { "b" } else { "a" };
            let parent = if height > self.fork_at + 1 { "b" } else { "a" };
            Ok(header(height, fork, parent))
        }
    }

    #[tokio::test]
    async fn extending_block_passes() {
        let store = Ids::with(1..=49, "a");
        let w = ReorgWindow::new(16, 1000);
        let res = w.check(&header(50, "a", "a"), &store, &Canonical { fork_at: 100 }).await.unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn empty_store_passes() {
        let store = Ids::default();
        let w = ReorgWindow::new(16, 1000);
        let res = w.check(&header(50, "a", "a"), &store, &Canonical { fork_at: 100 }).await.unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn single_block_divergence_finds_parent_of_parent() {
        // Stored 1..=49 on fork "a"; canonical chain replaced 49.
        let store = Ids::with(1..=49, "a");
        let w = ReorgWindow::new(16, 1000);
        let incoming = header(50, "b", "b");
        let d = w
            .check(&incoming, &store, &Canonical { fork_at: 48 })
            .await
            .unwrap()
            .expect("divergence");
        assert_eq!(d.detected_at, 50);
        assert_eq!(d.common_ancestor, 48);
        assert_eq!(d.depth, 1);
    }

    #[tokio::test]
    async fn multi_block_divergence() {
        let store = Ids::with(1..=49, "a");
        let w = ReorgWindow::new(16, 1000);
        let d = w
            .check(&header(50, "b", "b"), &store, &Canonical { fork_at: 45 })
            .await
            .unwrap()
            .expect("divergence");
        assert_eq!(d.common_ancestor, 45);
        assert_eq!(d.depth, 4);
    }

    #[tokio::test]
    async fn too_deep_is_fatal() {
        let store = Ids::with(1..=49, "a");
        let w = ReorgWindow::new(16, 3);
        let err = w
            .check(&header(50, "b", "b"), &store, &Canonical { fork_at: 40 })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::ReorgTooDeep { height: 50, max_depth: 3, .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn window_cache_answers_before_store() {
        let store = Ids::default();
        let mut w = ReorgWindow::new(4, 1000);
        for h in 10..=12 {
            w.record(h, &block_id(h, "a"));
        }
        assert_eq!(w.len(), 3);
        let bad = header(13, "b", "b");
        // The cache holds 12 from fork "a", so the "b" parent mismatches.
        let d = w.check(&bad, &store, &Canonical { fork_at: 11 }).await.unwrap().unwrap();
        assert_eq!(d.common_ancestor, 11);

        w.truncate_above(11);
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn window_is_bounded_and_resets_on_gap() {
        let mut w = ReorgWindow::new(2, 10);
        w.record(1, "x");
        w.record(2, "y");
        w.record(3, "z");
        assert_eq!(w.len(), 2);
        w.record(10, "gap");
        assert_eq!(w.len(), 1);
    }
}
