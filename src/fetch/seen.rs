//! Ledger of items already observed per source
//!
//! A source's first successful fetch only seeds the ledger. Once the source
//! is primed, any item id it has not seen before is new.
//!
//! Each id remembers the fetch generation it was last observed in. Settling a
//! fetch drops ids absent from the last [`RETAINED_FETCHES`] fetches that
//! returned items, so a sliding feed window keeps the ledger bounded.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Fetches with items an id survives without being observed again
pub const RETAINED_FETCHES: u64 = 3;

#[derive(Debug, Default)]
struct SourceLedger {
    primed: bool,
    generation: u64,
    /// Observations since the last settle
    observed: bool,
    seen: HashMap<String, u64>,
}

/// Process-lifetime record of (source, item) pairs
#[derive(Debug, Default)]
pub struct SeenItems {
    sources: RwLock<HashMap<String, SourceLedger>>,
}

impl SeenItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `item_id` for `source_id`; returns true when the item is new to a
    /// primed source
    pub async fn observe(&self, source_id: &str, item_id: &str) -> bool {
        let mut sources = self.sources.write().await;
        let ledger = sources.entry(source_id.to_string()).or_default();
        ledger.observed = true;
        let generation = ledger.generation;
        let previous = ledger.seen.insert(item_id.to_string(), generation);
        previous.is_none() && ledger.primed
    }

    /// Close a successful fetch of `source_id`: prime it and age out ids the
    /// feed no longer carries
    ///
    /// A fetch that observed nothing (not modified, or empty) ages nothing.
    pub async fn settle(&self, source_id: &str) {
        let mut sources = self.sources.write().await;
        let ledger = sources.entry(source_id.to_string()).or_default();
        ledger.primed = true;
        if !ledger.observed {
            return;
        }

        ledger.observed = false;
        let oldest = (ledger.generation + 1).saturating_sub(RETAINED_FETCHES);
        ledger.seen.retain(|_, seen_in| *seen_in >= oldest);
        ledger.generation += 1;
    }

    /// Drop the ledgers of sources that no longer exist
    pub async fn retain_sources(&self, active: &HashSet<&str>) -> usize {
        let mut sources = self.sources.write().await;
        let before = sources.len();
        sources.retain(|id, _| active.contains(id.as_str()));
        before - sources.len()
    }

    pub async fn is_primed(&self, source_id: &str) -> bool {
        self.sources
            .read()
            .await
            .get(source_id)
            .is_some_and(|l| l.primed)
    }

    /// Number of ids remembered for `source_id`
    pub async fn len(&self, source_id: &str) -> usize {
        self.sources
            .read()
            .await
            .get(source_id)
            .map_or(0, |l| l.seen.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_fetch_seeds_only() {
        let seen = SeenItems::new();
        assert!(!seen.observe("s", "a").await);
        seen.settle("s").await;
        assert!(!seen.observe("s", "a").await);
        assert!(seen.observe("s", "b").await);
        assert!(!seen.observe("s", "b").await);
    }

    #[tokio::test]
    async fn test_sources_are_independent() {
        let seen = SeenItems::new();
        seen.settle("s1").await;
        assert!(seen.observe("s1", "x").await);
        assert!(!seen.observe("s2", "x").await);
        assert!(!seen.is_primed("s2").await);
    }

    #[tokio::test]
    async fn test_sliding_window_stays_bounded() {
        let seen = SeenItems::new();
        let window = 10;

        for fetch in 0..1000usize {
            let mut fresh = 0;
            for offset in 0..window {
                if seen.observe("s", &format!("item-{}", fetch + offset)).await {
                    fresh += 1;
                }
            }
            seen.settle("s").await;

            if fetch > 0 {
                // one item slides in per fetch
                assert_eq!(fresh, 1);
            }
            assert!(seen.len("s").await <= window + RETAINED_FETCHES as usize);
        }
    }

    #[tokio::test]
    async fn test_recent_ids_survive_aging() {
        let seen = SeenItems::new();
        seen.observe("s", "old").await;
        seen.settle("s").await;

        // "old" leaves the feed but is still inside the retained window
        for _ in 0..RETAINED_FETCHES - 1 {
            seen.observe("s", "current").await;
            seen.settle("s").await;
        }
        assert!(!seen.observe("s", "old").await);
    }

    #[tokio::test]
    async fn test_empty_fetches_age_nothing() {
        let seen = SeenItems::new();
        seen.observe("s", "a").await;
        seen.settle("s").await;
        for _ in 0..10 {
            seen.settle("s").await;
        }
        assert_eq!(seen.len("s").await, 1);
        assert!(!seen.observe("s", "a").await);
    }

    #[tokio::test]
    async fn test_retain_sources_drops_removed() {
        let seen = SeenItems::new();
        seen.observe("kept", "x").await;
        seen.observe("gone", "y").await;

        let dropped = seen.retain_sources(&HashSet::from(["kept"])).await;
        assert_eq!(dropped, 1);
        assert_eq!(seen.len("kept").await, 1);
        assert_eq!(seen.len("gone").await, 0);
    }
}
