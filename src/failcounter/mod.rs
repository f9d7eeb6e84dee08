//! Per-URL failure circuit breaker
//!
//! Every feed URL that fails to fetch gets a [`FailCounter`]. Once the count
//! reaches the configured limit the URL is considered failed and is left out of
//! every following cycle until the counter is reset, either by a successful
//! fetch or by an operator. The circuit is per URL, not per source: all sources
//! sharing a URL share its counter.
//!
//! A limit of `0` disables circuit breaking entirely.
//!
//! The registry is the in-process view; every mutation is written through to
//! the [`DataStore`] so that other shards and the CLI observe it. Each local
//! mutation advances an epoch. A reload from a store snapshot leaves alone any
//! URL mutated after the snapshot's epoch, so a slow snapshot read never
//! resurrects a counter another schedule just reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::storage::DataStore;

/// Failure tally of one URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailCounter {
    pub url: String,
    pub count: u32,
    #[serde(default)]
    pub reason: Option<String>,
    /// When the counter first reached the limit
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl FailCounter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            count: 0,
            reason: None,
            failed_at: None,
        }
    }

    /// True iff the limit is enabled and the count has reached it
    pub fn has_failed(&self, limit: u32) -> bool {
        limit > 0 && self.count >= limit
    }

    /// Apply one failure observation. Returns whether anything changed.
    fn observe(&mut self, reason: Option<&str>, limit: u32) -> bool {
        if self.has_failed(limit) {
            // Pinned at the limit once tripped; only the reason may move.
            let mut changed = false;
            if self.count != limit {
                self.count = limit;
                changed = true;
            }
            if let Some(reason) = reason {
                if self.reason.as_deref() != Some(reason) {
                    self.reason = Some(reason.to_string());
                    changed = true;
                }
            }
            if self.failed_at.is_none() {
                self.failed_at = Some(Utc::now());
                changed = true;
            }
            return changed;
        }

        self.count += 1;
        if let Some(reason) = reason {
            self.reason = Some(reason.to_string());
        }
        if self.has_failed(limit) && self.failed_at.is_none() {
            self.failed_at = Some(Utc::now());
        }
        true
    }
}

#[derive(Default)]
struct Counters {
    by_url: HashMap<String, FailCounter>,
    /// Epoch of the last local mutation per URL
    touched: HashMap<String, u64>,
    epoch: u64,
}

impl Counters {
    fn touch(&mut self, url: &str) {
        self.epoch += 1;
        self.touched.insert(url.to_string(), self.epoch);
    }
}

/// Shared registry of fail counters keyed by URL
pub struct FailCounterRegistry {
    limit: u32,
    counters: RwLock<Counters>,
    store: Arc<dyn DataStore>,
}

impl FailCounterRegistry {
    /// Create an empty registry writing through to `store`
    pub fn new(limit: u32, store: Arc<dyn DataStore>) -> Self {
        Self {
            limit,
            counters: RwLock::new(Counters::default()),
            store,
        }
    }

    /// Configured trip limit
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Current mutation epoch; read it before taking a store snapshot
    pub async fn epoch(&self) -> u64 {
        self.counters.read().await.epoch
    }

    /// Refresh the in-process view from a store snapshot taken at `since`
    ///
    /// URLs mutated locally after `since` keep their in-process state.
    pub async fn load(&self, counters: Vec<FailCounter>, since: u64) {
        let mut guard = self.counters.write().await;
        let state = &mut *guard;
        let touched = &state.touched;
        let fresh = |url: &str| touched.get(url).map_or(true, |at| *at <= since);

        let mut loaded: HashMap<String, FailCounter> = counters
            .into_iter()
            .map(|c| (c.url.clone(), c))
            .collect();
        let mut by_url = HashMap::with_capacity(loaded.len());
        for (url, counter) in state.by_url.drain() {
            if !fresh(&url) {
                loaded.remove(&url);
                by_url.insert(url, counter);
            }
        }
        for (url, counter) in loaded {
            if fresh(&url) {
                by_url.insert(url, counter);
            }
        }
        state.by_url = by_url;
    }

    /// Record one failure of `url`
    pub async fn increment(&self, url: &str, reason: Option<&str>) -> Result<FailCounter> {
        let (counter, changed, tripped_now) = {
            let mut state = self.counters.write().await;
            state.touch(url);
            let counter = state
                .by_url
                .entry(url.to_string())
                .or_insert_with(|| FailCounter::new(url));
            let was_failed = counter.has_failed(self.limit);
            let changed = counter.observe(reason, self.limit);
            let tripped_now = !was_failed && counter.has_failed(self.limit);
            (counter.clone(), changed, tripped_now)
        };

        if tripped_now {
            tracing::warn!(
                url = %url,
                count = counter.count,
                reason = ?counter.reason,
                "URL reached the failure limit and will be skipped until reset"
            );
        }

        if changed {
            self.store.save_fail_counter(&counter).await?;
        }
        Ok(counter)
    }

    /// Forget every failure of `url`
    pub async fn reset(&self, url: &str) -> Result<()> {
        let removed = {
            let mut state = self.counters.write().await;
            state.touch(url);
            state.by_url.remove(url)
        };
        if removed.is_some() {
            self.store.delete_fail_counter(url).await?;
        }
        Ok(())
    }

    /// Whether `url` is currently circuit-broken
    pub async fn has_failed(&self, url: &str) -> bool {
        if self.limit == 0 {
            return false;
        }
        self.counters
            .read()
            .await
            .by_url
            .get(url)
            .is_some_and(|c| c.has_failed(self.limit))
    }

    /// Counter of `url`, if any
    pub async fn get(&self, url: &str) -> Option<FailCounter> {
        self.counters.read().await.by_url.get(url).cloned()
    }

    /// All counters, ordered by URL
    pub async fn get_all(&self) -> Vec<FailCounter> {
        let mut all: Vec<FailCounter> = self
            .counters
            .read()
            .await
            .by_url
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.url.cmp(&b.url));
        all
    }
}
