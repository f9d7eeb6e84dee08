//! Per-shard cycle statistics
//!
//! After every cycle the controller hands its totals to the [`StatsSink`],
//! which folds them into the shard's [`ShardStats`] row. Cycle time and
//! failure count are smoothed as the average of the previous and the newest
//! value; feed and URL counts always take the newest value.
//!
//! A failed write is logged and dropped. It never delays or fails a cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::storage::DataStore;
use crate::utils::round2;

/// Persisted statistics of one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStats {
    pub id: String,
    /// Number of sources folded into the last cycle
    pub feeds: usize,
    /// Smoothed cycle time in seconds
    pub cycle_time: f64,
    /// Smoothed failed-unit count
    pub cycle_fails: f64,
    /// Fetch units resolved in the last cycle
    pub cycle_urls: usize,
    pub last_updated: DateTime<Utc>,
}

/// Totals of one finished cycle
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CycleTotals {
    pub feeds: usize,
    pub cycle_time_secs: f64,
    pub fails: usize,
    pub urls: usize,
}

impl ShardStats {
    /// First row of a shard
    pub fn from_totals(id: impl Into<String>, totals: &CycleTotals) -> Self {
        Self {
            id: id.into(),
            feeds: totals.feeds,
            cycle_time: round2(totals.cycle_time_secs),
            cycle_fails: totals.fails as f64,
            cycle_urls: totals.urls,
            last_updated: Utc::now(),
        }
    }

    /// Fold a new cycle into an existing row
    pub fn merge(&mut self, totals: &CycleTotals) {
        self.feeds = totals.feeds;
        self.cycle_time = round2((totals.cycle_time_secs + self.cycle_time) / 2.0);
        self.cycle_fails = round2((totals.fails as f64 + self.cycle_fails) / 2.0);
        self.cycle_urls = totals.urls;
        self.last_updated = Utc::now();
    }
}

/// Smooths and persists shard statistics
#[derive(Clone)]
pub struct StatsSink {
    store: Arc<dyn DataStore>,
}

impl StatsSink {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Fold `totals` into the shard row, returning the stored row
    pub async fn try_record(&self, shard_id: &str, totals: &CycleTotals) -> Result<ShardStats> {
        let stats = match self.store.shard_stats(shard_id).await? {
            Some(mut existing) => {
                existing.merge(totals);
                existing
            }
            None => ShardStats::from_totals(shard_id, totals),
        };
        self.store.save_shard_stats(&stats).await?;
        Ok(stats)
    }

    /// Like [`try_record`](Self::try_record) but never fails
    pub async fn record(&self, shard_id: &str, totals: &CycleTotals) -> Option<ShardStats> {
        match self.try_record(shard_id, totals).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(shard = %shard_id, error = %e, "Unable to update statistics after cycle");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn totals(time: f64, fails: usize) -> CycleTotals {
        CycleTotals {
            feeds: 10,
            cycle_time_secs: time,
            fails,
            urls: 7,
        }
    }

    #[tokio::test]
    async fn test_first_record_creates_row() {
        let store = Arc::new(MemoryStore::new());
        let sink = StatsSink::new(store.clone());
        let stats = sink.record("0", &totals(3.456, 2)).await.unwrap();
        assert_eq!(stats.cycle_time, 3.46);
        assert_eq!(stats.cycle_fails, 2.0);
        assert_eq!(stats.cycle_urls, 7);
        assert!(store.shard_stats("0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_running_average() {
        let store = Arc::new(MemoryStore::new());
        let sink = StatsSink::new(store);
        sink.record("0", &totals(4.0, 2)).await.unwrap();
        let stats = sink.record("0", &totals(2.0, 5)).await.unwrap();
        assert_eq!(stats.cycle_time, 3.0);
        assert_eq!(stats.cycle_fails, 3.5);
        assert_eq!(stats.feeds, 10);
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_stats_writes(true).await;
        let sink = StatsSink::new(store.clone());
        assert!(sink.record("0", &totals(1.0, 0)).await.is_none());
        assert!(store.shard_stats("0").await.unwrap().is_none());
    }
}
