//! In-memory data store
//!
//! Backs tests and dry runs. Everything lives behind a single lock so a
//! snapshot is always coherent.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{DataStore, Snapshot, Supporter};
use crate::error::{Error, Result};
use crate::failcounter::FailCounter;
use crate::models::{FilteredFormat, Format, Profile, ScheduleDef, Source, Subscriber};
use crate::stats::ShardStats;

#[derive(Default)]
struct MemoryState {
    sources: Vec<Source>,
    formats: BTreeMap<String, Format>,
    filtered_formats: Vec<FilteredFormat>,
    subscribers: Vec<Subscriber>,
    profiles: BTreeMap<String, Profile>,
    fail_counters: BTreeMap<String, FailCounter>,
    schedules: Vec<ScheduleDef>,
    supporters: BTreeMap<String, Supporter>,
    shard_stats: BTreeMap<String, ShardStats>,
    fail_stats_writes: bool,
    stats_writes: usize,
}

/// Data store kept entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a source, keeping first-insertion order
    pub async fn upsert_source(&self, source: Source) {
        let mut state = self.state.write().await;
        match state.sources.iter_mut().find(|s| s.id == source.id) {
            Some(existing) => *existing = source,
            None => state.sources.push(source),
        }
    }

    pub async fn upsert_format(&self, format: Format) {
        self.state.write().await.formats.insert(format.feed.clone(), format);
    }

    pub async fn add_filtered_format(&self, format: FilteredFormat) {
        self.state.write().await.filtered_formats.push(format);
    }

    pub async fn add_subscriber(&self, subscriber: Subscriber) {
        self.state.write().await.subscribers.push(subscriber);
    }

    pub async fn upsert_profile(&self, profile: Profile) {
        self.state.write().await.profiles.insert(profile.id.clone(), profile);
    }

    pub async fn set_schedules(&self, schedules: Vec<ScheduleDef>) {
        self.state.write().await.schedules = schedules;
    }

    pub async fn upsert_supporter(&self, supporter: Supporter) {
        self.state
            .write()
            .await
            .supporters
            .insert(supporter.guild.clone(), supporter);
    }

    /// Current copy of a source
    pub async fn source(&self, id: &str) -> Option<Source> {
        self.state
            .read()
            .await
            .sources
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Make every statistics write fail
    pub async fn fail_stats_writes(&self, fail: bool) {
        self.state.write().await.fail_stats_writes = fail;
    }

    /// Number of successful statistics writes
    pub async fn stats_writes(&self) -> usize {
        self.state.read().await.stats_writes
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn load_snapshot(&self) -> Result<Snapshot> {
        let state = self.state.read().await;
        Ok(Snapshot {
            sources: state.sources.clone(),
            formats: state.formats.values().cloned().collect(),
            filtered_formats: state.filtered_formats.clone(),
            subscribers: state.subscribers.clone(),
            profiles: state.profiles.values().cloned().collect(),
            fail_counters: state.fail_counters.values().cloned().collect(),
            schedules: state.schedules.clone(),
            supporters: state.supporters.values().cloned().collect(),
        })
    }

    async fn fail_counters(&self) -> Result<Vec<FailCounter>> {
        Ok(self.state.read().await.fail_counters.values().cloned().collect())
    }

    async fn save_fail_counter(&self, counter: &FailCounter) -> Result<()> {
        self.state
            .write()
            .await
            .fail_counters
            .insert(counter.url.clone(), counter.clone());
        Ok(())
    }

    async fn delete_fail_counter(&self, url: &str) -> Result<()> {
        self.state.write().await.fail_counters.remove(url);
        Ok(())
    }

    async fn set_source_disabled(&self, source_id: &str, reason: Option<&str>) -> Result<()> {
        let mut state = self.state.write().await;
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == source_id)
            .ok_or_else(|| Error::other(format!("Unknown source {source_id}")))?;
        source.disabled = reason.map(str::to_string);
        Ok(())
    }

    async fn shard_stats(&self, shard_id: &str) -> Result<Option<ShardStats>> {
        Ok(self.state.read().await.shard_stats.get(shard_id).cloned())
    }

    async fn all_shard_stats(&self) -> Result<Vec<ShardStats>> {
        Ok(self.state.read().await.shard_stats.values().cloned().collect())
    }

    async fn save_shard_stats(&self, stats: &ShardStats) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_stats_writes {
            return Err(Error::other("statistics store unavailable"));
        }
        state.stats_writes += 1;
        state.shard_stats.insert(stats.id.clone(), stats.clone());
        Ok(())
    }
}
