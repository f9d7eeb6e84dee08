//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use feedcycle::config::Config;
use feedcycle::failcounter::FailCounter;
use feedcycle::fetch::{FetchRequest, FetchResponse, Fetcher};
use feedcycle::models::{FeedItem, Source};
use feedcycle::schedule::{ScheduleContext, TaskLauncher};
use feedcycle::stats::ShardStats;
use feedcycle::storage::{DataStore, MemoryStore, Snapshot};
use feedcycle::utils::error::FetchError;

/// Fetcher driven by per-URL scripts
#[derive(Default)]
pub struct ScriptedFetcher {
    items: Mutex<HashMap<String, Vec<FeedItem>>>,
    failing: Mutex<HashMap<String, u16>>,
    hang_once: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_items(&self, url: &str, items: Vec<FeedItem>) {
        self.items.lock().unwrap().insert(url.to_string(), items);
    }

    /// Answer `url` with the given status until `recover`
    pub fn fail(&self, url: &str, status: u16) {
        self.failing.lock().unwrap().insert(url.to_string(), status);
    }

    pub fn recover(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    /// Never answer the next fetch of `url`
    pub fn hang_once(&self, url: &str) {
        self.hang_once.lock().unwrap().insert(url.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.calls.lock().unwrap().push(request.url.clone());

        let hang = self.hang_once.lock().unwrap().remove(&request.url);
        if hang {
            return std::future::pending().await;
        }

        let status = self.failing.lock().unwrap().get(&request.url).copied();
        if let Some(status) = status {
            return Err(FetchError::BadStatus(status));
        }

        let items = self
            .items
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_default();
        Ok(FetchResponse {
            items,
            ..Default::default()
        })
    }
}

/// Memory store whose next snapshot read parks until released
pub struct GatedStore {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            released: Notify::new(),
        })
    }

    /// Park the next `load_snapshot` after it has read the data
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until the parked read has taken its snapshot
    pub async fn parked(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl DataStore for GatedStore {
    async fn load_snapshot(&self) -> feedcycle::Result<Snapshot> {
        let snapshot = self.inner.load_snapshot().await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.released.notified().await;
        }
        Ok(snapshot)
    }

    async fn fail_counters(&self) -> feedcycle::Result<Vec<FailCounter>> {
        self.inner.fail_counters().await
    }

    async fn save_fail_counter(&self, counter: &FailCounter) -> feedcycle::Result<()> {
        self.inner.save_fail_counter(counter).await
    }

    async fn delete_fail_counter(&self, url: &str) -> feedcycle::Result<()> {
        self.inner.delete_fail_counter(url).await
    }

    async fn set_source_disabled(
        &self,
        source_id: &str,
        reason: Option<&str>,
    ) -> feedcycle::Result<()> {
        self.inner.set_source_disabled(source_id, reason).await
    }

    async fn shard_stats(&self, shard_id: &str) -> feedcycle::Result<Option<ShardStats>> {
        self.inner.shard_stats(shard_id).await
    }

    async fn all_shard_stats(&self) -> feedcycle::Result<Vec<ShardStats>> {
        self.inner.all_shard_stats().await
    }

    async fn save_shard_stats(&self, stats: &ShardStats) -> feedcycle::Result<()> {
        self.inner.save_shard_stats(stats).await
    }
}

pub fn item(id: &str, title: &str) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        title: title.to_string(),
        ..Default::default()
    }
}

pub fn source(id: &str, url: &str) -> Source {
    Source::new(id, url, "guild", "channel")
}

/// Config for in-process cycles without inter-batch delay
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.scheduler.batch_delay_ms = 0;
    config.scheduler.batch_size = 2;
    config
}

/// Context over a memory store; the scripted fetcher serves both pool modes
pub fn context(
    config: &Config,
    store: Arc<MemoryStore>,
    fetcher: Arc<ScriptedFetcher>,
) -> ScheduleContext {
    let (ctx, _) = context_with_launcher(config, store, fetcher);
    ctx
}

/// Like [`context`], over any store, also returning the task launcher
pub fn context_with_launcher(
    config: &Config,
    store: Arc<dyn DataStore>,
    fetcher: Arc<ScriptedFetcher>,
) -> (ScheduleContext, Arc<TaskLauncher>) {
    let launcher = Arc::new(TaskLauncher::new(fetcher.clone()));
    let ctx = ScheduleContext::new(config, store)
        .unwrap()
        .with_fetcher(fetcher)
        .with_launcher(launcher.clone());
    (ctx, launcher)
}
