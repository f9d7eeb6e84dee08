//! Data store contract and implementations
//!
//! The engine reads everything it needs for a cycle through one bulk
//! [`DataStore::load_snapshot`] call and writes back only fail counters,
//! source enable/disable status and shard statistics.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            FeedSchedule / registries          │
//! └──────────────────────────────────────────────┘
//!                        │
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │               DataStore trait                 │
//! └──────────────────────────────────────────────┘
//!             │                        │
//!             ▼                        ▼
//!   ┌──────────────────┐     ┌──────────────────┐
//!   │   SqliteStore    │     │   MemoryStore    │
//!   └──────────────────┘     └──────────────────┘
//! ```

pub mod memory;
pub mod repository;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::failcounter::FailCounter;
use crate::models::{FilteredFormat, Format, Profile, ScheduleDef, Source, Subscriber};
use crate::stats::ShardStats;

pub use memory::MemoryStore;
pub use repository::SqliteStore;

/// Elevated-tenant grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supporter {
    pub guild: String,
    pub webhook: bool,
    /// Feed limit override for the guild
    pub max_feeds: Option<usize>,
}

/// Coherent read of everything a cycle depends on
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub sources: Vec<Source>,
    pub formats: Vec<Format>,
    pub filtered_formats: Vec<FilteredFormat>,
    pub subscribers: Vec<Subscriber>,
    pub profiles: Vec<Profile>,
    pub fail_counters: Vec<FailCounter>,
    pub schedules: Vec<ScheduleDef>,
    pub supporters: Vec<Supporter>,
}

impl Snapshot {
    /// Guilds of elevated tenants
    pub fn supporter_guilds(&self) -> HashSet<String> {
        self.supporters.iter().map(|s| s.guild.clone()).collect()
    }

    /// Guilds allowed to deliver through webhooks
    pub fn webhook_guilds(&self) -> HashSet<String> {
        self.supporters
            .iter()
            .filter(|s| s.webhook)
            .map(|s| s.guild.clone())
            .collect()
    }

    /// Feed limit overrides per guild
    pub fn guild_limits(&self) -> HashMap<String, usize> {
        self.supporters
            .iter()
            .filter_map(|s| s.max_feeds.map(|max| (s.guild.clone(), max)))
            .collect()
    }
}

/// Persistence collaborator of the engine
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Read sources, formats, recipients, profiles, fail counters, cadences and
    /// tenant capabilities in one go
    async fn load_snapshot(&self) -> Result<Snapshot>;

    /// All stored fail counters
    async fn fail_counters(&self) -> Result<Vec<FailCounter>>;

    /// Insert or replace a fail counter
    async fn save_fail_counter(&self, counter: &FailCounter) -> Result<()>;

    /// Delete the fail counter of `url`, if any
    async fn delete_fail_counter(&self, url: &str) -> Result<()>;

    /// Set (`Some`) or clear (`None`) the disabled reason of a source
    async fn set_source_disabled(&self, source_id: &str, reason: Option<&str>) -> Result<()>;

    /// Statistics row of a shard
    async fn shard_stats(&self, shard_id: &str) -> Result<Option<ShardStats>>;

    /// Every statistics row
    async fn all_shard_stats(&self) -> Result<Vec<ShardStats>>;

    /// Insert or replace a statistics row
    async fn save_shard_stats(&self, stats: &ShardStats) -> Result<()>;
}
