//! feedcycle - Sharded feed retrieval cycle engine
//!
//! Periodically fetches every subscribed feed of a shard, deduplicating URLs
//! shared by many sources, circuit-breaking URLs that keep failing and
//! emitting new items to downstream delivery.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`schedule`] - Cadences, cycles, batching and the worker pool
//! - [`fetch`] - Conditional feed fetching and item filtering
//! - [`cache`] - Per-URL conditional request headers
//! - [`failcounter`] - Per-URL failure circuit breaker
//! - [`maintenance`] - Permission checks and feed limits
//! - [`stats`] - Per-shard cycle statistics
//! - [`storage`] - Data store contract (SQLite, in-memory)
//! - [`metrics`] - Prometheus metrics
//! - [`models`] - Core data structures and types
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedcycle::config::Config;
//! use feedcycle::schedule::{ScheduleContext, ScheduleManager};
//! use feedcycle::storage::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteStore::new(&config.database.sqlite_path)?);
//!     let manager = ScheduleManager::new(ScheduleContext::new(&config, store)?)?;
//!     manager.start().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod failcounter;
pub mod fetch;
pub mod maintenance;
pub mod metrics;
pub mod models;
pub mod schedule;
pub mod stats;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::failcounter::{FailCounter, FailCounterRegistry};
    pub use crate::fetch::{Fetcher, HttpFetcher};
    pub use crate::models::{DiscoveredItem, FeedItem, ScheduleDef, Source};
    pub use crate::schedule::{FeedSchedule, ScheduleContext, ScheduleEvent, ScheduleManager};
    pub use crate::stats::ShardStats;
    pub use crate::storage::{DataStore, MemoryStore, SqliteStore};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
