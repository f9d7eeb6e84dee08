//! Outbound schedule events
//!
//! Every controller publishes on one broadcast bus. Subscribers that fall
//! behind lose the oldest events; emission never blocks a cycle.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::DiscoveredItem;
use crate::stats::ShardStats;

/// Summary of one finished cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub schedule: String,
    pub shard_id: u32,
    /// Run counter of the controller when the cycle started
    pub run: u64,
    /// Sources folded into the cycle
    pub feeds: usize,
    /// Fetch units that reported a terminal outcome
    pub urls: usize,
    pub fails: usize,
    pub elapsed_secs: f64,
    /// Finished without dispatching anything
    pub no_sources: bool,
    /// Statistics row written for the cycle, if the write succeeded
    pub stats: Option<ShardStats>,
}

/// Events published by schedule controllers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleEvent {
    /// A new item for one source
    ItemDiscovered(DiscoveredItem),

    /// Every outcome of a cycle is resolved
    CycleFinished(CycleSummary),

    /// Sent once per cycle start for an external supervisor
    Liveness {
        schedule: String,
        shard_id: u32,
        refresh_rate_minutes: u32,
    },
}

/// Broadcast bus shared by all controllers
#[derive(Debug, Clone)]
pub struct EventBus {
    event_tx: broadcast::Sender<ScheduleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    /// Subscribe to schedule events
    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.event_tx.subscribe()
    }

    /// Publish an event; returns the number of receivers reached
    pub fn emit(&self, event: ScheduleEvent) -> usize {
        // No subscribers is not an error
        self.event_tx.send(event).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
