//! Cycle scheduling
//!
//! Each named cadence is driven by one [`FeedSchedule`]. A cycle reads a
//! snapshot of the store, folds the cadence's sources into deduplicated
//! per-URL source lists, slices them into batches and runs the batches on a
//! [`WorkerPool`], either in process or in isolated worker processes.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     ScheduleManager                        │
//! │      one interval timer per cadence (default, ...)         │
//! └─────────────────────────────┬──────────────────────────────┘
//!                               │ start_cycle
//!                               ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                       FeedSchedule                         │
//! │  snapshot ─► cadence ─► aggregator ─► batcher ─► pool      │
//! │                                                  │         │
//! │   fail counters ◄── unit outcomes ◄──────────────┘         │
//! │   stats, events ◄── cycle finished                         │
//! └─────────────────────────────┬──────────────────────────────┘
//!                               │ NDJSON over stdio
//!              ┌────────────────┼────────────────┐
//!              ▼                ▼                ▼
//!         ┌────────┐       ┌────────┐       ┌────────┐
//!         │ worker │       │ worker │       │ worker │
//!         └────────┘       └────────┘       └────────┘
//! ```
//!
//! # Modules
//!
//! - [`cadence`] - Source to cadence resolution
//! - [`aggregator`] - Source lists and the custom-settings lane
//! - [`batcher`] - Fixed-capacity batches
//! - [`worker`] - Dispatch payload and report protocol
//! - [`pool`] - In-process and isolated batch execution
//! - [`controller`] - Cycle lifecycle and stuck-cycle recovery
//! - [`manager`] - Timers
//! - [`events`] - Outbound events

pub mod aggregator;
pub mod batcher;
pub mod cadence;
pub mod controller;
pub mod error;
pub mod events;
pub mod manager;
pub mod pool;
pub mod worker;

pub use aggregator::{aggregate, Aggregation, AggregatorContext, DeliveryIndex};
pub use batcher::{plan_batches, Batch, BatchPlan, FetchUnit, Lane};
pub use cadence::{CadenceResolver, DefaultCadenceResolver};
pub use controller::{CycleTicket, FeedSchedule, ScheduleContext, UNRESPONSIVE_REASON};
pub use error::{ScheduleError, ScheduleResult};
pub use events::{CycleSummary, EventBus, ScheduleEvent};
pub use manager::ScheduleManager;
pub use pool::{
    PoolMode, ProcessLauncher, TaskLauncher, UnitEvent, UnitOutcome, WorkerLauncher, WorkerPool,
    WorkerSet, WORKER_EXITED,
};
pub use worker::{DispatchPayload, WorkerReport};
