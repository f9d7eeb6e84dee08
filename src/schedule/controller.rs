//! Cycle controller of one named cadence
//!
//! A [`FeedSchedule`] is idle or running. Starting a cycle while the previous
//! one is still running recovers first:
//!
//! - in-process pools are only marked idle; the old cycle keeps running but
//!   can no longer touch the new cycle's counters
//! - isolated pools penalize every URL still pending, kill every tracked
//!   worker and abort the old cycle
//!
//! A cycle then reads one coherent snapshot, keeps the sources whose cadence
//! resolves to this schedule, aggregates and batches them, and hands the
//! batches to the [`WorkerPool`]. Per-unit outcomes update the fail counters,
//! the pending map and the cycle totals; the cycle finishes once every unit
//! is terminal.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};

use super::aggregator::{aggregate, AggregatorContext, DeliveryIndex};
use super::batcher::{plan_batches, BatchPlan};
use super::cadence::{CadenceResolver, DefaultCadenceResolver};
use super::error::{ScheduleError, ScheduleResult};
use super::events::{CycleSummary, EventBus, ScheduleEvent};
use super::pool::{
    DispatchContext, PoolMode, ProcessLauncher, UnitEvent, UnitOutcome, WorkerLauncher,
    WorkerPool, WorkerSet,
};
use crate::cache::HeaderCache;
use crate::config::{Config, FetcherConfig, SchedulerConfig};
use crate::failcounter::FailCounterRegistry;
use crate::fetch::{Fetcher, HttpFetcher, SeenItems};
use crate::maintenance::{
    enforce_limits, ChannelPermissionChecker, PermissionChecker, StaticDirectory, TenantDirectory,
};
use crate::metrics;
use crate::models::{DiscoveredItem, ScheduleDef, DEFAULT_SCHEDULE, SUPPORTER_SCHEDULE};
use crate::stats::{CycleTotals, StatsSink};
use crate::storage::DataStore;
use crate::utils::summarize_links;

/// Reason recorded for URLs still pending when their cycle is recovered
pub const UNRESPONSIVE_REASON: &str = "Failed to respond in a timely manner";

/// Collaborators shared by every controller of a process
#[derive(Clone)]
pub struct ScheduleContext {
    pub config: SchedulerConfig,
    pub fetcher_config: FetcherConfig,
    /// Cadences used when the store defines none
    pub schedules: Vec<ScheduleDef>,
    pub store: Arc<dyn DataStore>,
    pub fail_counters: Arc<FailCounterRegistry>,
    pub headers: Arc<HeaderCache>,
    pub seen: Arc<SeenItems>,
    pub stats: StatsSink,
    pub directory: Arc<dyn TenantDirectory>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub cadence: Arc<dyn CadenceResolver>,
    pub fetcher: Arc<dyn Fetcher>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub events: EventBus,
}

impl ScheduleContext {
    /// Production context: HTTP fetcher, process workers and an open tenant
    /// directory
    pub fn new(config: &Config, store: Arc<dyn DataStore>) -> crate::Result<Self> {
        let scheduler = config.scheduler.clone();
        let directory: Arc<dyn TenantDirectory> = Arc::new(StaticDirectory::open());
        let launcher = match &scheduler.worker_program {
            Some(program) => ProcessLauncher::new(program),
            None => ProcessLauncher::current_exe()?,
        };

        Ok(Self {
            fetcher_config: config.fetcher.clone(),
            schedules: config.schedules_or_default(),
            fail_counters: Arc::new(FailCounterRegistry::new(scheduler.fail_limit, store.clone())),
            headers: Arc::new(HeaderCache::new()),
            seen: Arc::new(SeenItems::new()),
            stats: StatsSink::new(store.clone()),
            permissions: Arc::new(ChannelPermissionChecker::new(directory.clone(), store.clone())),
            directory,
            cadence: Arc::new(DefaultCadenceResolver::new(scheduler.supporters_enabled)),
            fetcher: Arc::new(HttpFetcher::new(&config.fetcher)?),
            launcher: Arc::new(launcher),
            events: EventBus::new(scheduler.event_capacity),
            config: scheduler,
            store,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Replace the tenant directory; the permission checker is rebuilt on it
    pub fn with_directory(mut self, directory: Arc<dyn TenantDirectory>) -> Self {
        self.permissions = Arc::new(ChannelPermissionChecker::new(
            directory.clone(),
            self.store.clone(),
        ));
        self.directory = directory;
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_cadence(mut self, cadence: Arc<dyn CadenceResolver>) -> Self {
        self.cadence = cadence;
        self
    }
}

/// Handle on a started cycle
pub struct CycleTicket {
    schedule: String,
    inner: TicketInner,
}

enum TicketInner {
    Finished(Option<CycleSummary>),
    Running(JoinHandle<Option<CycleSummary>>),
}

impl CycleTicket {
    pub fn is_finished(&self) -> bool {
        match &self.inner {
            TicketInner::Finished(_) => true,
            TicketInner::Running(handle) => handle.is_finished(),
        }
    }

    /// Wait for the cycle to finish
    ///
    /// # Errors
    ///
    /// `CycleAborted` when the cycle was superseded by a later one
    pub async fn wait(self) -> ScheduleResult<CycleSummary> {
        let summary = match self.inner {
            TicketInner::Finished(summary) => summary,
            TicketInner::Running(handle) => handle.await.ok().flatten(),
        };
        summary.ok_or(ScheduleError::CycleAborted {
            name: self.schedule,
        })
    }
}

struct CycleTracker {
    id: u64,
    run: u64,
    started: Instant,
    feeds: usize,
    total: usize,
    fails: usize,
    pending: BTreeMap<String, u32>,
    workers: Arc<WorkerSet>,
    driver: Option<AbortHandle>,
}

#[derive(Default)]
struct ScheduleState {
    running: bool,
    run: u64,
    next_cycle: u64,
    cycle: Option<CycleTracker>,
}

/// Controller of one named cadence
pub struct FeedSchedule {
    def: ScheduleDef,
    ctx: ScheduleContext,
    pool: WorkerPool,
    debug_feeds: HashSet<String>,
    state: Mutex<ScheduleState>,
}

impl FeedSchedule {
    /// Create a controller for `def`
    ///
    /// # Errors
    ///
    /// `InvalidSchedule` when the refresh rate is zero, or when a schedule
    /// other than `default`/`supporter` has neither keywords nor feeds
    pub fn new(def: ScheduleDef, ctx: ScheduleContext) -> ScheduleResult<Self> {
        if def.refresh_rate_minutes == 0 {
            return Err(ScheduleError::invalid_schedule(
                &def.name,
                "no refresh rate has been declared",
            ));
        }
        if def.name != DEFAULT_SCHEDULE
            && def.name != SUPPORTER_SCHEDULE
            && def.keywords.is_empty()
            && def.feeds.is_empty()
        {
            return Err(ScheduleError::invalid_schedule(
                &def.name,
                "a non-default schedule needs keywords or feeds",
            ));
        }

        let mode = if ctx.config.fork_batches {
            PoolMode::Isolated {
                width: ctx.config.parallel_batches,
                launcher: ctx.launcher.clone(),
            }
        } else {
            PoolMode::InProcess {
                batch_delay: Duration::from_millis(ctx.config.batch_delay_ms),
            }
        };
        let pool = WorkerPool::new(mode, ctx.fetcher.clone(), ctx.headers.clone());
        let debug_feeds = ctx.config.debug_feeds.iter().cloned().collect();

        Ok(Self {
            def,
            ctx,
            pool,
            debug_feeds,
            state: Mutex::new(ScheduleState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &ScheduleDef {
        &self.def
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.def.refresh_rate_minutes) * 60)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ScheduleEvent> {
        self.ctx.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Number of finished cycles
    pub async fn run_count(&self) -> u64 {
        self.state.lock().await.run
    }

    /// Workers tracked by the current cycle
    pub async fn live_workers(&self) -> usize {
        let workers = self
            .state
            .lock()
            .await
            .cycle
            .as_ref()
            .map(|c| c.workers.clone());
        match workers {
            Some(workers) => workers.len().await,
            None => 0,
        }
    }

    /// URLs of the current cycle still awaiting a terminal outcome
    pub async fn pending_links(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .cycle
            .as_ref()
            .map(|c| {
                c.pending
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(url, _)| url.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run one cycle to completion
    pub async fn run_cycle(self: &Arc<Self>) -> ScheduleResult<CycleSummary> {
        self.start_cycle().await?.wait().await
    }

    /// Start a cycle, recovering a previous one that is still running
    ///
    /// Returns once the batches are handed to the pool.
    pub async fn start_cycle(self: &Arc<Self>) -> ScheduleResult<CycleTicket> {
        let mut state = self.state.lock().await;
        if state.running {
            self.recover(&mut state).await;
        }

        self.ctx.events.emit(ScheduleEvent::Liveness {
            schedule: self.def.name.clone(),
            shard_id: self.ctx.config.shard_id,
            refresh_rate_minutes: self.def.refresh_rate_minutes,
        });

        let (plan, dispatch, feeds, pending) = self.prepare(state.run).await?;

        let id = state.next_cycle;
        state.next_cycle += 1;
        let workers = Arc::new(WorkerSet::new());

        tracing::info!(
            schedule = %self.def.name,
            shard = self.ctx.config.shard_id,
            run = state.run,
            feeds,
            urls = pending.len(),
            plain_batches = plan.plain.len(),
            custom_batches = plan.custom.len(),
            "Starting feed retrieval cycle"
        );

        state.cycle = Some(CycleTracker {
            id,
            run: state.run,
            started: Instant::now(),
            feeds,
            total: 0,
            fails: 0,
            pending,
            workers: workers.clone(),
            driver: None,
        });

        if plan.is_empty() {
            let summary = self.finish_locked(&mut state, id, true).await;
            return Ok(CycleTicket {
                schedule: self.def.name.clone(),
                inner: TicketInner::Finished(summary),
            });
        }

        state.running = true;
        metrics::set_in_progress(&self.def.name, true);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.drive(id, dispatch, plan, workers).await });
        if let Some(cycle) = state.cycle.as_mut() {
            cycle.driver = Some(handle.abort_handle());
        }

        Ok(CycleTicket {
            schedule: self.def.name.clone(),
            inner: TicketInner::Running(handle),
        })
    }

    /// Kill the workers of the current cycle and mark the schedule idle
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(cycle) = state.cycle.as_mut() {
            let killed = cycle.workers.kill_all().await;
            if let Some(driver) = cycle.driver.take() {
                driver.abort();
            }
            if killed > 0 {
                tracing::info!(schedule = %self.def.name, workers = killed, "Killed workers");
            }
        }
        state.running = false;
        metrics::set_in_progress(&self.def.name, false);
    }

    /// Read the snapshot and build the batches of a new cycle
    async fn prepare(
        &self,
        run: u64,
    ) -> ScheduleResult<(BatchPlan, DispatchContext, usize, BTreeMap<String, u32>)> {
        let config = &self.ctx.config;
        let since = self.ctx.fail_counters.epoch().await;
        let snapshot = self
            .ctx
            .store
            .load_snapshot()
            .await
            .map_err(|e| ScheduleError::SnapshotFailed {
                reason: e.to_string(),
            })?;

        self.ctx
            .fail_counters
            .load(snapshot.fail_counters.clone(), since)
            .await;

        let known: HashSet<&str> = snapshot.sources.iter().map(|s| s.id.as_str()).collect();
        let dropped = self.ctx.seen.retain_sources(&known).await;
        if dropped > 0 {
            tracing::debug!(
                schedule = %self.def.name,
                dropped,
                "Dropped item ledgers of removed sources"
            );
        }

        let mut sources = snapshot.sources.clone();
        if config.supporters_enabled || config.default_max_feeds > 0 {
            let limits = if config.supporters_enabled {
                snapshot.guild_limits()
            } else {
                HashMap::new()
            };
            if let Err(e) = enforce_limits(
                &mut sources,
                &limits,
                config.default_max_feeds,
                self.ctx.store.as_ref(),
            )
            .await
            {
                tracing::warn!(schedule = %self.def.name, error = %e, "Unable to apply feed limits");
            }
        }

        let supporter_guilds = if config.supporters_enabled {
            snapshot.supporter_guilds()
        } else {
            HashSet::new()
        };
        let schedules = if snapshot.schedules.is_empty() {
            &self.ctx.schedules
        } else {
            &snapshot.schedules
        };

        let assigned: Vec<_> = sources
            .iter()
            .filter(|source| {
                let name = self.ctx.cadence.resolve(source, schedules, &supporter_guilds);
                if name != self.def.name {
                    return false;
                }
                if self.debug_feeds.contains(&source.id) {
                    tracing::debug!(
                        source = %source.id,
                        schedule = %self.def.name,
                        shard = config.shard_id,
                        "Assigned schedule"
                    );
                }
                true
            })
            .collect();

        let index = DeliveryIndex::from_snapshot(&snapshot, config.supporters_enabled);
        let aggregator = AggregatorContext {
            directory: self.ctx.directory.as_ref(),
            permissions: self.ctx.permissions.as_ref(),
            fail_counters: self.ctx.fail_counters.as_ref(),
            debug_feeds: &self.debug_feeds,
        };
        let aggregation = aggregate(&aggregator, &index, assigned).await;
        let plan = plan_batches(&aggregation.plain, &aggregation.custom, config.batch_size);

        let mut debug_links: BTreeSet<String> = config.debug_links.iter().cloned().collect();
        debug_links.extend(aggregation.debug_links.iter().cloned());

        let dispatch = DispatchContext {
            schedule: self.def.name.clone(),
            shard_id: config.shard_id,
            run,
            debug_feeds: self.debug_feeds.iter().cloned().collect(),
            debug_links,
            fetcher: self.ctx.fetcher_config.clone(),
        };

        Ok((plan, dispatch, aggregation.feed_count, aggregation.pending))
    }

    async fn drive(
        self: Arc<Self>,
        id: u64,
        dispatch: DispatchContext,
        plan: BatchPlan,
        workers: Arc<WorkerSet>,
    ) -> Option<CycleSummary> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = self.pool.dispatch(&dispatch, plan, tx, workers);
        let outcomes = async {
            while let Some(event) = rx.recv().await {
                self.handle_event(id, event).await;
            }
        };
        tokio::join!(pool, outcomes);

        let mut state = self.state.lock().await;
        self.finish_locked(&mut state, id, false).await
    }

    async fn handle_event(&self, id: u64, event: UnitEvent) {
        match event {
            UnitEvent::Item {
                url,
                source_id,
                item,
            } => {
                if !self.ctx.seen.observe(&source_id, &item.id).await {
                    return;
                }
                if self.debug_feeds.contains(&source_id) {
                    tracing::debug!(source = %source_id, item = %item.id, "Emitted item event");
                }
                metrics::record_item_discovered(&self.def.name);
                self.ctx
                    .events
                    .emit(ScheduleEvent::ItemDiscovered(DiscoveredItem {
                        source_id,
                        url,
                        schedule: self.def.name.clone(),
                        item,
                    }));
            }
            UnitEvent::Finished {
                url,
                sources,
                outcome,
            } => {
                // Held across the write-back so recovery never interleaves with it
                let mut state = self.state.lock().await;
                let current = state.cycle.as_ref().is_some_and(|c| c.id == id);
                if !current && self.pool.is_isolated() {
                    tracing::debug!(url = %url, "Ignoring outcome of a recovered cycle");
                    return;
                }

                let failed = match &outcome {
                    UnitOutcome::Succeeded => {
                        if let Err(e) = self.ctx.fail_counters.reset(&url).await {
                            tracing::warn!(url = %url, error = %e, "Unable to reset fail counter");
                        }
                        for source_id in &sources {
                            self.ctx.seen.settle(source_id).await;
                        }
                        false
                    }
                    UnitOutcome::Failed(reason) => {
                        tracing::debug!(url = %url, reason = %reason, "Skipping link");
                        if let Err(e) = self.ctx.fail_counters.increment(&url, Some(reason)).await {
                            tracing::warn!(url = %url, error = %e, "Unable to increment fail counter");
                        }
                        true
                    }
                };

                if self.ctx.config.debug_links.contains(&url) {
                    tracing::debug!(url = %url, schedule = %self.def.name, "Link finished");
                }

                if let Some(cycle) = state.cycle.as_mut().filter(|c| c.id == id) {
                    cycle.total += 1;
                    if failed {
                        cycle.fails += 1;
                    }
                    if let Some(pending) = cycle.pending.get_mut(&url) {
                        *pending = pending.saturating_sub(1);
                    }
                }
            }
        }
    }

    async fn finish_locked(
        &self,
        state: &mut ScheduleState,
        id: u64,
        no_sources: bool,
    ) -> Option<CycleSummary> {
        let Some(cycle) = state.cycle.as_mut().filter(|c| c.id == id) else {
            tracing::debug!(schedule = %self.def.name, cycle = id, "Superseded cycle finished");
            return None;
        };
        cycle.driver = None;

        let elapsed_secs = cycle.started.elapsed().as_secs_f64();
        let totals = CycleTotals {
            feeds: cycle.feeds,
            cycle_time_secs: elapsed_secs,
            fails: cycle.fails,
            urls: cycle.total,
        };
        let run = cycle.run;

        state.running = false;
        state.run += 1;
        metrics::set_in_progress(&self.def.name, false);
        metrics::record_cycle(&self.def.name, elapsed_secs, totals.urls, totals.fails);

        let shard_id = self.ctx.config.shard_id;
        let stats = self.ctx.stats.record(&shard_id.to_string(), &totals).await;

        if no_sources {
            tracing::info!(
                schedule = %self.def.name,
                shard = shard_id,
                "Finished feed retrieval cycle. No feeds to retrieve"
            );
        } else {
            tracing::info!(
                schedule = %self.def.name,
                shard = shard_id,
                failed = totals.fails,
                total = totals.urls,
                cycle_time = %format!("{elapsed_secs:.2}s"),
                "Finished feed retrieval cycle"
            );
        }

        let summary = CycleSummary {
            schedule: self.def.name.clone(),
            shard_id,
            run,
            feeds: totals.feeds,
            urls: totals.urls,
            fails: totals.fails,
            elapsed_secs,
            no_sources,
            stats,
        };
        self.ctx
            .events
            .emit(ScheduleEvent::CycleFinished(summary.clone()));
        Some(summary)
    }

    async fn recover(&self, state: &mut ScheduleState) {
        metrics::record_stuck_recovery(&self.def.name);

        if !self.pool.is_isolated() {
            tracing::warn!(
                schedule = %self.def.name,
                shard = self.ctx.config.shard_id,
                "Previous feed retrieval cycle was unable to finish, attempting to start new cycle. \
                 If repeatedly seeing this message, consider increasing your refresh time."
            );
            state.running = false;
            return;
        }

        state.running = false;
        let Some(cycle) = state.cycle.take() else {
            return;
        };

        let unresponsive: Vec<&str> = cycle
            .pending
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(url, _)| url.as_str())
            .collect();
        for url in &unresponsive {
            if let Err(e) = self
                .ctx
                .fail_counters
                .increment(url, Some(UNRESPONSIVE_REASON))
                .await
            {
                tracing::warn!(url = %url, error = %e, "Unable to increment fail counter");
            }
        }

        let live = cycle.workers.len().await;
        tracing::warn!(
            schedule = %self.def.name,
            shard = self.ctx.config.shard_id,
            workers = live,
            links = unresponsive.len(),
            "Workers from previous cycle were not killed. Killing all workers now. \
             If repeatedly seeing this message, consider increasing your refresh time."
        );
        tracing::warn!(
            schedule = %self.def.name,
            "Links that failed to respond:\n{}",
            summarize_links(unresponsive.iter().copied())
        );

        cycle.workers.kill_all().await;
        if let Some(driver) = cycle.driver {
            driver.abort();
        }
    }
}
