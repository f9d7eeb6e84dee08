//! Timers driving every configured cadence

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::controller::{FeedSchedule, ScheduleContext};
use super::error::ScheduleResult;
use super::events::ScheduleEvent;

/// Owns one [`FeedSchedule`] per cadence and the timers that start their
/// cycles
pub struct ScheduleManager {
    ctx: ScheduleContext,
    schedules: Vec<Arc<FeedSchedule>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl ScheduleManager {
    /// Build a controller for every cadence of the context
    ///
    /// # Errors
    ///
    /// Fails on the first cadence that cannot be run
    pub fn new(ctx: ScheduleContext) -> ScheduleResult<Self> {
        let schedules = ctx
            .schedules
            .iter()
            .cloned()
            .map(|def| FeedSchedule::new(def, ctx.clone()).map(Arc::new))
            .collect::<ScheduleResult<Vec<_>>>()?;

        Ok(Self {
            ctx,
            schedules,
            timers: Mutex::new(Vec::new()),
        })
    }

    pub fn schedules(&self) -> &[Arc<FeedSchedule>] {
        &self.schedules
    }

    pub fn get(&self, name: &str) -> Option<&Arc<FeedSchedule>> {
        self.schedules.iter().find(|s| s.name() == name)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.ctx.events.subscribe()
    }

    /// Start one timer per cadence; the first cycle starts immediately
    ///
    /// A tick does not wait for the previous cycle. A cycle still running at
    /// the next tick is recovered by its controller.
    pub async fn start(&self) {
        let mut timers = self.timers.lock().await;
        if !timers.is_empty() {
            tracing::warn!("Schedule timers already running");
            return;
        }

        for schedule in &self.schedules {
            let schedule = Arc::clone(schedule);
            tracing::info!(
                schedule = %schedule.name(),
                refresh_minutes = schedule.definition().refresh_rate_minutes,
                "Starting schedule timer"
            );

            timers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(schedule.refresh_interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if let Err(e) = schedule.start_cycle().await {
                        tracing::error!(schedule = %schedule.name(), error = %e, "Unable to start cycle");
                    }
                }
            }));
        }
    }

    /// Stop the timers and kill every live worker
    pub async fn shutdown(&self) {
        for timer in self.timers.lock().await.drain(..) {
            timer.abort();
        }
        for schedule in &self.schedules {
            schedule.stop().await;
        }
        tracing::info!(schedules = self.schedules.len(), "Schedules stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::ScheduleDef;
    use crate::storage::{DataStore, MemoryStore};

    fn context(schedules: Vec<ScheduleDef>) -> ScheduleContext {
        let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
        let mut ctx = ScheduleContext::new(&Config::default(), store).unwrap();
        ctx.schedules = schedules;
        ctx
    }

    #[tokio::test]
    async fn test_builds_every_schedule() {
        let mut fast = ScheduleDef::new("fast", 1);
        fast.keywords = vec!["reddit".into()];
        let manager = ScheduleManager::new(context(vec![ScheduleDef::new("default", 10), fast])).unwrap();

        assert_eq!(manager.schedules().len(), 2);
        assert!(manager.get("fast").is_some());
        assert!(manager.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_invalid_schedule_aborts_startup() {
        let result = ScheduleManager::new(context(vec![ScheduleDef::new("empty", 5)]));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_runs_first_cycle() {
        let manager = ScheduleManager::new(context(vec![ScheduleDef::new("default", 10)])).unwrap();
        let mut events = manager.subscribe();

        manager.start().await;
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, ScheduleEvent::Liveness { .. }));

        manager.shutdown().await;
        assert!(manager.timers.lock().await.is_empty());
    }
}
