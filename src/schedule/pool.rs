//! Worker pool
//!
//! Executes the batches of a cycle in one of two modes:
//!
//! - **In-process**: batches run one after another with a short delay between
//!   them; the units of a batch are fetched concurrently.
//! - **Isolated**: each batch goes to its own worker obtained from a
//!   [`WorkerLauncher`]. A semaphore bounds the number of live workers, and
//!   the next batch is launched only once the previous worker answered its
//!   `ready` handshake. A worker is killed once every unit of its batch has
//!   reported a terminal outcome.
//!
//! Both modes translate worker reports into [`UnitEvent`]s for the
//! controller and write observed headers straight into the [`HeaderCache`],
//! so a later batch of the same cycle already fetches conditionally.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::AbortHandle;

use super::batcher::{Batch, BatchPlan};
use super::error::{ScheduleError, ScheduleResult};
use super::worker::{fail_all, run_batch, DispatchPayload, WorkerReport};
use crate::cache::{HeaderCache, HeaderSnapshot};
use crate::config::FetcherConfig;
use crate::fetch::Fetcher;
use crate::models::{FeedItem, SourceId};

/// Reason recorded for units a worker never reported on
pub const WORKER_EXITED: &str = "Worker exited before responding";

/// Terminal outcome of one fetch unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded,
    Failed(String),
}

/// What the pool hands to the controller
#[derive(Debug, Clone)]
pub enum UnitEvent {
    Item {
        url: String,
        source_id: SourceId,
        item: FeedItem,
    },
    Finished {
        url: String,
        sources: Vec<SourceId>,
        outcome: UnitOutcome,
    },
}

/// Control over one running worker
pub trait WorkerHandle: Send {
    /// Terminate the worker; must be idempotent
    fn kill(&mut self);
}

/// A started worker: its report stream and its handle
pub struct LaunchedWorker {
    pub reports: mpsc::UnboundedReceiver<WorkerReport>,
    pub handle: Box<dyn WorkerHandle>,
}

/// Starts isolated workers
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, payload: DispatchPayload) -> ScheduleResult<LaunchedWorker>;
}

// ============================================================================
// Process workers
// ============================================================================

/// Runs every batch in a child process speaking NDJSON over stdio
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
        }
    }

    /// Launch workers through the running executable
    pub fn current_exe() -> ScheduleResult<Self> {
        let program = std::env::current_exe()
            .map_err(|e| ScheduleError::io_error("locate current executable", e.to_string()))?;
        Ok(Self::new(program))
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

struct ProcessHandle {
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn kill(&mut self) {
        // Already-exited children report an error here; nothing to do then.
        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, payload: DispatchPayload) -> ScheduleResult<LaunchedWorker> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ScheduleError::io_error("spawn worker", e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ScheduleError::worker("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScheduleError::worker("worker stdout unavailable"))?;

        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        drop(stdin);

        let (tx, rx) = mpsc::unbounded_channel();
        let schedule = payload.schedule.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match serde_json::from_str::<WorkerReport>(&line) {
                        Ok(report) => {
                            if tx.send(report).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(schedule = %schedule, error = %e, "Unreadable worker report");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(schedule = %schedule, error = %e, "Worker output closed");
                        break;
                    }
                }
            }
        });

        Ok(LaunchedWorker {
            reports: rx,
            handle: Box::new(ProcessHandle { child }),
        })
    }
}

// ============================================================================
// Task workers
// ============================================================================

/// Runs every batch in a separate tokio task
///
/// Same protocol as [`ProcessLauncher`] without the process boundary.
pub struct TaskLauncher {
    fetcher: Arc<dyn Fetcher>,
    tasks: std::sync::Mutex<Vec<AbortHandle>>,
}

impl TaskLauncher {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Number of launched tasks that have not finished yet
    pub fn live(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().filter(|t| !t.is_finished()).count())
            .unwrap_or(0)
    }
}

struct TaskHandle {
    abort: AbortHandle,
}

impl WorkerHandle for TaskHandle {
    fn kill(&mut self) {
        self.abort.abort();
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn launch(&self, payload: DispatchPayload) -> ScheduleResult<LaunchedWorker> {
        let (tx, rx) = mpsc::unbounded_channel();
        let fetcher = self.fetcher.clone();
        let task = tokio::spawn(async move {
            let _ = tx.send(WorkerReport::Ready);
            run_batch(fetcher.as_ref(), &payload, &tx).await;
        });

        let abort = task.abort_handle();
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(abort.clone());
        }

        Ok(LaunchedWorker {
            reports: rx,
            handle: Box::new(TaskHandle { abort }),
        })
    }
}

// ============================================================================
// Tracked workers
// ============================================================================

/// Live workers of one cycle
///
/// Once [`WorkerSet::kill_all`] ran the set is closed: workers tracked
/// afterwards are killed immediately.
#[derive(Default)]
pub struct WorkerSet {
    next_id: AtomicU64,
    inner: Mutex<WorkerSetInner>,
}

#[derive(Default)]
struct WorkerSetInner {
    closed: bool,
    workers: BTreeMap<u64, Box<dyn WorkerHandle>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    async fn track(&self, mut handle: Box<dyn WorkerHandle>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        if inner.closed {
            handle.kill();
        } else {
            inner.workers.insert(id, handle);
        }
        id
    }

    /// Kill and forget one worker
    async fn release(&self, id: u64) {
        if let Some(mut handle) = self.inner.lock().await.workers.remove(&id) {
            handle.kill();
        }
    }

    /// Kill every tracked worker and close the set; returns how many were live
    pub async fn kill_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        let workers = std::mem::take(&mut inner.workers);
        let count = workers.len();
        for (_, mut handle) in workers {
            handle.kill();
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Per-cycle values copied into every dispatch payload
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub schedule: String,
    pub shard_id: u32,
    pub run: u64,
    pub debug_feeds: BTreeSet<String>,
    pub debug_links: BTreeSet<String>,
    pub fetcher: FetcherConfig,
}

impl DispatchContext {
    fn payload(&self, batch: Batch, headers: HeaderSnapshot) -> DispatchPayload {
        DispatchPayload {
            schedule: self.schedule.clone(),
            shard_id: self.shard_id,
            run: self.run,
            batch,
            headers,
            debug_feeds: self.debug_feeds.clone(),
            debug_links: self.debug_links.clone(),
            fetcher: self.fetcher.clone(),
        }
    }
}

/// Execution mode of a pool
#[derive(Clone)]
pub enum PoolMode {
    /// Sequential batches inside the controller's process
    InProcess { batch_delay: Duration },

    /// One worker per batch, at most `width` live at once (0 = unbounded)
    Isolated {
        width: usize,
        launcher: Arc<dyn WorkerLauncher>,
    },
}

/// Runs batches and reports per-unit outcomes
pub struct WorkerPool {
    mode: PoolMode,
    fetcher: Arc<dyn Fetcher>,
    headers: Arc<HeaderCache>,
}

impl WorkerPool {
    pub fn new(mode: PoolMode, fetcher: Arc<dyn Fetcher>, headers: Arc<HeaderCache>) -> Self {
        Self {
            mode,
            fetcher,
            headers,
        }
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self.mode, PoolMode::Isolated { .. })
    }

    /// Run every batch of `plan`, plain lane first
    ///
    /// Returns once every unit has produced a terminal [`UnitEvent`].
    pub async fn dispatch(
        &self,
        ctx: &DispatchContext,
        plan: BatchPlan,
        events: mpsc::UnboundedSender<UnitEvent>,
        workers: Arc<WorkerSet>,
    ) {
        let batches = plan.into_ordered();
        match &self.mode {
            PoolMode::InProcess { batch_delay } => {
                self.run_in_process(ctx, batches, *batch_delay, &events).await
            }
            PoolMode::Isolated { width, launcher } => {
                self.run_isolated(ctx, batches, *width, launcher.clone(), &events, workers)
                    .await
            }
        }
    }

    async fn run_in_process(
        &self,
        ctx: &DispatchContext,
        batches: Vec<Batch>,
        batch_delay: Duration,
        events: &mpsc::UnboundedSender<UnitEvent>,
    ) {
        for (position, batch) in batches.into_iter().enumerate() {
            if position > 0 {
                tokio::time::sleep(batch_delay).await;
            }
            tracing::debug!(
                schedule = %ctx.schedule,
                lane = %batch.lane,
                batch = batch.number,
                units = batch.len(),
                "Running batch in process"
            );

            let headers = self.headers.snapshot(Some(batch.urls())).await;
            let payload = ctx.payload(batch, headers);
            let (tx, rx) = mpsc::unbounded_channel();

            let payload_ref = &payload;
            let fetcher = self.fetcher.as_ref();
            let run = async move {
                run_batch(fetcher, payload_ref, &tx).await;
            };
            let forward = forward_reports(&payload.batch, rx, events, &self.headers, None);
            tokio::join!(run, forward);
        }
    }

    async fn run_isolated(
        &self,
        ctx: &DispatchContext,
        batches: Vec<Batch>,
        width: usize,
        launcher: Arc<dyn WorkerLauncher>,
        events: &mpsc::UnboundedSender<UnitEvent>,
        workers: Arc<WorkerSet>,
    ) {
        let unbounded = width == 0;
        let permits = if unbounded { batches.len().max(1) } else { width };
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut forwards = Vec::with_capacity(batches.len());

        for batch in batches {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            let headers = self.headers.snapshot(Some(batch.urls())).await;
            let payload = ctx.payload(batch.clone(), headers);

            match launcher.launch(payload).await {
                Ok(LaunchedWorker { reports, handle }) => {
                    let id = workers.track(handle).await;
                    let (ready_tx, ready_rx) = oneshot::channel();
                    let events = events.clone();
                    let cache = self.headers.clone();
                    let workers = workers.clone();

                    forwards.push(tokio::spawn(async move {
                        forward_reports(&batch, reports, &events, &cache, Some(ready_tx)).await;
                        workers.release(id).await;
                        drop(permit);
                    }));

                    if !unbounded {
                        // Dropped sender means the worker ended without a handshake.
                        let _ = ready_rx.await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        schedule = %ctx.schedule,
                        lane = %batch.lane,
                        batch = batch.number,
                        error = %e,
                        "Unable to launch worker"
                    );
                    let (tx, rx) = mpsc::unbounded_channel();
                    for report in fail_all(&batch, &e.to_string()) {
                        let _ = tx.send(report);
                    }
                    drop(tx);
                    forward_reports(&batch, rx, events, &self.headers, None).await;
                    drop(permit);
                }
            }
        }

        futures::future::join_all(forwards).await;
    }
}

/// Translate the reports of one batch until every unit is terminal or the
/// stream ends, failing whatever is left unreported
async fn forward_reports(
    batch: &Batch,
    mut reports: mpsc::UnboundedReceiver<WorkerReport>,
    events: &mpsc::UnboundedSender<UnitEvent>,
    cache: &HeaderCache,
    mut ready: Option<oneshot::Sender<()>>,
) {
    let mut outstanding: BTreeSet<usize> = (0..batch.len()).collect();

    let finish = |unit: usize, outcome: UnitOutcome| {
        let fetch_unit = &batch.units[unit];
        let _ = events.send(UnitEvent::Finished {
            url: fetch_unit.url.clone(),
            sources: fetch_unit.source_ids(),
            outcome,
        });
    };

    while !outstanding.is_empty() {
        let Some(report) = reports.recv().await else {
            break;
        };
        match report {
            WorkerReport::Ready => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }
            }
            WorkerReport::Headers { url, entry, .. } => cache.set(&url, entry).await,
            WorkerReport::Item {
                unit,
                url,
                source_id,
                item,
            } => {
                if outstanding.contains(&unit) {
                    let _ = events.send(UnitEvent::Item {
                        url,
                        source_id,
                        item,
                    });
                }
            }
            WorkerReport::Succeeded { unit, .. } => {
                if outstanding.remove(&unit) {
                    finish(unit, UnitOutcome::Succeeded);
                }
            }
            WorkerReport::Failed { unit, reason, .. } => {
                if outstanding.remove(&unit) {
                    finish(unit, UnitOutcome::Failed(reason));
                }
            }
        }
    }

    if !outstanding.is_empty() {
        tracing::warn!(
            lane = %batch.lane,
            batch = batch.number,
            unreported = outstanding.len(),
            "Worker exited before reporting every link"
        );
        for unit in outstanding {
            finish(unit, UnitOutcome::Failed(WORKER_EXITED.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::aggregator::SourceList;
    use crate::schedule::batcher::{FetchUnit, Lane};

    fn batch(urls: &[&str]) -> Batch {
        Batch {
            lane: Lane::Plain,
            number: 0,
            units: urls
                .iter()
                .map(|u| FetchUnit {
                    url: u.to_string(),
                    sources: SourceList::new(),
                    settings: None,
                })
                .collect(),
        }
    }

    struct CountingHandle(Arc<AtomicU64>);

    impl WorkerHandle for CountingHandle {
        fn kill(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_forward_synthesizes_missing_units() {
        let batch = batch(&["a", "b"]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WorkerReport::Succeeded {
            unit: 0,
            url: "a".into(),
        })
        .unwrap();
        drop(tx);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let cache = HeaderCache::new();
        forward_reports(&batch, rx, &events_tx, &cache, None).await;
        drop(events_tx);

        let mut outcomes = Vec::new();
        while let Some(UnitEvent::Finished { url, outcome, .. }) = events_rx.recv().await {
            outcomes.push((url, outcome));
        }
        assert_eq!(
            outcomes,
            vec![
                ("a".to_string(), UnitOutcome::Succeeded),
                ("b".to_string(), UnitOutcome::Failed(WORKER_EXITED.to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_terminal_reports_ignored() {
        let batch = batch(&["a"]);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WorkerReport::Failed {
            unit: 0,
            url: "a".into(),
            reason: "x".into(),
        })
        .unwrap();
        tx.send(WorkerReport::Succeeded {
            unit: 0,
            url: "a".into(),
        })
        .unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        forward_reports(&batch, rx, &events_tx, &HeaderCache::new(), None).await;
        drop(events_tx);

        let mut count = 0;
        while events_rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_worker_set_closes() {
        let kills = Arc::new(AtomicU64::new(0));
        let set = WorkerSet::new();
        set.track(Box::new(CountingHandle(kills.clone()))).await;
        set.track(Box::new(CountingHandle(kills.clone()))).await;
        assert_eq!(set.len().await, 2);

        assert_eq!(set.kill_all().await, 2);
        assert_eq!(kills.load(Ordering::SeqCst), 2);

        set.track(Box::new(CountingHandle(kills.clone()))).await;
        assert_eq!(kills.load(Ordering::SeqCst), 3);
        assert!(set.is_empty().await);
    }
}
