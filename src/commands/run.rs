use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;

use feedcycle::config::Config;
use feedcycle::metrics;
use feedcycle::schedule::{worker, FeedSchedule, ScheduleContext, ScheduleManager};

use super::open_store;

/// Run every schedule, writing events to stdout as JSON lines until Ctrl-C
pub async fn run(config: Config) -> Result<()> {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let store = open_store(&config)?;
    let manager = ScheduleManager::new(ScheduleContext::new(&config, store)?)?;
    let mut events = manager.subscribe();
    manager.start().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let mut line = serde_json::to_vec(&event)?;
                    line.push(b'\n');
                    stdout.write_all(&line).await?;
                    stdout.flush().await?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event consumer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Run one cycle of `name` and print its summary
pub async fn once(config: Config, name: &str) -> Result<()> {
    let store = open_store(&config)?;
    let ctx = ScheduleContext::new(&config, store)?;
    let Some(def) = ctx.schedules.iter().find(|s| s.name == name).cloned() else {
        bail!("Unknown schedule: {name}");
    };

    let schedule = Arc::new(FeedSchedule::new(def, ctx)?);
    let summary = schedule.run_cycle().await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Serve one dispatch payload over stdio
pub async fn worker() -> Result<()> {
    worker::run_stdio().await?;
    Ok(())
}
