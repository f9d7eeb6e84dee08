//! Worker side of the dispatch protocol
//!
//! A worker accepts one [`DispatchPayload`], answers with a `ready`
//! handshake, then fetches every unit of the batch concurrently. Per unit it
//! streams an optional `headers` report, zero or more `item` reports and
//! exactly one terminal `succeeded` or `failed` report.
//!
//! Over a process boundary every message is one JSON line (NDJSON): the
//! payload on stdin, the reports on stdout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::batcher::{Batch, FetchUnit};
use super::error::{ScheduleError, ScheduleResult};
use crate::cache::{HeaderEntry, HeaderSnapshot};
use crate::config::FetcherConfig;
use crate::fetch::{passes_filters, FetchRequest, Fetcher, HttpFetcher};
use crate::models::FeedItem;
use crate::utils::error::FetchError;

/// Everything a worker needs to run one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub schedule: String,
    pub shard_id: u32,
    pub run: u64,
    pub batch: Batch,
    /// Header cache entries for the URLs of the batch
    pub headers: HeaderSnapshot,
    pub debug_feeds: BTreeSet<String>,
    pub debug_links: BTreeSet<String>,
    pub fetcher: FetcherConfig,
}

impl DispatchPayload {
    fn is_debug(&self, unit: &FetchUnit) -> bool {
        self.debug_links.contains(&unit.url)
            || unit.sources.keys().any(|id| self.debug_feeds.contains(id))
    }
}

/// Message streamed back by a worker
///
/// `unit` is the index of the fetch unit inside the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReport {
    /// Batch accepted
    Ready,
    Headers {
        unit: usize,
        url: String,
        entry: HeaderEntry,
    },
    Item {
        unit: usize,
        url: String,
        source_id: String,
        item: FeedItem,
    },
    Succeeded {
        unit: usize,
        url: String,
    },
    Failed {
        unit: usize,
        url: String,
        reason: String,
    },
}

impl WorkerReport {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    pub fn unit(&self) -> Option<usize> {
        match self {
            Self::Ready => None,
            Self::Headers { unit, .. }
            | Self::Item { unit, .. }
            | Self::Succeeded { unit, .. }
            | Self::Failed { unit, .. } => Some(*unit),
        }
    }
}

async fn run_unit(
    fetcher: &dyn Fetcher,
    index: usize,
    unit: &FetchUnit,
    cached: Option<HeaderEntry>,
    debug: bool,
    tx: &mpsc::UnboundedSender<WorkerReport>,
) {
    let request = FetchRequest {
        url: unit.url.clone(),
        settings: unit.settings.clone(),
        cached,
    };

    let report = match fetcher.fetch(&request).await {
        Ok(response) => {
            if !response.headers.is_empty() {
                let _ = tx.send(WorkerReport::Headers {
                    unit: index,
                    url: unit.url.clone(),
                    entry: response.headers,
                });
            }
            for item in &response.items {
                for (source_id, meta) in &unit.sources {
                    if !passes_filters(item, &meta.source.filters) {
                        continue;
                    }
                    let _ = tx.send(WorkerReport::Item {
                        unit: index,
                        url: unit.url.clone(),
                        source_id: source_id.clone(),
                        item: item.clone(),
                    });
                }
            }
            if debug {
                tracing::debug!(
                    url = %unit.url,
                    items = response.items.len(),
                    not_modified = response.not_modified,
                    "Link fetched"
                );
            }
            WorkerReport::Succeeded {
                unit: index,
                url: unit.url.clone(),
            }
        }
        Err(e) => {
            if debug {
                tracing::debug!(url = %unit.url, error = %e, "Link failed");
            }
            WorkerReport::Failed {
                unit: index,
                url: unit.url.clone(),
                reason: e.to_string(),
            }
        }
    };

    // A closed channel means the cycle was abandoned.
    let _ = tx.send(report);
}

/// Fetch every unit of the payload's batch concurrently
pub async fn run_batch(
    fetcher: &dyn Fetcher,
    payload: &DispatchPayload,
    tx: &mpsc::UnboundedSender<WorkerReport>,
) {
    let units = payload.batch.units.iter().enumerate().map(|(index, unit)| {
        let cached = payload.headers.get(&unit.url).cloned();
        run_unit(fetcher, index, unit, cached, payload.is_debug(unit), tx)
    });
    futures::future::join_all(units).await;
}

/// Reports for a batch that could not be fetched at all
pub fn fail_all(batch: &Batch, reason: &str) -> Vec<WorkerReport> {
    batch
        .units
        .iter()
        .enumerate()
        .map(|(unit, u)| WorkerReport::Failed {
            unit,
            url: u.url.clone(),
            reason: reason.to_string(),
        })
        .collect()
}

async fn write_report<W: AsyncWrite + Unpin>(
    writer: &mut W,
    report: &WorkerReport,
) -> ScheduleResult<()> {
    let mut line = serde_json::to_vec(report)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Serve one payload read from `reader`, writing reports to `writer`
pub async fn serve<R, W, F>(reader: R, mut writer: W, make_fetcher: F) -> ScheduleResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(&FetcherConfig) -> Result<Arc<dyn Fetcher>, FetchError>,
{
    let mut lines = reader.lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| ScheduleError::worker("No dispatch payload received"))?;
    let payload: DispatchPayload = serde_json::from_str(&line)?;

    write_report(&mut writer, &WorkerReport::Ready).await?;

    let fetcher = match make_fetcher(&payload.fetcher) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            for report in fail_all(&payload.batch, &e.to_string()) {
                write_report(&mut writer, &report).await?;
            }
            return Ok(());
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let payload_ref = &payload;
    let fetcher_ref = fetcher.as_ref();
    let run = async move {
        run_batch(fetcher_ref, payload_ref, &tx).await;
    };
    let write = async {
        while let Some(report) = rx.recv().await {
            write_report(&mut writer, &report).await?;
        }
        Ok::<_, ScheduleError>(())
    };

    let ((), written) = tokio::join!(run, write);
    written
}

/// Entry point of `feedcycle worker`
pub async fn run_stdio() -> ScheduleResult<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(stdin, stdout, |config| {
        HttpFetcher::new(config).map(|f| Arc::new(f) as Arc<dyn Fetcher>)
    })
    .await
}
