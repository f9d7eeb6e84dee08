use anyhow::Result;

use feedcycle::config::Config;

use super::open_store;

pub async fn stats(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let rows = store.all_shard_stats().await?;

    if rows.is_empty() {
        println!("No shard statistics recorded");
        return Ok(());
    }

    println!("Shard Statistics");
    println!("================");
    for row in rows {
        println!(
            "  shard {}: {} feeds, {} urls, {:.2} avg fails, {:.2}s avg cycle (updated {})",
            row.id,
            row.feeds,
            row.cycle_urls,
            row.cycle_fails,
            row.cycle_time,
            row.last_updated.to_rfc3339()
        );
    }
    Ok(())
}

pub async fn fail_counters(config: Config, reset: Option<String>) -> Result<()> {
    let store = open_store(&config)?;

    if let Some(url) = reset {
        store.delete_fail_counter(&url).await?;
        tracing::info!(url = %url, "Fail counter reset");
        println!("Reset fail counter of {url}");
        return Ok(());
    }

    let limit = config.scheduler.fail_limit;
    let counters = store.fail_counters().await?;
    if counters.is_empty() {
        println!("No fail counters");
        return Ok(());
    }

    for counter in counters {
        let state = if counter.has_failed(limit) { "FAILED" } else { "ok" };
        println!(
            "{:>4}  {:<6}  {}  {}",
            counter.count,
            state,
            counter.url,
            counter.reason.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
