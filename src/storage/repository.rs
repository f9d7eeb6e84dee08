//! SQLite implementation of the data store
//!
//! Rich documents (sources, formats, subscribers, profiles, cadences) are
//! stored as JSON in a `data` column; fail counters and shard statistics get
//! real columns so operators can query them directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{DataStore, Snapshot, Supporter};
use crate::error::{Error, Result};
use crate::failcounter::FailCounter;
use crate::models::{FilteredFormat, Format, Profile, ScheduleDef, Source, Subscriber};
use crate::stats::ShardStats;

/// SQLite-backed [`DataStore`]
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn load_documents<T: DeserializeOwned>(conn: &Connection, query: &str) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut documents = Vec::new();
    for raw in rows {
        documents.push(serde_json::from_str(&raw?)?);
    }
    Ok(documents)
}

fn row_to_counter(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailCounter> {
    Ok(FailCounter {
        url: row.get(0)?,
        count: row.get(1)?,
        reason: row.get(2)?,
        failed_at: parse_time(row.get(3)?),
    })
}

fn row_to_stats(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShardStats> {
    Ok(ShardStats {
        id: row.get(0)?,
        feeds: row.get::<_, i64>(1)? as usize,
        cycle_time: row.get(2)?,
        cycle_fails: row.get(3)?,
        cycle_urls: row.get::<_, i64>(4)? as usize,
        last_updated: parse_time(row.get(5)?).unwrap_or_else(Utc::now),
    })
}

impl SqliteStore {
    /// Open (and create if needed) a store at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::other("SQLite connection mutex poisoned"))
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS sources (
                    id TEXT PRIMARY KEY,
                    data TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS formats (
                    feed TEXT PRIMARY KEY,
                    data TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS filtered_formats (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    feed TEXT NOT NULL,
                    data TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS subscribers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    feed TEXT NOT NULL,
                    data TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS profiles (
                    id TEXT PRIMARY KEY,
                    data TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS schedules (
                    name TEXT PRIMARY KEY,
                    data TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS supporters (
                    guild TEXT PRIMARY KEY,
                    webhook INTEGER NOT NULL DEFAULT 0,
                    max_feeds INTEGER
                );

                CREATE TABLE IF NOT EXISTS fail_counters (
                    url TEXT PRIMARY KEY,
                    count INTEGER NOT NULL,
                    reason TEXT,
                    failed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS shard_stats (
                    id TEXT PRIMARY KEY,
                    feeds INTEGER NOT NULL,
                    cycle_time REAL NOT NULL,
                    cycle_fails REAL NOT NULL,
                    cycle_urls INTEGER NOT NULL,
                    last_updated TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_subscribers_feed ON subscribers(feed);
                CREATE INDEX IF NOT EXISTS idx_filtered_formats_feed ON filtered_formats(feed);
                "#,
        )?;

        Ok(())
    }

    /// Insert or replace a source
    pub fn upsert_source(&self, source: &Source) -> Result<()> {
        let data = serde_json::to_string(source)?;
        self.conn()?.execute(
            "INSERT INTO sources (id, data) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            params![source.id, data],
        )?;
        Ok(())
    }

    /// Insert or replace the format of a source
    pub fn upsert_format(&self, format: &Format) -> Result<()> {
        let data = serde_json::to_string(format)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO formats (feed, data) VALUES (?1, ?2)",
            params![format.feed, data],
        )?;
        Ok(())
    }

    pub fn add_filtered_format(&self, format: &FilteredFormat) -> Result<()> {
        let data = serde_json::to_string(format)?;
        self.conn()?.execute(
            "INSERT INTO filtered_formats (feed, data) VALUES (?1, ?2)",
            params![format.feed, data],
        )?;
        Ok(())
    }

    pub fn add_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        let data = serde_json::to_string(subscriber)?;
        self.conn()?.execute(
            "INSERT INTO subscribers (feed, data) VALUES (?1, ?2)",
            params![subscriber.feed, data],
        )?;
        Ok(())
    }

    pub fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        let data = serde_json::to_string(profile)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO profiles (id, data) VALUES (?1, ?2)",
            params![profile.id, data],
        )?;
        Ok(())
    }

    pub fn upsert_schedule(&self, schedule: &ScheduleDef) -> Result<()> {
        let data = serde_json::to_string(schedule)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO schedules (name, data) VALUES (?1, ?2)",
            params![schedule.name, data],
        )?;
        Ok(())
    }

    pub fn upsert_supporter(&self, supporter: &Supporter) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO supporters (guild, webhook, max_feeds) VALUES (?1, ?2, ?3)",
            params![
                supporter.guild,
                supporter.webhook,
                supporter.max_feeds.map(|m| m as i64)
            ],
        )?;
        Ok(())
    }

    /// Current copy of a source
    pub fn source(&self, id: &str) -> Result<Option<Source>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT data FROM sources WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|r| serde_json::from_str(&r).map_err(Error::from))
            .transpose()
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn load_snapshot(&self) -> Result<Snapshot> {
        let conn = self.conn()?;
        // One transaction so every collection comes from the same state.
        conn.execute_batch("BEGIN DEFERRED")?;
        let snapshot = (|| -> Result<Snapshot> {
            let fail_counters = {
                let mut stmt =
                    conn.prepare("SELECT url, count, reason, failed_at FROM fail_counters")?;
                let rows = stmt.query_map([], row_to_counter)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let supporters = {
                let mut stmt = conn.prepare("SELECT guild, webhook, max_feeds FROM supporters")?;
                let rows = stmt.query_map([], |row| {
                    Ok(Supporter {
                        guild: row.get(0)?,
                        webhook: row.get(1)?,
                        max_feeds: row.get::<_, Option<i64>>(2)?.map(|m| m.max(0) as usize),
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            Ok(Snapshot {
                sources: load_documents(&conn, "SELECT data FROM sources ORDER BY rowid")?,
                formats: load_documents(&conn, "SELECT data FROM formats")?,
                filtered_formats: load_documents(
                    &conn,
                    "SELECT data FROM filtered_formats ORDER BY id",
                )?,
                subscribers: load_documents(&conn, "SELECT data FROM subscribers ORDER BY id")?,
                profiles: load_documents(&conn, "SELECT data FROM profiles")?,
                fail_counters,
                schedules: load_documents(&conn, "SELECT data FROM schedules ORDER BY name")?,
                supporters,
            })
        })();
        conn.execute_batch("COMMIT")?;
        snapshot
    }

    async fn fail_counters(&self) -> Result<Vec<FailCounter>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT url, count, reason, failed_at FROM fail_counters ORDER BY url")?;
        let rows = stmt.query_map([], row_to_counter)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn save_fail_counter(&self, counter: &FailCounter) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO fail_counters (url, count, reason, failed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                counter.url,
                counter.count,
                counter.reason,
                counter.failed_at.map(|t| t.to_rfc3339())
            ],
        )?;
        Ok(())
    }

    async fn delete_fail_counter(&self, url: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM fail_counters WHERE url = ?1", params![url])?;
        Ok(())
    }

    async fn set_source_disabled(&self, source_id: &str, reason: Option<&str>) -> Result<()> {
        let mut source = self
            .source(source_id)?
            .ok_or_else(|| Error::other(format!("Unknown source {source_id}")))?;
        source.disabled = reason.map(str::to_string);
        self.upsert_source(&source)
    }

    async fn shard_stats(&self, shard_id: &str) -> Result<Option<ShardStats>> {
        let conn = self.conn()?;
        let stats = conn
            .query_row(
                "SELECT id, feeds, cycle_time, cycle_fails, cycle_urls, last_updated
                 FROM shard_stats WHERE id = ?1",
                params![shard_id],
                row_to_stats,
            )
            .optional()?;
        Ok(stats)
    }

    async fn all_shard_stats(&self) -> Result<Vec<ShardStats>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, feeds, cycle_time, cycle_fails, cycle_urls, last_updated
             FROM shard_stats ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_stats)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn save_shard_stats(&self, stats: &ShardStats) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO shard_stats
             (id, feeds, cycle_time, cycle_fails, cycle_urls, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stats.id,
                stats.feeds as i64,
                stats.cycle_time,
                stats.cycle_fails,
                stats.cycle_urls as i64,
                stats.last_updated.to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_source(&Source::new("s2", "https://b.test/rss", "g", "c")).unwrap();
        store.upsert_source(&Source::new("s1", "https://a.test/rss", "g", "c")).unwrap();
        store.upsert_schedule(&ScheduleDef::new("default", 10)).unwrap();
        store
            .upsert_supporter(&Supporter {
                guild: "g".into(),
                webhook: true,
                max_feeds: Some(3),
            })
            .unwrap();

        let snapshot = store.load_snapshot().await.unwrap();
        let ids: Vec<_> = snapshot.sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s1"]);
        assert_eq!(snapshot.schedules.len(), 1);
        assert_eq!(snapshot.guild_limits().get("g"), Some(&3));
    }

    #[tokio::test]
    async fn test_fail_counter_persistence() {
        let store = SqliteStore::in_memory().unwrap();
        let mut counter = FailCounter::new("https://a.test/rss");
        counter.count = 2;
        counter.reason = Some("Bad status code (500)".into());
        counter.failed_at = Some(Utc::now());
        store.save_fail_counter(&counter).await.unwrap();

        let loaded = store.fail_counters().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].count, 2);
        assert_eq!(loaded[0].reason, counter.reason);
        assert!(loaded[0].failed_at.is_some());

        store.delete_fail_counter("https://a.test/rss").await.unwrap();
        assert!(store.fail_counters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disable_source() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_source(&Source::new("s1", "https://a.test/rss", "g", "c")).unwrap();
        store.set_source_disabled("s1", Some("Exceeded feed limit")).await.unwrap();
        let source = store.source("s1").unwrap().unwrap();
        assert_eq!(source.disabled.as_deref(), Some("Exceeded feed limit"));
    }
}
