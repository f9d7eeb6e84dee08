//! Conditional-fetch header cache
//!
//! Remembers the last `ETag` / `Last-Modified` pair observed for every URL so
//! the next fetch can be conditional. Entries never expire during the process
//! lifetime and are shared by every schedule and worker.
//!
//! Isolated workers cannot see this map directly: the pool ships a
//! [`HeaderCache::snapshot`] with each batch and writes back the `headers`
//! reports it receives.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Conditional-fetch metadata of one URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl HeaderEntry {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Plain copy of the cache for shipping across a process boundary
pub type HeaderSnapshot = BTreeMap<String, HeaderEntry>;

/// Shared URL -> [`HeaderEntry`] map
#[derive(Debug, Default)]
pub struct HeaderCache {
    entries: RwLock<HashMap<String, HeaderEntry>>,
}

impl HeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Option<HeaderEntry> {
        self.entries.read().await.get(url).cloned()
    }

    /// Overwrite the entry of `url`; empty entries are ignored
    pub async fn set(&self, url: &str, entry: HeaderEntry) {
        if entry.is_empty() {
            return;
        }
        self.entries.write().await.insert(url.to_string(), entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Copy of the entries for `urls` (all entries when `urls` is `None`)
    pub async fn snapshot<'a, I>(&self, urls: Option<I>) -> HeaderSnapshot
    where
        I: IntoIterator<Item = &'a str>,
    {
        let entries = self.entries.read().await;
        match urls {
            Some(urls) => urls
                .into_iter()
                .filter_map(|url| entries.get(url).map(|e| (url.to_string(), e.clone())))
                .collect(),
            None => entries
                .iter()
                .map(|(url, e)| (url.clone(), e.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(etag: &str) -> HeaderEntry {
        HeaderEntry {
            etag: Some(etag.to_string()),
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let cache = HeaderCache::new();
        cache.set("u", entry("a")).await;
        cache.set("u", entry("b")).await;
        assert_eq!(cache.get("u").await, Some(entry("b")));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_entry_ignored() {
        let cache = HeaderCache::new();
        cache.set("u", entry("a")).await;
        cache.set("u", HeaderEntry::default()).await;
        assert_eq!(cache.get("u").await, Some(entry("a")));
    }

    #[tokio::test]
    async fn test_snapshot_subset() {
        let cache = HeaderCache::new();
        cache.set("a", entry("1")).await;
        cache.set("b", entry("2")).await;

        let subset = cache.snapshot(Some(["a", "missing"])).await;
        assert_eq!(subset.len(), 1);
        assert!(subset.contains_key("a"));

        let all = cache.snapshot(None::<Vec<&str>>).await;
        assert_eq!(all.len(), 2);
    }
}
