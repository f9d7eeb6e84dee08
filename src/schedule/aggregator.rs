//! Source aggregation
//!
//! Folds the sources of one cadence into deduplicated source lists: every URL
//! appears once with all its plain sources beneath it. Sources with custom
//! fetch settings go to a separate lane keyed by source id, one fetch unit
//! each, so their settings are never shared with or overwritten by another
//! source on the same URL.
//!
//! Ordered maps keep the output a pure function of the input snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::failcounter::FailCounterRegistry;
use crate::maintenance::{PermissionChecker, TenantDirectory};
use crate::models::{
    DateSettings, DeliveryMeta, FilteredFormat, Format, Profile, SourceId, Source, Subscriber,
};
use crate::storage::Snapshot;

/// Sources sharing one URL, keyed by source id
pub type SourceList = BTreeMap<SourceId, DeliveryMeta>;

/// URL -> source list
pub type SourceMap = BTreeMap<String, SourceList>;

/// Source id -> delivery metadata of custom-settings sources
pub type CustomMap = BTreeMap<SourceId, DeliveryMeta>;

/// Per-source delivery metadata looked up from a snapshot
#[derive(Debug, Default)]
pub struct DeliveryIndex {
    formats: HashMap<SourceId, Format>,
    filtered_formats: HashMap<SourceId, Vec<FilteredFormat>>,
    subscribers: HashMap<SourceId, Vec<Subscriber>>,
    profiles: HashMap<String, Profile>,
    /// Guilds allowed to keep webhooks; `None` leaves webhooks untouched
    webhook_guilds: Option<HashSet<String>>,
}

impl DeliveryIndex {
    pub fn from_snapshot(snapshot: &Snapshot, supporters_enabled: bool) -> Self {
        let mut index = Self {
            formats: snapshot
                .formats
                .iter()
                .map(|f| (f.feed.clone(), f.clone()))
                .collect(),
            profiles: snapshot
                .profiles
                .iter()
                .map(|p| (p.id.clone(), p.clone()))
                .collect(),
            webhook_guilds: supporters_enabled.then(|| snapshot.webhook_guilds()),
            ..Default::default()
        };
        for format in &snapshot.filtered_formats {
            index
                .filtered_formats
                .entry(format.feed.clone())
                .or_default()
                .push(format.clone());
        }
        for subscriber in &snapshot.subscribers {
            index
                .subscribers
                .entry(subscriber.feed.clone())
                .or_default()
                .push(subscriber.clone());
        }
        index
    }

    pub fn format(&self, source_id: &str) -> Option<&Format> {
        self.formats.get(source_id)
    }

    /// Delivery metadata of a source, with unauthorized webhooks stripped
    pub fn meta_for(&self, source: &Source) -> DeliveryMeta {
        let mut source = source.clone();
        if let Some(allowed) = &self.webhook_guilds {
            if source.webhook.is_some() && !allowed.contains(&source.guild) {
                source.webhook = None;
            }
        }

        DeliveryMeta {
            format: self.formats.get(&source.id).cloned(),
            filtered_formats: self
                .filtered_formats
                .get(&source.id)
                .cloned()
                .unwrap_or_default(),
            subscribers: self.subscribers.get(&source.id).cloned().unwrap_or_default(),
            date_settings: self
                .profiles
                .get(&source.guild)
                .map(DateSettings::from)
                .unwrap_or_default(),
            source,
        }
    }
}

/// Collaborators consulted while folding sources
pub struct AggregatorContext<'a> {
    pub directory: &'a dyn TenantDirectory,
    pub permissions: &'a dyn PermissionChecker,
    pub fail_counters: &'a FailCounterRegistry,
    pub debug_feeds: &'a HashSet<String>,
}

/// Output of one aggregation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    /// Sources folded in
    pub feed_count: usize,
    pub plain: SourceMap,
    pub custom: CustomMap,
    /// Outstanding fetch units per URL
    pub pending: BTreeMap<String, u32>,
    /// URLs of debug-selected sources
    pub debug_links: BTreeSet<String>,
}

impl Aggregation {
    /// Number of distinct URLs across both lanes
    pub fn url_count(&self) -> usize {
        self.pending.len()
    }

    pub fn unit_count(&self) -> usize {
        self.plain.len() + self.custom.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.custom.is_empty()
    }
}

/// Fold `sources` into source lists
pub async fn aggregate<'s, I>(
    ctx: &AggregatorContext<'_>,
    index: &DeliveryIndex,
    sources: I,
) -> Aggregation
where
    I: IntoIterator<Item = &'s Source>,
{
    let mut out = Aggregation::default();

    for source in sources {
        let debug = ctx.debug_feeds.contains(&source.id);

        let has_guild = ctx.directory.has_guild(&source.guild);
        let has_channel = ctx.directory.has_channel(&source.channel);
        if !has_guild || !has_channel {
            if debug {
                tracing::debug!(
                    source = %source.id,
                    has_guild,
                    has_channel,
                    "Not processing source with missing guild or channel"
                );
            }
            continue;
        }

        if ctx.fail_counters.has_failed(&source.url).await {
            if debug {
                tracing::debug!(source = %source.id, url = %source.url, "Skipping source of failed URL");
            }
            continue;
        }

        if ctx
            .permissions
            .check(source, index.format(&source.id))
            .await
        {
            if debug {
                tracing::debug!(source = %source.id, reason = ?source.disabled, "Skipping disabled source");
            }
            continue;
        }

        if debug {
            tracing::debug!(source = %source.id, url = %source.url, "Preparing source for delegation");
            out.debug_links.insert(source.url.clone());
        }

        let meta = index.meta_for(source);
        if source.has_custom_settings() {
            *out.pending.entry(source.url.clone()).or_default() += 1;
            out.custom.insert(source.id.clone(), meta);
        } else {
            out.plain
                .entry(source.url.clone())
                .or_default()
                .insert(source.id.clone(), meta);
        }
        out.feed_count += 1;
    }

    for url in out.plain.keys() {
        *out.pending.entry(url.clone()).or_default() += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::{DisabledOnly, StaticDirectory};
    use crate::models::SourceSettings;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    fn registry(limit: u32) -> FailCounterRegistry {
        FailCounterRegistry::new(limit, Arc::new(MemoryStore::new()))
    }

    fn custom(id: &str, url: &str) -> Source {
        let mut settings = SourceSettings::default();
        settings.headers.insert("X-Key".into(), id.into());
        Source::new(id, url, "g", "c").with_settings(settings)
    }

    #[tokio::test]
    async fn test_dedup_and_lanes() {
        let sources = vec![
            Source::new("a", "https://one.test/rss", "g", "c"),
            Source::new("b", "https://one.test/rss", "g", "c"),
            Source::new("c", "https://two.test/rss", "g", "c"),
            custom("d", "https://one.test/rss"),
            custom("e", "https://one.test/rss"),
        ];
        let fails = registry(0);
        let debug = HashSet::new();
        let directory = StaticDirectory::open();
        let ctx = AggregatorContext {
            directory: &directory,
            permissions: &DisabledOnly,
            fail_counters: &fails,
            debug_feeds: &debug,
        };

        let out = aggregate(&ctx, &DeliveryIndex::default(), &sources).await;
        assert_eq!(out.feed_count, 5);
        assert_eq!(out.plain.len(), 2);
        assert_eq!(out.plain["https://one.test/rss"].len(), 2);
        assert_eq!(out.custom.len(), 2);
        // one plain unit plus two custom units
        assert_eq!(out.pending["https://one.test/rss"], 3);
        assert_eq!(out.pending["https://two.test/rss"], 1);
        assert_eq!(out.url_count(), 2);
    }

    #[tokio::test]
    async fn test_skips() {
        let mut disabled = Source::new("d", "https://d.test/rss", "g", "c");
        disabled.disabled = Some("Exceeded feed limit".into());
        let sources = vec![
            Source::new("gone", "https://a.test/rss", "other-guild", "c"),
            Source::new("broken", "https://broken.test/rss", "g", "c"),
            disabled,
            Source::new("ok", "https://ok.test/rss", "g", "c"),
        ];
        let fails = registry(1);
        fails.increment("https://broken.test/rss", None).await.unwrap();
        let debug = HashSet::from(["ok".to_string()]);
        let directory = StaticDirectory::new().with_channel("g", "c", Vec::<crate::maintenance::Permission>::new());
        let ctx = AggregatorContext {
            directory: &directory,
            permissions: &DisabledOnly,
            fail_counters: &fails,
            debug_feeds: &debug,
        };

        let out = aggregate(&ctx, &DeliveryIndex::default(), &sources).await;
        assert_eq!(out.feed_count, 1);
        assert!(out.plain.contains_key("https://ok.test/rss"));
        assert!(out.debug_links.contains("https://ok.test/rss"));
    }

    #[test]
    fn test_webhook_stripped_without_access() {
        let snapshot = Snapshot {
            supporters: vec![crate::storage::Supporter {
                guild: "vip".into(),
                webhook: true,
                max_feeds: None,
            }],
            ..Default::default()
        };
        let index = DeliveryIndex::from_snapshot(&snapshot, true);

        let mut plain = Source::new("a", "u", "g", "c");
        plain.webhook = Some("hook".into());
        assert!(index.meta_for(&plain).source.webhook.is_none());

        let mut vip = Source::new("b", "u", "vip", "c");
        vip.webhook = Some("hook".into());
        assert!(index.meta_for(&vip).source.webhook.is_some());

        let untouched = DeliveryIndex::from_snapshot(&snapshot, false);
        assert!(untouched.meta_for(&plain).source.webhook.is_some());
    }
}
