//! Delivery maintenance checks run before a source joins a cycle
//!
//! - [`TenantDirectory`]: which guilds/channels are reachable and what the
//!   service may do in them
//! - [`PermissionChecker`]: whether a source's delivery is suppressed, toggling
//!   its disabled state in the store as a side effect
//! - [`enforce_limits`]: per-guild feed limits

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{Format, Source};
use crate::storage::DataStore;

/// Prefix of every reason set by the permission check
pub const MISSING_PERMISSIONS: &str = "Missing permissions";

/// Reason set on sources beyond their guild's limit
pub const EXCEEDED_FEED_LIMIT: &str = "Exceeded feed limit";

/// Channel permission relevant to delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ViewChannel,
    SendMessages,
    EmbedLinks,
}

impl Permission {
    pub const ALL: [Permission; 3] = [
        Permission::ViewChannel,
        Permission::SendMessages,
        Permission::EmbedLinks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViewChannel => "VIEW_CHANNEL",
            Self::SendMessages => "SEND_MESSAGES",
            Self::EmbedLinks => "EMBED_LINKS",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// View of the tenants this shard can deliver to
pub trait TenantDirectory: Send + Sync {
    fn has_guild(&self, guild: &str) -> bool;

    fn has_channel(&self, channel: &str) -> bool;

    /// Permissions granted in `channel`
    fn permissions(&self, channel: &str) -> HashSet<Permission>;
}

/// Fixed tenant directory
///
/// [`StaticDirectory::open`] reaches every guild and channel with every
/// permission; otherwise only registered channels are reachable.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    open: bool,
    guilds: HashSet<String>,
    channels: HashMap<String, HashSet<Permission>>,
}

impl StaticDirectory {
    pub fn open() -> Self {
        Self {
            open: true,
            ..Default::default()
        }
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(
        mut self,
        guild: impl Into<String>,
        channel: impl Into<String>,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        self.guilds.insert(guild.into());
        self.channels
            .insert(channel.into(), permissions.into_iter().collect());
        self
    }
}

impl TenantDirectory for StaticDirectory {
    fn has_guild(&self, guild: &str) -> bool {
        self.open || self.guilds.contains(guild)
    }

    fn has_channel(&self, channel: &str) -> bool {
        self.open || self.channels.contains_key(channel)
    }

    fn permissions(&self, channel: &str) -> HashSet<Permission> {
        if self.open {
            return Permission::ALL.into_iter().collect();
        }
        self.channels.get(channel).cloned().unwrap_or_default()
    }
}

/// Decides whether a source's delivery is currently suppressed
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Returns true when the source must be left out of the cycle
    async fn check(&self, source: &Source, format: Option<&Format>) -> bool;
}

/// Suppresses only sources that already carry a disabled reason
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledOnly;

#[async_trait]
impl PermissionChecker for DisabledOnly {
    async fn check(&self, source: &Source, _format: Option<&Format>) -> bool {
        source.disabled.is_some()
    }
}

/// Checks channel permissions through a [`TenantDirectory`]
pub struct ChannelPermissionChecker {
    directory: Arc<dyn TenantDirectory>,
    store: Arc<dyn DataStore>,
}

impl ChannelPermissionChecker {
    pub fn new(directory: Arc<dyn TenantDirectory>, store: Arc<dyn DataStore>) -> Self {
        Self { directory, store }
    }

    /// Permissions the source needs but does not have, in reporting order
    fn missing(&self, source: &Source, format: Option<&Format>) -> Vec<Permission> {
        let granted = self.directory.permissions(&source.channel);
        let needs_embeds = format.is_some_and(Format::has_embeds);

        let mut missing = Vec::new();
        if !granted.contains(&Permission::SendMessages) {
            missing.push(Permission::SendMessages);
        }
        if needs_embeds && !granted.contains(&Permission::EmbedLinks) {
            missing.push(Permission::EmbedLinks);
        }
        if !granted.contains(&Permission::ViewChannel) {
            missing.push(Permission::ViewChannel);
        }
        missing
    }
}

#[async_trait]
impl PermissionChecker for ChannelPermissionChecker {
    async fn check(&self, source: &Source, format: Option<&Format>) -> bool {
        let current = source.disabled.as_deref();
        if current.is_some_and(|r| !r.starts_with(MISSING_PERMISSIONS)) {
            return true;
        }

        let missing = self.missing(source, format);
        if !missing.is_empty() {
            let reason = format!(
                "{MISSING_PERMISSIONS} {}",
                missing
                    .iter()
                    .map(Permission::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            if current != Some(reason.as_str()) {
                match self.store.set_source_disabled(&source.id, Some(&reason)).await {
                    Ok(()) => tracing::info!(source = %source.id, guild = %source.guild, %reason, "Disabled source"),
                    Err(e) => tracing::error!(source = %source.id, %reason, error = %e, "Failed to disable source"),
                }
            }
            return true;
        }

        if current.is_some() {
            match self.store.set_source_disabled(&source.id, None).await {
                Ok(()) => tracing::info!(source = %source.id, guild = %source.guild, "Enabled source for found permissions"),
                Err(e) => tracing::error!(source = %source.id, error = %e, "Failed to enable source after permissions found"),
            }
        }
        false
    }
}

/// Outcome of a limit pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitChanges {
    pub disabled: Vec<String>,
    pub enabled: Vec<String>,
}

/// Disable sources of a guild past its feed limit and re-enable those back
/// under it
///
/// The limit of a guild is its override in `limits`, else `default_max`; a
/// limit of 0 means unlimited. Sources are counted in slice order, skipping
/// those disabled for other reasons. `sources` is updated in place to match
/// what is written to the store.
pub async fn enforce_limits(
    sources: &mut [Source],
    limits: &HashMap<String, usize>,
    default_max: usize,
    store: &dyn DataStore,
) -> Result<LimitChanges> {
    let mut changes = LimitChanges::default();
    let mut counts: HashMap<String, usize> = HashMap::new();

    for source in sources.iter_mut() {
        let limited = source.disabled.as_deref() == Some(EXCEEDED_FEED_LIMIT);
        if source.disabled.is_some() && !limited {
            continue;
        }

        let limit = limits.get(&source.guild).copied().unwrap_or(default_max);
        let count = counts.entry(source.guild.clone()).or_default();
        *count += 1;
        let over = limit > 0 && *count > limit;

        if over && !limited {
            store
                .set_source_disabled(&source.id, Some(EXCEEDED_FEED_LIMIT))
                .await?;
            source.disabled = Some(EXCEEDED_FEED_LIMIT.to_string());
            changes.disabled.push(source.id.clone());
        } else if !over && limited {
            store.set_source_disabled(&source.id, None).await?;
            source.disabled = None;
            changes.enabled.push(source.id.clone());
        }
    }

    if !changes.disabled.is_empty() || !changes.enabled.is_empty() {
        tracing::info!(
            disabled = changes.disabled.len(),
            enabled = changes.enabled.len(),
            "Applied feed limits"
        );
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn store_with(sources: &[Source]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for s in sources {
            store.upsert_source(s.clone()).await;
        }
        store
    }

    fn embed_format(feed: &str) -> Format {
        Format {
            feed: feed.into(),
            text: None,
            embeds: vec![serde_json::json!({"title": "x"})],
        }
    }

    #[tokio::test]
    async fn test_missing_permissions_disable() {
        let source = Source::new("s", "https://a.test/rss", "g", "c");
        let store = store_with(&[source.clone()]).await;
        let directory = StaticDirectory::new().with_channel("g", "c", [Permission::ViewChannel]);
        let checker = ChannelPermissionChecker::new(Arc::new(directory), store.clone());

        assert!(checker.check(&source, Some(&embed_format("s"))).await);
        assert_eq!(
            store.source("s").await.unwrap().disabled.as_deref(),
            Some("Missing permissions SEND_MESSAGES, EMBED_LINKS")
        );
    }

    #[tokio::test]
    async fn test_embed_links_only_needed_with_embeds() {
        let source = Source::new("s", "https://a.test/rss", "g", "c");
        let store = store_with(&[source.clone()]).await;
        let directory = StaticDirectory::new().with_channel(
            "g",
            "c",
            [Permission::ViewChannel, Permission::SendMessages],
        );
        let checker = ChannelPermissionChecker::new(Arc::new(directory), store.clone());

        assert!(!checker.check(&source, None).await);
        assert!(checker.check(&source, Some(&embed_format("s"))).await);
    }

    #[tokio::test]
    async fn test_regained_permissions_enable() {
        let mut source = Source::new("s", "https://a.test/rss", "g", "c");
        source.disabled = Some("Missing permissions SEND_MESSAGES".into());
        let store = store_with(&[source.clone()]).await;
        let checker = ChannelPermissionChecker::new(Arc::new(StaticDirectory::open()), store.clone());

        assert!(!checker.check(&source, None).await);
        assert!(store.source("s").await.unwrap().disabled.is_none());
    }

    #[tokio::test]
    async fn test_other_reason_stays_disabled() {
        let mut source = Source::new("s", "https://a.test/rss", "g", "c");
        source.disabled = Some("Disabled by owner".into());
        let store = store_with(&[source.clone()]).await;
        let checker = ChannelPermissionChecker::new(Arc::new(StaticDirectory::open()), store.clone());

        assert!(checker.check(&source, None).await);
        assert_eq!(
            store.source("s").await.unwrap().disabled.as_deref(),
            Some("Disabled by owner")
        );
    }

    #[tokio::test]
    async fn test_enforce_limits() {
        let mut sources: Vec<Source> = (0..3)
            .map(|i| Source::new(format!("s{i}"), format!("https://{i}.test/rss"), "g", "c"))
            .collect();
        let store = store_with(&sources).await;

        let limits = HashMap::from([("g".to_string(), 2)]);
        let changes = enforce_limits(&mut sources, &limits, 0, store.as_ref()).await.unwrap();
        assert_eq!(changes.disabled, vec!["s2".to_string()]);
        assert_eq!(sources[2].disabled.as_deref(), Some(EXCEEDED_FEED_LIMIT));

        let changes = enforce_limits(&mut sources, &HashMap::new(), 0, store.as_ref()).await.unwrap();
        assert_eq!(changes.enabled, vec!["s2".to_string()]);
        assert!(store.source("s2").await.unwrap().disabled.is_none());
    }
}
