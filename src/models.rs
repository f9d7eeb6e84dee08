// Core data structures for the feedcycle engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Identity of a single subscription
pub type SourceId = String;

/// Name of the cadence every unassigned source falls back to
pub const DEFAULT_SCHEDULE: &str = "default";

/// Name of the cadence reserved for elevated (supporter) tenants
pub const SUPPORTER_SCHEDULE: &str = "supporter";

/// One subscription binding a fetch URL to a delivery destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Source {
    pub id: SourceId,
    pub url: String,
    pub title: String,
    pub guild: String,   // owning tenant
    pub channel: String, // destination inside the tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SourceSettings>,
    /// Keyword filters keyed by item field (`title`, `description`, `link`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, Vec<String>>,
    /// Delivery-suppression reason, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<String>,
    /// Cadence the source was last assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl Source {
    /// Create a plain source with no custom settings
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        guild: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            guild: guild.into(),
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Attach per-fetch settings
    pub fn with_settings(mut self, settings: SourceSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Whether this source must be fetched on its own with distinct settings
    pub fn has_custom_settings(&self) -> bool {
        self.settings.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// Per-fetch configuration that forbids merging a source with others on its URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceSettings {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

impl SourceSettings {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.cookies.is_empty()
    }

    /// Render cookies as a single `Cookie` header value
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Message format of a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Format {
    pub feed: SourceId,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
}

impl Format {
    pub fn has_embeds(&self) -> bool {
        !self.embeds.is_empty()
    }
}

/// Alternative format used when its filters match an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FilteredFormat {
    pub feed: SourceId,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
}

/// Kind of subscriber mentioned on delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberKind {
    User,
    Role,
}

/// Recipient attached to a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub feed: SourceId,
    pub id: String,
    pub kind: SubscriberKind,
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
}

/// Tenant profile holding date rendering preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default)]
    pub date_language: Option<String>,
}

/// Date settings forwarded with every source so workers can render dates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DateSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl From<&Profile> for DateSettings {
    fn from(profile: &Profile) -> Self {
        Self {
            timezone: profile.timezone.clone(),
            format: profile.date_format.clone(),
            language: profile.date_language.clone(),
        }
    }
}

/// Per-source delivery metadata carried inside a source list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMeta {
    pub source: Source,
    #[serde(default)]
    pub format: Option<Format>,
    #[serde(default)]
    pub filtered_formats: Vec<FilteredFormat>,
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
    #[serde(default)]
    pub date_settings: DateSettings,
}

/// A named refresh cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDef {
    pub name: String,
    pub refresh_rate_minutes: u32,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub feeds: Vec<SourceId>,
}

impl ScheduleDef {
    pub fn new(name: impl Into<String>, refresh_rate_minutes: u32) -> Self {
        Self {
            name: name.into(),
            refresh_rate_minutes,
            keywords: Vec::new(),
            feeds: Vec::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_SCHEDULE
    }
}

/// One entry of a fetched feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
}

impl FeedItem {
    /// Stable identity: guid, else link, else a hash of title and description
    pub fn derive_id(guid: Option<&str>, link: Option<&str>, title: &str, description: Option<&str>) -> String {
        if let Some(guid) = guid.filter(|g| !g.is_empty()) {
            return guid.to_string();
        }
        if let Some(link) = link.filter(|l| !l.is_empty()) {
            return link.to_string();
        }
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(description.unwrap_or_default().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Value of a filterable field
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "title" => Some(self.title.as_str()),
            "description" => self.description.as_deref(),
            "link" => self.link.as_deref(),
            _ => None,
        }
    }
}

/// A newly found item attributed to the source that should receive it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredItem {
    pub source_id: SourceId,
    pub url: String,
    pub schedule: String,
    pub item: FeedItem,
}
