//! Cadence assignment of sources

use std::collections::HashSet;

use crate::models::{ScheduleDef, Source, DEFAULT_SCHEDULE, SUPPORTER_SCHEDULE};

/// Decides which named cadence a source belongs to
pub trait CadenceResolver: Send + Sync {
    fn resolve(
        &self,
        source: &Source,
        schedules: &[ScheduleDef],
        supporter_guilds: &HashSet<String>,
    ) -> String;
}

/// Resolution order:
///
/// 1. a schedule whose `feeds` lists the source id
/// 2. the `supporter` schedule for elevated guilds, when supporters are enabled
///    and that schedule exists
/// 3. the first schedule with a keyword contained in the URL
/// 4. `default`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCadenceResolver {
    pub supporters_enabled: bool,
}

impl DefaultCadenceResolver {
    pub fn new(supporters_enabled: bool) -> Self {
        Self { supporters_enabled }
    }
}

impl CadenceResolver for DefaultCadenceResolver {
    fn resolve(
        &self,
        source: &Source,
        schedules: &[ScheduleDef],
        supporter_guilds: &HashSet<String>,
    ) -> String {
        if let Some(s) = schedules.iter().find(|s| s.feeds.contains(&source.id)) {
            return s.name.clone();
        }

        if self.supporters_enabled
            && supporter_guilds.contains(&source.guild)
            && schedules.iter().any(|s| s.name == SUPPORTER_SCHEDULE)
        {
            return SUPPORTER_SCHEDULE.to_string();
        }

        let url = source.url.to_lowercase();
        schedules
            .iter()
            .filter(|s| !s.is_default())
            .find(|s| {
                s.keywords
                    .iter()
                    .any(|k| !k.is_empty() && url.contains(&k.to_lowercase()))
            })
            .map(|s| s.name.clone())
            .unwrap_or_else(|| DEFAULT_SCHEDULE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedules() -> Vec<ScheduleDef> {
        let mut fast = ScheduleDef::new("fast", 2);
        fast.keywords = vec!["reddit".into()];
        let mut pinned = ScheduleDef::new("pinned", 5);
        pinned.feeds = vec!["s-pinned".into()];
        vec![
            ScheduleDef::new(DEFAULT_SCHEDULE, 10),
            fast,
            pinned,
            ScheduleDef::new(SUPPORTER_SCHEDULE, 3),
        ]
    }

    #[test]
    fn test_resolution_order() {
        let resolver = DefaultCadenceResolver::new(true);
        let elevated = HashSet::from(["vip".to_string()]);

        let pinned = Source::new("s-pinned", "https://www.reddit.com/r/rust.rss", "vip", "c");
        assert_eq!(resolver.resolve(&pinned, &schedules(), &elevated), "pinned");

        let vip = Source::new("s1", "https://www.reddit.com/r/rust.rss", "vip", "c");
        assert_eq!(resolver.resolve(&vip, &schedules(), &elevated), SUPPORTER_SCHEDULE);

        let keyword = Source::new("s2", "https://www.Reddit.com/r/rust.rss", "g", "c");
        assert_eq!(resolver.resolve(&keyword, &schedules(), &elevated), "fast");

        let plain = Source::new("s3", "https://blog.test/rss", "g", "c");
        assert_eq!(resolver.resolve(&plain, &schedules(), &elevated), DEFAULT_SCHEDULE);
    }

    #[test]
    fn test_supporters_disabled() {
        let resolver = DefaultCadenceResolver::new(false);
        let elevated = HashSet::from(["vip".to_string()]);
        let vip = Source::new("s1", "https://blog.test/rss", "vip", "c");
        assert_eq!(resolver.resolve(&vip, &schedules(), &elevated), DEFAULT_SCHEDULE);
    }
}
