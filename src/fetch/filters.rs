//! Per-source keyword filters

use std::collections::BTreeMap;

use crate::models::FeedItem;

/// Whether `item` passes `filters`
///
/// No filters means everything passes. Otherwise any keyword found
/// (case-insensitively) in its field lets the item through.
pub fn passes_filters(item: &FeedItem, filters: &BTreeMap<String, Vec<String>>) -> bool {
    if filters.values().all(Vec::is_empty) {
        return true;
    }

    filters.iter().any(|(field, keywords)| {
        let Some(value) = item.field(field) else {
            return false;
        };
        let value = value.to_lowercase();
        keywords
            .iter()
            .filter(|k| !k.is_empty())
            .any(|k| value.contains(&k.to_lowercase()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> FeedItem {
        FeedItem {
            id: "1".into(),
            title: "Rust 1.80 Released".into(),
            description: Some("Release notes".into()),
            link: Some("https://blog.rust-lang.org/1.80".into()),
            published: None,
        }
    }

    fn filters(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(f, ks)| (f.to_string(), ks.iter().map(|k| k.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_no_filters_pass() {
        assert!(passes_filters(&item(), &BTreeMap::new()));
        assert!(passes_filters(&item(), &filters(&[("title", &[])])));
    }

    #[test]
    fn test_case_insensitive_match() {
        assert!(passes_filters(&item(), &filters(&[("title", &["rust"])])));
        assert!(passes_filters(&item(), &filters(&[("link", &["BLOG"])])));
    }

    #[test]
    fn test_no_match_blocks() {
        assert!(!passes_filters(&item(), &filters(&[("title", &["golang"])])));
        assert!(!passes_filters(&item(), &filters(&[("author", &["rust"])])));
    }
}
