//! Fixed-capacity batching of aggregated sources
//!
//! Plain source lists are sliced in map order; custom-settings sources follow
//! in their own lane. A source list is never split across batches.

use serde::{Deserialize, Serialize};

use super::aggregator::{CustomMap, SourceList, SourceMap};
use crate::models::SourceSettings;

/// Batch lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Plain,
    Custom,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// One fetch of one URL on behalf of its sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchUnit {
    pub url: String,
    pub sources: SourceList,
    /// Present only in the custom lane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SourceSettings>,
}

impl FetchUnit {
    pub fn source_ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }
}

/// Bounded group of fetch units dispatched to one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub lane: Lane,
    /// Position within its lane
    pub number: usize,
    pub units: Vec<FetchUnit>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|u| u.url.as_str())
    }
}

/// Both lanes of a cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    pub plain: Vec<Batch>,
    pub custom: Vec<Batch>,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.custom.is_empty()
    }

    /// Total number of batches
    pub fn len(&self) -> usize {
        self.plain.len() + self.custom.len()
    }

    pub fn unit_count(&self) -> usize {
        self.iter().map(Batch::len).sum()
    }

    /// Batches in dispatch order: plain lane first
    pub fn iter(&self) -> impl Iterator<Item = &Batch> {
        self.plain.iter().chain(self.custom.iter())
    }

    pub fn into_ordered(self) -> Vec<Batch> {
        let mut all = self.plain;
        all.extend(self.custom);
        all
    }
}

fn slice(lane: Lane, units: impl Iterator<Item = FetchUnit>, capacity: usize) -> Vec<Batch> {
    let capacity = capacity.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::with_capacity(capacity);

    for unit in units {
        if current.len() >= capacity {
            batches.push(Batch {
                lane,
                number: batches.len(),
                units: std::mem::take(&mut current),
            });
        }
        current.push(unit);
    }

    if !current.is_empty() {
        batches.push(Batch {
            lane,
            number: batches.len(),
            units: current,
        });
    }
    batches
}

/// Slice both lanes into batches of at most `capacity` units
pub fn plan_batches(plain: &SourceMap, custom: &CustomMap, capacity: usize) -> BatchPlan {
    let plain_units = plain.iter().map(|(url, sources)| FetchUnit {
        url: url.clone(),
        sources: sources.clone(),
        settings: None,
    });

    let custom_units = custom.iter().map(|(id, meta)| FetchUnit {
        url: meta.source.url.clone(),
        sources: SourceList::from([(id.clone(), meta.clone())]),
        settings: meta.source.settings.clone(),
    });

    BatchPlan {
        plain: slice(Lane::Plain, plain_units, capacity),
        custom: slice(Lane::Custom, custom_units, capacity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryMeta, Source};

    fn meta(id: &str, url: &str) -> DeliveryMeta {
        DeliveryMeta {
            source: Source::new(id, url, "g", "c"),
            format: None,
            filtered_formats: Vec::new(),
            subscribers: Vec::new(),
            date_settings: Default::default(),
        }
    }

    fn plain_map(urls: usize) -> SourceMap {
        (0..urls)
            .map(|i| {
                let url = format!("https://{i:03}.test/rss");
                let list = SourceList::from([(format!("s{i}"), meta(&format!("s{i}"), &url))]);
                (url, list)
            })
            .collect()
    }

    #[test]
    fn test_exact_multiple() {
        let plan = plan_batches(&plain_map(4), &CustomMap::new(), 2);
        assert_eq!(plan.plain.len(), 2);
        assert!(plan.plain.iter().all(|b| b.len() == 2));
        assert_eq!(plan.plain[1].number, 1);
    }

    #[test]
    fn test_remainder_and_order() {
        let plan = plan_batches(&plain_map(5), &CustomMap::new(), 2);
        let sizes: Vec<_> = plan.plain.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let urls: Vec<_> = plan.iter().flat_map(|b| b.urls()).collect();
        let expected: Vec<_> = plain_map(5).keys().cloned().collect();
        assert_eq!(urls, expected);
    }

    #[test]
    fn test_custom_lane_after_plain() {
        let mut custom = CustomMap::new();
        custom.insert("x".into(), meta("x", "https://000.test/rss"));
        custom.insert("y".into(), meta("y", "https://000.test/rss"));

        let plan = plan_batches(&plain_map(1), &custom, 10);
        let ordered = plan.into_ordered();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].lane, Lane::Plain);
        assert_eq!(ordered[1].lane, Lane::Custom);
        assert_eq!(ordered[1].len(), 2);
        assert_eq!(ordered[1].units[0].source_ids(), vec!["x".to_string()]);
    }

    #[test]
    fn test_empty_input() {
        let plan = plan_batches(&SourceMap::new(), &CustomMap::new(), 3);
        assert!(plan.is_empty());
        assert_eq!(plan.unit_count(), 0);
    }

    #[test]
    fn test_zero_capacity_treated_as_one() {
        let plan = plan_batches(&plain_map(3), &CustomMap::new(), 0);
        assert_eq!(plan.plain.len(), 3);
    }
}
