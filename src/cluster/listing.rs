//! Hierarchical listing over the cluster index.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::index::ClusterIndex;

/// One object row of an aggregated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub backend: String,
}

/// Result of [`aggregate_list`]: object rows newest first, then the folded
/// common prefixes in lexicographic order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AggregateListing {
    pub contents: Vec<ListingRow>,
    pub common_prefixes: Vec<String>,
}

/// List the keys under `prefix`.
///
/// When `delimiter` is non-empty, a key whose remainder after `prefix`
/// contains the delimiter is folded into `prefix + remainder[..=delimiter]`.
/// Every other matching key becomes a content row.
pub fn aggregate_list(index: &ClusterIndex, prefix: &str, delimiter: Option<&str>) -> AggregateListing {
    let delimiter = delimiter.filter(|d| !d.is_empty());
    let mut contents = Vec::new();
    let mut prefixes = BTreeSet::new();

    for (key, location) in index {
        let Some(remainder) = key.strip_prefix(prefix) else {
            continue;
        };
        if let Some(delim) = delimiter {
            if let Some(pos) = remainder.find(delim) {
                let end = prefix.len() + pos + delim.len();
                prefixes.insert(key[..end].to_string());
                continue;
            }
        }
        contents.push(ListingRow {
            key: key.clone(),
            size: location.size,
            etag: location.etag.clone(),
            last_modified: location.last_modified,
            backend: location.backend.clone(),
        });
    }

    contents.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| a.key.cmp(&b.key))
    });

    AggregateListing {
        contents,
        common_prefixes: prefixes.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ObjectLocation;
    use chrono::TimeZone;

    fn index(entries: &[(&str, u32)]) -> ClusterIndex {
        entries
            .iter()
            .map(|(key, day)| {
                (
                    key.to_string(),
                    ObjectLocation {
                        backend: "alpha".into(),
                        size: 1,
                        last_modified: Utc.with_ymd_and_hms(2024, 1, *day, 0, 0, 0).unwrap(),
                        etag: format!("etag-{key}"),
                        version_id: None,
                    },
                )
            })
            .collect()
    }

    fn keys(listing: &AggregateListing) -> Vec<&str> {
        listing.contents.iter().map(|r| r.key.as_str()).collect()
    }

    #[test]
    fn test_fold_with_delimiter() {
        let idx = index(&[("a/x", 1), ("a/y/z", 2), ("b", 3)]);
        let listing = aggregate_list(&idx, "a/", Some("/"));
        assert_eq!(keys(&listing), vec!["a/x"]);
        assert_eq!(listing.common_prefixes, vec!["a/y/"]);
    }

    #[test]
    fn test_root_listing_folds_top_level() {
        let idx = index(&[("a/x", 1), ("a/y/z", 2), ("b", 3), ("c/d", 4)]);
        let listing = aggregate_list(&idx, "", Some("/"));
        assert_eq!(keys(&listing), vec!["b"]);
        assert_eq!(listing.common_prefixes, vec!["a/", "c/"]);
    }

    #[test]
    fn test_empty_delimiter_disables_folding() {
        let idx = index(&[("a/x", 1), ("a/y/z", 2)]);
        for delimiter in [None, Some("")] {
            let listing = aggregate_list(&idx, "a/", delimiter);
            assert_eq!(keys(&listing), vec!["a/y/z", "a/x"]);
            assert!(listing.common_prefixes.is_empty());
        }
    }

    #[test]
    fn test_newest_first_with_key_tiebreak() {
        let idx = index(&[("old", 1), ("new", 9), ("mid-b", 5), ("mid-a", 5)]);
        let listing = aggregate_list(&idx, "", None);
        assert_eq!(keys(&listing), vec!["new", "mid-a", "mid-b", "old"]);
    }

    #[test]
    fn test_multichar_delimiter() {
        let idx = index(&[("logs--2024--jan", 1), ("logs--readme", 2)]);
        let listing = aggregate_list(&idx, "logs--", Some("--"));
        assert_eq!(keys(&listing), vec!["logs--readme"]);
        assert_eq!(listing.common_prefixes, vec!["logs--2024--"]);
    }

    #[test]
    fn test_every_matching_key_appears_once() {
        let idx = index(&[("p/1", 1), ("p/2/a", 2), ("p/2/b", 3), ("p/3/c/d", 4), ("q", 5)]);
        let listing = aggregate_list(&idx, "p/", Some("/"));
        for key in idx.keys().filter(|k| k.starts_with("p/")) {
            let as_row = listing.contents.iter().filter(|r| &r.key == key).count();
            let as_prefix = listing
                .common_prefixes
                .iter()
                .filter(|p| key.starts_with(p.as_str()))
                .count();
            assert_eq!(as_row + as_prefix, 1, "key {key}");
        }
        assert_eq!(listing.common_prefixes, vec!["p/2/", "p/3/"]);
    }
}
