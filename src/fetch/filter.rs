//! Tag filters for selecting map features by category
//!
//! A filter maps an attribute key to the values it accepts. An element matches
//! when any of its tags is accepted by the filter entry for that key.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Values accepted for one tag key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagValues {
    /// Any value is accepted (written as `*`)
    Any,
    /// Exact values, plus substrings (written with a `~` prefix)
    Values {
        /// Values that must match exactly
        exact: BTreeSet<String>,
        /// Substrings that must occur in the value
        contains: Vec<String>,
    },
}

impl TagValues {
    /// Parse a list in the compact notation: `*`, `value`, `~substring`
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Self {
        let mut exact = BTreeSet::new();
        let mut contains = Vec::new();
        for value in values {
            let value = value.as_ref();
            if value == "*" {
                return TagValues::Any;
            }
            if value.contains('~') {
                let pattern = value.replace('~', "");
                if !pattern.is_empty() {
                    contains.push(pattern);
                }
            } else {
                exact.insert(value.to_string());
            }
        }
        TagValues::Values { exact, contains }
    }

    /// Whether `value` is accepted
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            TagValues::Any => true,
            TagValues::Values { exact, contains } => {
                exact.contains(value) || contains.iter().any(|p| value.contains(p.as_str()))
            }
        }
    }
}

/// Attribute key to accepted values
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagFilter {
    entries: BTreeMap<String, TagValues>,
}

impl TagFilter {
    /// Empty filter (matches nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept any value for `key`
    pub fn any(mut self, key: &str) -> Self {
        self.entries.insert(key.to_string(), TagValues::Any);
        self
    }

    /// Accept values for `key` in the compact notation
    pub fn values<S: AsRef<str>>(mut self, key: &str, values: &[S]) -> Self {
        self.entries.insert(key.to_string(), TagValues::parse(values));
        self
    }

    /// Build from a key to value-list table
    pub fn from_table<S: AsRef<str>>(table: &BTreeMap<String, Vec<S>>) -> Self {
        let entries = table
            .iter()
            .map(|(k, v)| (k.clone(), TagValues::parse(v)))
            .collect();
        Self { entries }
    }

    /// Filter entries in key order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &TagValues)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether the filter has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pure matcher over an element's tags
    pub fn matches(&self, tags: &HashMap<String, String>) -> bool {
        self.entries
            .iter()
            .any(|(key, accepted)| tags.get(key).is_some_and(|v| accepted.accepts(v)))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn wildcard_accepts_any_value_of_present_key() {
        let filter = TagFilter::new().any("building");
        assert!(filter.matches(&tags(&[("building", "yes")])));
        assert!(filter.matches(&tags(&[("building", "garage")])));
        assert!(!filter.matches(&tags(&[("highway", "primary")])));
    }

    #[test]
    fn exact_and_substring_values() {
        let filter = TagFilter::new().values("highway", &["primary", "~link"]);
        assert!(filter.matches(&tags(&[("highway", "primary")])));
        assert!(filter.matches(&tags(&[("highway", "motorway_link")])));
        assert!(!filter.matches(&tags(&[("highway", "residential")])));
    }

    #[test]
    fn any_matching_key_is_enough() {
        let filter = TagFilter::new()
            .values("natural", &["water"])
            .values("landuse", &["reservoir", "basin"]);
        assert!(filter.matches(&tags(&[("landuse", "basin"), ("natural", "wood")])));
        assert!(!filter.matches(&tags(&[("landuse", "forest")])));
    }

    #[test]
    fn star_anywhere_in_list_means_any() {
        assert_eq!(TagValues::parse(&["x", "*"]), TagValues::Any);
    }

    #[test]
    fn empty_filter_matches_nothing() {
        assert!(!TagFilter::new().matches(&tags(&[("a", "b")])));
    }

    #[test]
    fn builds_from_table_and_serializes() {
        let mut table = BTreeMap::new();
        table.insert("waterway".to_string(), vec!["river", "stream"]);
        table.insert("water".to_string(), vec!["*"]);
        let filter = TagFilter::from_table(&table);

        assert!(filter.matches(&tags(&[("waterway", "stream")])));
        assert!(filter.matches(&tags(&[("water", "lake")])));

        let json = serde_json::to_string(&filter).unwrap();
        let back: TagFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, filter);
    }
}
