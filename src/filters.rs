//! # Filter Set Module
//!
//! ## Purpose
//! Canonical representation of the catalog's filter panel state. Two filter
//! sets that differ only in insertion order or in empty values must produce
//! the same canonical signature, because that signature is the basis of
//! cache keys and of the resort-without-refetch memo.
//!
//! ## Input/Output Specification
//! - **Input**: Key-value filter selections (text, multi-select lists, ranges)
//! - **Output**: A canonical, order-insensitive signature string
//! - **Equivalence**: Two sets are equal iff their signatures are equal

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sorter::SortKey;

/// A single filter value as selected in the UI.
///
/// Externally tagged on purpose: cache entries are binary-encoded for the
/// durable tier, which cannot round-trip untagged enums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    /// Free-text filter (e.g. a search term)
    Text(String),
    /// Exact numeric filter
    Number(f64),
    /// Boolean toggle
    Flag(bool),
    /// Multi-select filter (e.g. a set of makes)
    List(Vec<String>),
    /// Range filter with optional bounds
    Range { min: Option<f64>, max: Option<f64> },
}

impl FilterValue {
    /// A value that constrains nothing is dropped from the canonical form
    fn is_empty(&self) -> bool {
        match self {
            FilterValue::Text(s) => s.trim().is_empty(),
            FilterValue::Number(_) | FilterValue::Flag(_) => false,
            FilterValue::List(items) => items.is_empty(),
            FilterValue::Range { min, max } => min.is_none() && max.is_none(),
        }
    }

    /// Normalize the value for signature purposes (list order is irrelevant)
    fn normalized(&self) -> FilterValue {
        match self {
            FilterValue::List(items) => {
                let mut sorted = items.clone();
                sorted.sort();
                FilterValue::List(sorted)
            }
            other => other.clone(),
        }
    }
}

/// An order-insensitive bag of filter selections.
///
/// Backed by a `BTreeMap` so iteration is always key-sorted; the canonical
/// signature therefore does not depend on insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSet {
    values: BTreeMap<String, FilterValue>,
}

impl FilterSet {
    /// Create an empty filter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a filter value, replacing any previous value for the key
    pub fn set(&mut self, key: impl Into<String>, value: FilterValue) -> &mut Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Remove a filter by key
    pub fn remove(&mut self, key: &str) -> Option<FilterValue> {
        self.values.remove(key)
    }

    /// Look up a filter value
    pub fn get(&self, key: &str) -> Option<&FilterValue> {
        self.values.get(key)
    }

    /// True when no non-empty filter is active
    pub fn is_empty(&self) -> bool {
        self.values.values().all(FilterValue::is_empty)
    }

    /// Iterate over the active (non-empty) filters in key order
    pub fn iter_active(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.values
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Canonical signature: empty values dropped, keys alphabetical,
    /// list values sorted, stable JSON stringification.
    pub fn signature(&self) -> String {
        let canonical: BTreeMap<&str, FilterValue> = self
            .values
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.as_str(), v.normalized()))
            .collect();
        // BTreeMap serializes in key order, so the output is stable
        serde_json::to_string(&canonical).unwrap_or_else(|_| String::from("{}"))
    }

    /// Derive the cache key for this filter set under a sort key
    pub fn cache_key(&self, sort: &SortKey) -> String {
        format!("{}|{}", self.signature(), sort.signature())
    }
}

impl PartialEq for FilterSet {
    fn eq(&self, other: &Self) -> bool {
        self.signature() == other.signature()
    }
}

impl Eq for FilterSet {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorter::{SortDirection, SortField};

    #[test]
    fn test_signature_is_order_insensitive() {
        let mut a = FilterSet::new();
        a.set("make", FilterValue::List(vec!["Audi".into(), "BMW".into()]));
        a.set("year", FilterValue::Range { min: Some(2015.0), max: None });

        let mut b = FilterSet::new();
        b.set("year", FilterValue::Range { min: Some(2015.0), max: None });
        b.set("make", FilterValue::List(vec!["BMW".into(), "Audi".into()]));

        assert_eq!(a.signature(), b.signature());
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_values_are_dropped() {
        let mut a = FilterSet::new();
        a.set("make", FilterValue::List(vec![]));
        a.set("q", FilterValue::Text("  ".into()));
        a.set("price", FilterValue::Range { min: None, max: None });

        assert!(a.is_empty());
        assert_eq!(a.signature(), FilterSet::new().signature());
    }

    #[test]
    fn test_cache_key_includes_sort() {
        let filters = FilterSet::new();
        let asc = SortKey::new(SortField::Price, SortDirection::Asc);
        let desc = SortKey::new(SortField::Price, SortDirection::Desc);
        assert_ne!(filters.cache_key(&asc), filters.cache_key(&desc));
    }

    #[test]
    fn test_distinct_values_produce_distinct_signatures() {
        let mut a = FilterSet::new();
        a.set("mileage", FilterValue::Range { min: None, max: Some(60_000.0) });
        let mut b = FilterSet::new();
        b.set("mileage", FilterValue::Range { min: None, max: Some(90_000.0) });
        assert_ne!(a.signature(), b.signature());
    }
}
