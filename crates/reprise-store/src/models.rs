//! The persisted store document.
//!
//! The on-disk file is a single JSON object with `filters`, `media` and
//! `stats`. Every field carries a serde default so a file written by an
//! older build loads into a fully shaped document, and unknown top-level
//! fields are carried through untouched.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use reprise_shared::constants::STORE_FORMAT_VERSION;
use reprise_shared::{Filter, MediaDescriptor, ValidationError};

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreDocument {
    #[serde(default)]
    pub filters: FilterMap,
    #[serde(default)]
    pub media: BTreeMap<Uuid, MediaDescriptor>,
    #[serde(default)]
    pub stats: StoreStats,
    /// Top-level fields this build does not know about.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StoreDocument {
    /// Recompute the counters from live data.
    pub fn refresh_stats(&mut self) {
        self.stats.last_updated = Utc::now();
        self.stats.total_filters = self.filters.len();
        self.stats.total_media = self.media.len();
        self.stats.version = STORE_FORMAT_VERSION.to_string();
    }

    /// Every filter has content and names only known media.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (_, filter) in self.filters.iter() {
            filter.validate()?;
            if let Some(id) = filter.media.iter().find(|id| !self.media.contains_key(id)) {
                return Err(ValidationError::UnknownMedia(*id));
            }
        }
        Ok(())
    }

    /// Same filters and media, ignoring bookkeeping.
    pub fn same_content(&self, other: &Self) -> bool {
        self.filters == other.filters && self.media == other.media
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Summary counters. Recomputed on every persist and never trusted from disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_loaded: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_filters: usize,
    #[serde(default)]
    pub total_media: usize,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    STORE_FORMAT_VERSION.to_string()
}

impl Default for StoreStats {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created: now,
            last_updated: now,
            last_loaded: None,
            total_filters: 0,
            total_media: 0,
            version: default_version(),
        }
    }
}

// ---------------------------------------------------------------------------
// FilterMap
// ---------------------------------------------------------------------------

/// Keyword → filter map that remembers insertion order.
///
/// Replacing an existing keyword keeps its original position. On disk it is
/// a plain JSON object whose key order is the insertion order, so reload
/// order follows file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterMap {
    order: Vec<String>,
    entries: HashMap<String, Filter>,
}

impl FilterMap {
    pub fn get(&self, keyword: &str) -> Option<&Filter> {
        self.entries.get(keyword)
    }

    pub fn contains_key(&self, keyword: &str) -> bool {
        self.entries.contains_key(keyword)
    }

    pub fn insert(&mut self, keyword: String, filter: Filter) -> Option<Filter> {
        match self.entries.insert(keyword.clone(), filter) {
            Some(previous) => Some(previous),
            None => {
                self.order.push(keyword);
                None
            }
        }
    }

    pub fn remove(&mut self, keyword: &str) -> Option<Filter> {
        let removed = self.entries.remove(keyword)?;
        self.order.retain(|k| k != keyword);
        Some(removed)
    }

    pub fn keywords(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Filter)> {
        self.order
            .iter()
            .filter_map(|keyword| self.entries.get_key_value(keyword))
    }

    pub fn values(&self) -> impl Iterator<Item = &Filter> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for FilterMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl<'de> Deserialize<'de> for FilterMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FilterMapVisitor;

        impl<'de> Visitor<'de> for FilterMapVisitor {
            type Value = FilterMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of keyword to filter")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FilterMap, A::Error> {
                let mut map = FilterMap::default();
                while let Some((keyword, filter)) = access.next_entry::<String, Filter>()? {
                    map.insert(keyword, filter);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(FilterMapVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_filter(text: &str) -> Filter {
        Filter::new(text.into(), Vec::new(), Vec::new(), None).unwrap()
    }

    #[test]
    fn test_insertion_order_kept_on_replace() {
        let mut map = FilterMap::default();
        map.insert("zeta".into(), text_filter("1"));
        map.insert("alpha".into(), text_filter("2"));
        map.insert("zeta".into(), text_filter("3"));

        let keys: Vec<_> = map.keywords().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
        assert_eq!(map.get("zeta").unwrap().text, "3");
    }

    #[test]
    fn test_json_preserves_order() {
        let mut map = FilterMap::default();
        for keyword in ["mm", "aa", "zz", "bb"] {
            map.insert(keyword.into(), text_filter(keyword));
        }
        let json = serde_json::to_string(&map).unwrap();
        let back: FilterMap = serde_json::from_str(&json).unwrap();
        let keys: Vec<_> = back.keywords().cloned().collect();
        assert_eq!(keys, vec!["mm", "aa", "zz", "bb"]);
    }

    #[test]
    fn test_validate_checks_content_and_media_refs() {
        let mut doc = StoreDocument::default();
        doc.filters.insert("fine".into(), text_filter("x"));
        assert!(doc.validate().is_ok());

        let missing = Uuid::new_v4();
        let filter = Filter::new(String::new(), Vec::new(), vec![missing], None).unwrap();
        doc.filters.insert("dangling".into(), filter);
        assert_eq!(doc.validate(), Err(ValidationError::UnknownMedia(missing)));

        let raw = r#"{ "filters": { "blank": { "text": "", "entities": [], "media": [] } } }"#;
        let blank: StoreDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(blank.validate(), Err(ValidationError::EmptyContent));
    }

    #[test]
    fn test_old_document_gets_defaults() {
        let raw = r#"{
            "filters": { "hello": { "text": "hi", "entities": [], "media": [] } },
            "adminCommands": {}
        }"#;
        let doc: StoreDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.filters.len(), 1);
        assert!(doc.media.is_empty());
        assert_eq!(doc.stats.version, STORE_FORMAT_VERSION);
        assert!(doc.extra.contains_key("adminCommands"));

        let out = serde_json::to_value(&doc).unwrap();
        assert!(out.get("adminCommands").is_some());
    }
}
