//! Typed view over the free-form metadata attached to each memory.
//!
//! The map stays open (callers may put anything in it), but the handful of
//! keys the engine reads are exposed through safe accessors that never fail:
//! a missing or malformed value yields the documented default.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `kind` value marking a synthetic thread aggregate record.
pub const THREAD_SUMMARY_KIND: &str = "thread_summary";

pub const KEY_TOPIC: &str = "topic";
pub const KEY_CATEGORY: &str = "category";
pub const KEY_IMPORTANCE: &str = "importance";
pub const KEY_ENTITIES: &str = "entities";
pub const KEY_SEEN_COUNT: &str = "seen_count";
pub const KEY_KIND: &str = "kind";
pub const KEY_ROLE: &str = "role";

/// Importance level of a memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Importance {
    /// Weight on a 0..=10 scale.
    pub fn weight(self) -> u8 {
        match self {
            Importance::Low => 3,
            Importance::Medium => 5,
            Importance::High => 8,
            Importance::Critical => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Importance::Low => "low",
            Importance::Medium => "medium",
            Importance::High => "high",
            Importance::Critical => "critical",
        }
    }
}

impl FromStr for Importance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Importance::Low),
            "medium" => Ok(Importance::Medium),
            "high" => Ok(Importance::High),
            "critical" => Ok(Importance::Critical),
            other => Err(format!("unknown importance level: {other}")),
        }
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form metadata map with typed accessors for well-known keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an arbitrary JSON value. Non-object values yield an empty map.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Metadata(map),
            _ => Metadata::default(),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Merge `other` over `self`; keys in `other` win.
    pub fn merge(&mut self, other: Metadata) {
        for (k, v) in other.0 {
            self.0.insert(k, v);
        }
    }

    /// True when every entry of `filter` is present here with an equal value.
    pub fn contains(&self, filter: &Metadata) -> bool {
        filter.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }

    fn str_value(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn topic(&self) -> Option<&str> {
        self.str_value(KEY_TOPIC)
    }

    pub fn category(&self) -> Option<&str> {
        self.str_value(KEY_CATEGORY)
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_value(KEY_KIND)
    }

    pub fn role(&self) -> Option<&str> {
        self.str_value(KEY_ROLE)
    }

    /// Importance level; unknown or missing values read as [`Importance::Medium`].
    pub fn importance(&self) -> Importance {
        self.str_value(KEY_IMPORTANCE)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    /// Repetition counter; defaults to 1, negative values read as 0.
    pub fn seen_count(&self) -> u64 {
        match self.0.get(KEY_SEEN_COUNT) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_i64().map(|v| v.max(0) as u64))
                .or_else(|| n.as_f64().map(|v| if v.is_finite() { v.max(0.0) as u64 } else { 1 }))
                .unwrap_or(1),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(1),
            _ => 1,
        }
    }

    /// Entity names; non-string entries are skipped.
    pub fn entities(&self) -> Vec<String> {
        match self.0.get(KEY_ENTITIES) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// True when this record is a synthetic thread aggregate.
    pub fn is_thread_summary(&self) -> bool {
        self.kind() == Some(THREAD_SUMMARY_KIND)
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Metadata(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn importance_defaults_to_medium() {
        assert_eq!(Metadata::new().importance(), Importance::Medium);
        let md = Metadata::new().with("importance", "urgent");
        assert_eq!(md.importance(), Importance::Medium);
        let md = Metadata::new().with("importance", json!(7));
        assert_eq!(md.importance(), Importance::Medium);
    }

    #[test]
    fn importance_is_case_insensitive() {
        let md = Metadata::new().with("importance", "CRITICAL");
        assert_eq!(md.importance(), Importance::Critical);
        assert_eq!(md.importance().weight(), 10);
    }

    #[test]
    fn seen_count_accepts_numbers_and_strings() {
        assert_eq!(Metadata::new().seen_count(), 1);
        assert_eq!(Metadata::new().with("seen_count", 4).seen_count(), 4);
        assert_eq!(Metadata::new().with("seen_count", -3).seen_count(), 0);
        assert_eq!(Metadata::new().with("seen_count", 2.9).seen_count(), 2);
        assert_eq!(Metadata::new().with("seen_count", "12").seen_count(), 12);
        assert_eq!(Metadata::new().with("seen_count", "many").seen_count(), 1);
    }

    #[test]
    fn blank_topic_reads_as_missing() {
        let md = Metadata::new().with("topic", "   ");
        assert_eq!(md.topic(), None);
    }

    #[test]
    fn contains_requires_every_filter_entry() {
        let md = Metadata::new().with("topic", "refund").with("category", "billing");
        assert!(md.contains(&Metadata::new().with("topic", "refund")));
        assert!(md.contains(&Metadata::new()));
        assert!(!md.contains(&Metadata::new().with("topic", "refund").with("lang", "en")));
        assert!(!md.contains(&Metadata::new().with("topic", "Refund")));
    }

    #[test]
    fn entities_skip_non_strings() {
        let md = Metadata::new().with("entities", json!(["Alice", 3, "Acme"]));
        assert_eq!(md.entities(), vec!["Alice".to_string(), "Acme".to_string()]);
    }

    #[test]
    fn serializes_as_plain_object() {
        let md = Metadata::new().with("kind", THREAD_SUMMARY_KIND);
        let value = serde_json::to_value(&md).unwrap();
        assert_eq!(value, json!({"kind": "thread_summary"}));
        assert!(md.is_thread_summary());
    }
}
