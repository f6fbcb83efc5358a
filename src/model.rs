use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of source item. Each category is mirrored onto its own calendar and
/// reconciled independently of the others.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Mission,
    Patch,
    Upcoming,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Mission, Category::Patch, Category::Upcoming];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Mission => "mission",
            Category::Patch => "patch",
            Category::Upcoming => "upcoming",
        }
    }

    pub fn parse_category(s: &str) -> Option<Self> {
        match s {
            "mission" => Some(Category::Mission),
            "patch" => Some(Category::Patch),
            "upcoming" => Some(Category::Upcoming),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untyped payload as returned by the source platform. Only the normalizer
/// looks inside `fields`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub category: Category,
    pub fields: Value,
}

impl RawItem {
    pub fn new(category: Category, fields: Value) -> Self {
        Self { category, fields }
    }
}

/// Canonical, sanitized item. Times are UTC with whole-second precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItem {
    pub category: Category,
    pub source_id: String,
    pub title: String,
    pub summary: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub content_hash: String,
}

/// Persisted belief about one event currently living on the target calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub category: Category,
    pub source_id: String,
    pub target_event_id: String,
    pub content_hash: String,
    pub end_time: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Consecutive runs in which the source did not report this identity.
    pub missing_runs: i64,
}

impl SyncRecord {
    pub fn from_item(item: &SyncItem, target_event_id: String, seen_at: DateTime<Utc>) -> Self {
        Self {
            category: item.category,
            source_id: item.source_id.clone(),
            target_event_id,
            content_hash: item.content_hash.clone(),
            end_time: item.end_time,
            last_seen_at: seen_at,
            missing_runs: 0,
        }
    }
}

/// Calendar event payload handed to the target adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBody {
    pub summary: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl From<&SyncItem> for EventBody {
    fn from(item: &SyncItem) -> Self {
        Self {
            summary: item.title.clone(),
            description: item.summary.clone(),
            start: item.start_time,
            end: item.end_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_str() {
        for category in Category::ALL {
            assert_eq!(Category::parse_category(category.as_str()), Some(category));
        }
        assert_eq!(Category::parse_category("target"), None);
    }
}
