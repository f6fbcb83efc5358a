//! Turns raw source payloads into canonical [`SyncItem`]s.
//!
//! All category-specific field extraction happens here. Instants are
//! converted to UTC and truncated to whole seconds before hashing so that the
//! content hash and the stored `end_time` are identical from run to run.
use crate::error::ValidationError;
use crate::model::{Category, RawItem, SyncItem};
use crate::sanitize::sanitize;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn normalize(raw: &RawItem) -> Result<SyncItem, ValidationError> {
    let f = &raw.fields;
    let (source_id, start_time, end_time) = match raw.category {
        Category::Mission => {
            let id = identity(f, "id")?;
            let start = required_instant(f, "claimedOn")?;
            let secs = required_seconds(f, "maxCompletionTimeInSecs")?;
            if secs < 0 {
                return Err(ValidationError::EndBeforeStart);
            }
            let end = Duration::try_seconds(secs)
                .and_then(|d| start.checked_add_signed(d))
                .ok_or_else(|| ValidationError::BadTime {
                    field: "maxCompletionTimeInSecs",
                    value: secs.to_string(),
                })?;
            (id, start, end)
        }
        Category::Patch => {
            let id = identity(f, "id")?;
            let at = required_instant(f, "expires_at")?;
            (id, at, at)
        }
        Category::Upcoming => {
            let id = identity(f, "slug")?;
            let at = required_instant(f, "upcoming_start_date")?;
            (id, at, at)
        }
    };
    if end_time < start_time {
        return Err(ValidationError::EndBeforeStart);
    }

    let text = sanitize(raw);
    let content_hash = content_hash(&text.title, &text.summary, start_time, end_time);
    Ok(SyncItem {
        category: raw.category,
        source_id,
        title: text.title,
        summary: text.summary,
        start_time,
        end_time,
        content_hash,
    })
}

/// Deterministic fingerprint of the fields written to the calendar.
pub fn content_hash(
    title: &str,
    summary: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
    let end = end.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut hasher = Sha256::new();
    for part in [title, summary, start.as_str(), end.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    hex::encode(hasher.finalize())
}

fn identity(fields: &Value, key: &'static str) -> Result<String, ValidationError> {
    let id = match fields.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if id.is_empty() {
        return Err(ValidationError::MissingId(key));
    }
    Ok(id)
}

fn required_instant(fields: &Value, key: &'static str) -> Result<DateTime<Utc>, ValidationError> {
    let value = match fields.get(key) {
        None | Some(Value::Null) => return Err(ValidationError::MissingTime(key)),
        Some(v) => v,
    };
    parse_instant(value).ok_or_else(|| ValidationError::BadTime {
        field: key,
        value: value.to_string(),
    })
}

fn required_seconds(fields: &Value, key: &'static str) -> Result<i64, ValidationError> {
    let value = match fields.get(key) {
        None | Some(Value::Null) => return Err(ValidationError::MissingTime(key)),
        Some(v) => v,
    };
    let secs = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    secs.ok_or_else(|| ValidationError::BadTime {
        field: key,
        value: value.to_string(),
    })
}

/// Accepts epoch seconds (integer, float or numeric string) and RFC 3339.
fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64))?,
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<i64>() {
                Ok(secs) => secs,
                Err(_) => DateTime::parse_from_rfc3339(s).ok()?.timestamp(),
            }
        }
        _ => return None,
    };
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn mission(fields: Value) -> RawItem {
        RawItem::new(Category::Mission, fields)
    }

    #[test]
    fn mission_window_comes_from_claim_and_duration() {
        let item = normalize(&mission(json!({
            "id": "abc",
            "title": "Task",
            "claimedOn": "2024-06-01T10:00:00.250+02:00",
            "maxCompletionTimeInSecs": 3600,
        })))
        .unwrap();
        assert_eq!(item.source_id, "abc");
        assert_eq!(item.start_time, Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        assert_eq!(item.end_time, Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn equivalent_offsets_hash_identically() {
        let a = normalize(&mission(json!({
            "id": 7, "title": "T", "claimedOn": "2024-06-01T10:00:00+02:00", "maxCompletionTimeInSecs": "60",
        })))
        .unwrap();
        let b = normalize(&mission(json!({
            "id": "7", "title": "T", "claimedOn": "2024-06-01T08:00:00Z", "maxCompletionTimeInSecs": 60,
        })))
        .unwrap();
        assert_eq!(a.source_id, b.source_id);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn content_change_changes_hash() {
        let base = json!({ "id": "p", "message": "one", "expires_at": 1_717_000_000 });
        let mut changed = base.clone();
        changed["message"] = json!("two");
        let a = normalize(&RawItem::new(Category::Patch, base)).unwrap();
        let b = normalize(&RawItem::new(Category::Patch, changed)).unwrap();
        assert_ne!(a.content_hash, b.content_hash);
        assert_eq!(a.start_time, a.end_time);
    }

    #[test]
    fn upcoming_uses_slug_and_epoch_start() {
        let item = normalize(&RawItem::new(
            Category::Upcoming,
            json!({ "slug": "x9y8", "codename": "OWL", "upcoming_start_date": 1_717_000_000.7 }),
        ))
        .unwrap();
        assert_eq!(item.source_id, "x9y8");
        assert_eq!(item.start_time.timestamp(), 1_717_000_000);
    }

    #[test]
    fn missing_or_bad_times_are_rejected() {
        let err = normalize(&mission(json!({ "id": "a", "maxCompletionTimeInSecs": 10 }))).unwrap_err();
        assert_eq!(err, ValidationError::MissingTime("claimedOn"));

        let err = normalize(&mission(json!({
            "id": "a", "claimedOn": "yesterday", "maxCompletionTimeInSecs": 10,
        })))
        .unwrap_err();
        assert!(matches!(err, ValidationError::BadTime { field: "claimedOn", .. }));

        let err = normalize(&mission(json!({
            "id": "a", "claimedOn": "2024-06-01T08:00:00Z", "maxCompletionTimeInSecs": -5,
        })))
        .unwrap_err();
        assert_eq!(err, ValidationError::EndBeforeStart);

        let err = normalize(&RawItem::new(Category::Patch, json!({ "id": "p", "expires_at": null }))).unwrap_err();
        assert_eq!(err, ValidationError::MissingTime("expires_at"));
    }

    #[test]
    fn out_of_range_duration_is_rejected() {
        for secs in [json!(9_000_000_000_000i64), json!(i64::MAX), json!(1e300)] {
            let err = normalize(&mission(json!({
                "id": "a", "claimedOn": "2024-06-01T08:00:00Z", "maxCompletionTimeInSecs": secs,
            })))
            .unwrap_err();
            assert!(
                matches!(err, ValidationError::BadTime { field: "maxCompletionTimeInSecs", .. }),
                "unexpected {err:?}"
            );
        }
    }

    #[test]
    fn missing_identity_is_rejected() {
        let err = normalize(&RawItem::new(
            Category::Upcoming,
            json!({ "id": "not-a-slug", "upcoming_start_date": 1 }),
        ))
        .unwrap_err();
        assert_eq!(err, ValidationError::MissingId("slug"));
    }
}
