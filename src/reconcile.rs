//! Diffs the current source items of one category against the stored
//! snapshot and drives the calendar towards the result.
//!
//! Planning is pure. Applying never aborts part-way: every calendar call is
//! attempted on its own, and a failed call leaves that identity's prior record
//! untouched so the same diff is recomputed on the next run.
use crate::calendar::{CalendarService, DeleteOutcome, UpdateOutcome};
use crate::db::Snapshot;
use crate::model::{Category, EventBody, SyncItem, SyncRecord};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    /// The source no longer reports the identity.
    Missing,
    /// The item's end time has passed.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub record: SyncRecord,
    pub reason: DeleteReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub category: Category,
    pub create: Vec<SyncItem>,
    pub update: Vec<(SyncRecord, SyncItem)>,
    pub delete: Vec<Deletion>,
    pub noop: Vec<(SyncRecord, SyncItem)>,
    /// Absent from this fetch but still inside the missing-run grace.
    pub retain: Vec<SyncRecord>,
    /// New identities whose end time had already passed; never created.
    pub expired_on_arrival: Vec<SyncItem>,
    /// Source-side repeats of an identity dropped in favour of the later one.
    pub duplicates: usize,
}

impl ReconciliationPlan {
    /// True when applying the plan would make no calendar calls.
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Compute the diff for `category`.
///
/// `current` is in fetch order; when an identity repeats, the later instance
/// wins. A prior record whose identity is absent is deleted once it has been
/// missing for `missing_runs_before_delete` consecutive runs (this one
/// included). Expiry by end time ignores that grace.
pub fn plan(
    category: Category,
    current: Vec<SyncItem>,
    mut prior: Snapshot,
    now: DateTime<Utc>,
    missing_runs_before_delete: u32,
) -> ReconciliationPlan {
    let mut order = Vec::new();
    let mut latest: HashMap<String, SyncItem> = HashMap::new();
    let mut duplicates = 0;
    for item in current.into_iter().filter(|i| i.category == category) {
        let id = item.source_id.clone();
        if latest.insert(id.clone(), item).is_some() {
            duplicates += 1;
        } else {
            order.push(id);
        }
    }

    let mut plan = ReconciliationPlan {
        category,
        create: Vec::new(),
        update: Vec::new(),
        delete: Vec::new(),
        noop: Vec::new(),
        retain: Vec::new(),
        expired_on_arrival: Vec::new(),
        duplicates,
    };

    for id in order {
        let Some(item) = latest.remove(&id) else {
            continue;
        };
        let expired = item.end_time < now;
        match prior.remove(&id) {
            None if expired => plan.expired_on_arrival.push(item),
            None => plan.create.push(item),
            Some(record) if expired => plan.delete.push(Deletion {
                record,
                reason: DeleteReason::Expired,
            }),
            Some(record) if record.content_hash == item.content_hash => {
                plan.noop.push((record, item))
            }
            Some(record) => plan.update.push((record, item)),
        }
    }

    let mut absent: Vec<SyncRecord> = prior.into_values().collect();
    absent.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    let threshold = i64::from(missing_runs_before_delete.max(1));
    for record in absent {
        if record.end_time < now {
            plan.delete.push(Deletion {
                record,
                reason: DeleteReason::Expired,
            });
        } else if record.missing_runs + 1 >= threshold {
            plan.delete.push(Deletion {
                record,
                reason: DeleteReason::Missing,
            });
        } else {
            plan.retain.push(record);
        }
    }
    plan
}

/// Per-category counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategorySummary {
    pub category: Option<Category>,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub recreated: usize,
    pub unchanged: usize,
    pub retained: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duplicates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl CategorySummary {
    pub fn new(category: Category) -> Self {
        Self {
            category: Some(category),
            ..Default::default()
        }
    }

    /// Counts as if `plan` had been applied without any failure.
    pub fn planned(plan: &ReconciliationPlan) -> Self {
        Self {
            created: plan.create.len(),
            updated: plan.update.len(),
            deleted: plan.delete.len(),
            unchanged: plan.noop.len(),
            retained: plan.retain.len(),
            skipped: plan.expired_on_arrival.len(),
            duplicates: plan.duplicates,
            ..Self::new(plan.category)
        }
    }
}

#[derive(Debug)]
pub struct ApplyOutcome {
    /// Snapshot to commit for the category.
    pub records: Vec<SyncRecord>,
    pub summary: CategorySummary,
}

/// Execute `plan` against `calendar` in delete, update, create order.
///
/// Each call is bounded by `op_timeout`; a timeout counts as a failure.
#[instrument(skip_all, fields(category = %plan.category))]
pub async fn apply(
    plan: ReconciliationPlan,
    calendar: &dyn CalendarService,
    calendar_id: &str,
    now: DateTime<Utc>,
    op_timeout: Duration,
) -> ApplyOutcome {
    let mut summary = CategorySummary::new(plan.category);
    summary.duplicates = plan.duplicates;
    summary.skipped = plan.expired_on_arrival.len();
    let mut records = Vec::with_capacity(plan.noop.len() + plan.update.len() + plan.create.len());

    for (mut record, _) in plan.noop {
        record.last_seen_at = now;
        record.missing_runs = 0;
        records.push(record);
        summary.unchanged += 1;
    }
    for mut record in plan.retain {
        record.missing_runs += 1;
        records.push(record);
        summary.retained += 1;
    }

    for Deletion { record, reason } in plan.delete {
        let result = bounded(op_timeout, calendar.delete_event(calendar_id, &record.target_event_id)).await;
        match result {
            Ok(outcome) => {
                info!(
                    source_id = %record.source_id,
                    target_event_id = %record.target_event_id,
                    ?reason,
                    already_absent = (outcome == DeleteOutcome::NotFound),
                    "deleted event"
                );
                summary.deleted += 1;
            }
            Err(err) => {
                warn!(?err, source_id = %record.source_id, target_event_id = %record.target_event_id, "delete failed");
                summary.failed += 1;
                records.push(record);
            }
        }
    }

    for (record, item) in plan.update {
        let event = EventBody::from(&item);
        let result = bounded(
            op_timeout,
            calendar.update_event(calendar_id, &record.target_event_id, &event),
        )
        .await;
        match result {
            Ok(UpdateOutcome::Updated) => {
                info!(source_id = %item.source_id, target_event_id = %record.target_event_id, "updated event");
                records.push(SyncRecord::from_item(&item, record.target_event_id, now));
                summary.updated += 1;
            }
            Ok(UpdateOutcome::Missing) => {
                warn!(source_id = %item.source_id, target_event_id = %record.target_event_id, "event vanished from calendar; recreating");
                match bounded(op_timeout, calendar.create_event(calendar_id, &event)).await {
                    Ok(event_id) => {
                        info!(source_id = %item.source_id, target_event_id = %event_id, "recreated event");
                        records.push(SyncRecord::from_item(&item, event_id, now));
                        summary.recreated += 1;
                    }
                    Err(err) => {
                        // The old event is gone, so its record is dropped and
                        // the identity comes back as new next run.
                        warn!(?err, source_id = %item.source_id, "recreate failed");
                        summary.failed += 1;
                    }
                }
            }
            Err(err) => {
                warn!(?err, source_id = %item.source_id, target_event_id = %record.target_event_id, "update failed");
                summary.failed += 1;
                records.push(record);
            }
        }
    }

    for item in plan.create {
        let event = EventBody::from(&item);
        match bounded(op_timeout, calendar.create_event(calendar_id, &event)).await {
            Ok(event_id) => {
                info!(source_id = %item.source_id, target_event_id = %event_id, "created event");
                records.push(SyncRecord::from_item(&item, event_id, now));
                summary.created += 1;
            }
            Err(err) => {
                warn!(?err, source_id = %item.source_id, "create failed");
                summary.failed += 1;
            }
        }
    }

    records.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    ApplyOutcome { records, summary }
}

async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("calendar call timed out after {:?}", limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn item(id: &str, hash: &str, end_offset_h: i64) -> SyncItem {
        let end = now() + chrono::Duration::hours(end_offset_h);
        SyncItem {
            category: Category::Patch,
            source_id: id.into(),
            title: format!("title {id}"),
            summary: String::new(),
            start_time: end,
            end_time: end,
            content_hash: hash.into(),
        }
    }

    fn record(id: &str, event: &str, hash: &str, end_offset_h: i64) -> SyncRecord {
        SyncRecord {
            category: Category::Patch,
            source_id: id.into(),
            target_event_id: event.into(),
            content_hash: hash.into(),
            end_time: now() + chrono::Duration::hours(end_offset_h),
            last_seen_at: now() - chrono::Duration::hours(1),
            missing_runs: 0,
        }
    }

    fn snapshot(records: Vec<SyncRecord>) -> Snapshot {
        records.into_iter().map(|r| (r.source_id.clone(), r)).collect()
    }

    fn ids(items: &[SyncItem]) -> Vec<&str> {
        items.iter().map(|i| i.source_id.as_str()).collect()
    }

    #[test]
    fn partitions_new_changed_unchanged_and_missing() {
        let prior = snapshot(vec![
            record("keep", "E1", "h1", 5),
            record("edit", "E2", "h2", 5),
            record("gone", "E3", "h3", 5),
        ]);
        let current = vec![item("keep", "h1", 5), item("edit", "h2b", 5), item("fresh", "h4", 5)];
        let plan = plan(Category::Patch, current, prior, now(), 1);

        assert_eq!(ids(&plan.create), vec!["fresh"]);
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].0.target_event_id, "E2");
        assert_eq!(plan.update[0].1.content_hash, "h2b");
        assert_eq!(plan.noop.len(), 1);
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].record.source_id, "gone");
        assert_eq!(plan.delete[0].reason, DeleteReason::Missing);
        assert!(!plan.is_noop());
    }

    #[test]
    fn still_reported_but_past_end_is_expired() {
        let prior = snapshot(vec![record("old", "E1", "h1", -1)]);
        let plan = plan(Category::Patch, vec![item("old", "h1", -1)], prior, now(), 1);
        assert!(plan.noop.is_empty());
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].reason, DeleteReason::Expired);
    }

    #[test]
    fn new_item_already_past_is_not_created() {
        let plan = plan(Category::Patch, vec![item("late", "h", -2)], Snapshot::new(), now(), 1);
        assert!(plan.create.is_empty());
        assert_eq!(ids(&plan.expired_on_arrival), vec!["late"]);
        assert!(plan.is_noop());
    }

    #[test]
    fn later_duplicate_wins() {
        let current = vec![item("dup", "first", 3), item("other", "o", 3), item("dup", "second", 3)];
        let plan = plan(Category::Patch, current, Snapshot::new(), now(), 1);
        assert_eq!(plan.duplicates, 1);
        assert_eq!(ids(&plan.create), vec!["dup", "other"]);
        assert_eq!(plan.create[0].content_hash, "second");
    }

    #[test]
    fn missing_grace_retains_until_threshold() {
        let prior = snapshot(vec![record("flaky", "E1", "h", 10)]);
        let first = plan(Category::Patch, Vec::new(), prior, now(), 2);
        assert!(first.delete.is_empty());
        assert_eq!(first.retain.len(), 1);

        let mut again = first.retain[0].clone();
        again.missing_runs = 1;
        let second = plan(Category::Patch, Vec::new(), snapshot(vec![again]), now(), 2);
        assert_eq!(second.delete.len(), 1);
        assert_eq!(second.delete[0].reason, DeleteReason::Missing);
    }

    #[test]
    fn grace_does_not_delay_time_expiry() {
        let prior = snapshot(vec![record("done", "E1", "h", -3)]);
        let plan = plan(Category::Patch, Vec::new(), prior, now(), 5);
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].reason, DeleteReason::Expired);
    }

    #[test]
    fn items_of_other_categories_are_ignored() {
        let mut stray = item("m", "h", 3);
        stray.category = Category::Mission;
        let plan = plan(Category::Patch, vec![stray], Snapshot::new(), now(), 1);
        assert!(plan.create.is_empty());
    }

    #[test]
    fn planned_summary_counts_buckets() {
        let prior = snapshot(vec![record("a", "E1", "h1", 5)]);
        let plan = plan(Category::Patch, vec![item("a", "h1", 5), item("b", "h2", 5)], prior, now(), 1);
        let summary = CategorySummary::planned(&plan);
        assert_eq!(summary.category, Some(Category::Patch));
        assert_eq!(summary.created, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.failed, 0);
    }
}
