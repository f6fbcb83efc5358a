use super::model::RunRow;
use crate::model::{Category, SyncRecord};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

pub type Pool = SqlitePool;

/// Prior snapshot for one category, keyed by `source_id`.
pub type Snapshot = HashMap<String, SyncRecord>;

/// Open (creating if needed) the SQLite state store at `path`.
pub async fn init_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    // WAL with FULL sync so a committed snapshot survives power loss.
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePool::connect_with(options)
        .await
        .with_context(|| format!("failed to open state store {}", path.display()))?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all, fields(category = %category))]
pub async fn load_records(pool: &Pool, category: Category) -> Result<Snapshot> {
    let rows = sqlx::query(
        "SELECT category, source_id, target_event_id, content_hash, end_time, last_seen_at, missing_runs \
         FROM sync_records WHERE category = ?",
    )
    .bind(category.as_str())
    .fetch_all(pool)
    .await?;

    let mut records = HashMap::with_capacity(rows.len());
    for row in rows {
        let record = record_from_row(&row)?;
        records.insert(record.source_id.clone(), record);
    }
    debug!(count = records.len(), "loaded prior snapshot");
    Ok(records)
}

/// Replace the stored snapshot for `category` with `records`, atomically.
#[instrument(skip_all, fields(category = %category, count = records.len()))]
pub async fn commit_records(pool: &Pool, category: Category, records: &[SyncRecord]) -> Result<()> {
    if let Some(stray) = records.iter().find(|r| r.category != category) {
        return Err(anyhow!(
            "record {}/{} does not belong to category {}",
            stray.category,
            stray.source_id,
            category
        ));
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM sync_records WHERE category = ?")
        .bind(category.as_str())
        .execute(&mut *tx)
        .await?;
    for record in records {
        sqlx::query(
            "INSERT INTO sync_records (category, source_id, target_event_id, content_hash, end_time, last_seen_at, missing_runs) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.category.as_str())
        .bind(&record.source_id)
        .bind(&record.target_event_id)
        .bind(&record.content_hash)
        .bind(record.end_time)
        .bind(record.last_seen_at)
        .bind(record.missing_runs)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to stage record {}/{}", category, record.source_id))?;
    }
    tx.commit().await.context("failed to commit snapshot")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_run(
    pool: &Pool,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    dry_run: bool,
    summary: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_runs (id, started_at, finished_at, dry_run, summary) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(run_id.to_string())
    .bind(started_at)
    .bind(finished_at)
    .bind(dry_run)
    .bind(summary.to_string())
    .execute(pool)
    .await
    .context("failed to persist run summary")?;
    Ok(())
}

pub async fn recent_runs(pool: &Pool, limit: i64) -> Result<Vec<RunRow>> {
    let rows = sqlx::query(
        "SELECT id, started_at, finished_at, dry_run, summary FROM sync_runs ORDER BY started_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<RunRow> {
            let summary: String = row.get("summary");
            Ok(RunRow {
                id: row.get("id"),
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
                dry_run: row.get("dry_run"),
                summary: serde_json::from_str(&summary).context("invalid stored run summary")?,
            })
        })
        .collect()
}

fn record_from_row(row: &SqliteRow) -> Result<SyncRecord> {
    let category: String = row.get("category");
    let category = Category::parse_category(&category)
        .ok_or_else(|| anyhow!("unknown category {} in state store", category))?;
    Ok(SyncRecord {
        category,
        source_id: row.get("source_id"),
        target_event_id: row.get("target_event_id"),
        content_hash: row.get("content_hash"),
        end_time: row.try_get("end_time")?,
        last_seen_at: row.try_get("last_seen_at")?,
        missing_runs: row.get("missing_runs"),
    })
}
