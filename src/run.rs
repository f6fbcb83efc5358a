//! One reconciliation run: fetch, normalize, plan, apply, then commit, for
//! every category. Categories are processed concurrently and each category's
//! snapshot is committed at most once, after all of its calendar calls.
use crate::calendar::{CalendarService, GoogleCalendarClient};
use crate::config::{self, CalendarIds, Config};
use crate::db::{self, Pool, Snapshot};
use crate::error::SyncError;
use crate::lock::RunLock;
use crate::model::Category;
use crate::normalize::normalize;
use crate::reconcile::{self, CategorySummary};
use crate::source::{fetch_with_retry, PlatformClient, RetryPolicy, SourceService};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Knobs for a run, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub calendars: CalendarIds,
    pub missing_runs_before_delete: u32,
    pub retry: RetryPolicy,
    pub op_timeout: Duration,
    pub dry_run: bool,
}

impl Settings {
    pub fn from_config(cfg: &Config, dry_run: bool) -> Self {
        let op_timeout = Duration::from_secs(cfg.app.request_timeout_secs);
        Self {
            calendars: cfg.calendar.calendars.clone(),
            missing_runs_before_delete: cfg.app.missing_runs_before_delete,
            retry: RetryPolicy {
                max_attempts: cfg.source.max_attempts,
                base_delay: Duration::from_secs(1),
                // Paging makes a fetch several requests long.
                attempt_timeout: op_timeout * cfg.source.max_pages.max(1),
            },
            op_timeout,
            dry_run,
        }
    }
}

/// Everything a run needs. Holding the context means holding the state lock.
pub struct RunContext {
    lock: RunLock,
    pool: Pool,
    source: Arc<dyn SourceService>,
    calendar: Arc<dyn CalendarService>,
    settings: Settings,
}

impl RunContext {
    pub fn new(
        lock: RunLock,
        pool: Pool,
        source: Arc<dyn SourceService>,
        calendar: Arc<dyn CalendarService>,
        settings: Settings,
    ) -> Self {
        Self {
            lock,
            pool,
            source,
            calendar,
            settings,
        }
    }

    /// Take the state lock, read credentials, and open the state store.
    ///
    /// The lock is acquired before anything else so a contended run exits
    /// without touching the store.
    pub async fn open(cfg: &Config, dry_run: bool) -> Result<Self, SyncError> {
        let lock_path = cfg.app.lock_file_path();
        let wait = Duration::from_millis(cfg.app.lock_wait_ms);
        // Acquiring polls with a blocking sleep.
        let lock = tokio::task::spawn_blocking(move || RunLock::acquire(&lock_path, wait))
            .await
            .map_err(SyncError::persistence)??;

        let source_token = read_credential(&config::expand_home(&cfg.source.token_path))?;
        let calendar_token =
            read_credential(&config::expand_home(&cfg.calendar.access_token_path))?;
        let timeout = Duration::from_secs(cfg.app.request_timeout_secs);

        let source = PlatformClient::new(&cfg.source.base_url, source_token, timeout)
            .map_err(SyncError::Client)?
            .with_paging(cfg.source.page_size, cfg.source.max_pages)
            .with_upcoming_window(cfg.source.upcoming_window_days);
        let calendar = match cfg.calendar.base_url.as_deref() {
            Some(base) => GoogleCalendarClient::with_base_url(
                calendar_token,
                cfg.app.timezone.clone(),
                timeout,
                base,
            ),
            None => GoogleCalendarClient::new(calendar_token, cfg.app.timezone.clone(), timeout),
        }
        .map_err(SyncError::Client)?;

        let pool = db::init_pool(&cfg.app.state_db_path())
            .await
            .map_err(SyncError::Persistence)?;
        db::run_migrations(&pool)
            .await
            .map_err(SyncError::Persistence)?;

        Ok(Self::new(
            lock,
            pool,
            Arc::new(source),
            Arc::new(calendar),
            Settings::from_config(cfg, dry_run),
        ))
    }

    /// Load and validate the YAML config at `path`, then [`open`](Self::open).
    pub async fn from_config_file(path: &Path, dry_run: bool) -> Result<(Config, Self), SyncError> {
        let cfg = config::load(Some(path))?;
        cfg.ensure_dirs().map_err(SyncError::persistence)?;
        let ctx = Self::open(&cfg, dry_run).await?;
        Ok((cfg, ctx))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub categories: Vec<CategorySummary>,
}

impl RunSummary {
    pub fn category(&self, category: Category) -> Option<&CategorySummary> {
        self.categories
            .iter()
            .find(|c| c.category == Some(category))
    }

    /// True if any category aborted or any item failed.
    pub fn is_partial(&self) -> bool {
        self.categories
            .iter()
            .any(|c| c.aborted.is_some() || c.failed > 0)
    }

    pub fn log(&self) {
        for c in &self.categories {
            let category = c.category.map(|c| c.as_str()).unwrap_or("-");
            match &c.aborted {
                Some(reason) => warn!(run_id = %self.run_id, category, %reason, "category aborted"),
                None => info!(
                    run_id = %self.run_id,
                    category,
                    dry_run = self.dry_run,
                    created = c.created,
                    updated = c.updated,
                    recreated = c.recreated,
                    deleted = c.deleted,
                    unchanged = c.unchanged,
                    retained = c.retained,
                    skipped = c.skipped,
                    failed = c.failed,
                    duplicates = c.duplicates,
                    "category reconciled"
                ),
            }
        }
    }
}

/// Execute one reconciliation run at instant `now`.
///
/// Returns `Err` only for fatal conditions; per-item and per-category
/// failures are reported in the summary.
#[instrument(skip_all, fields(dry_run = ctx.settings.dry_run))]
pub async fn run(ctx: &RunContext, now: DateTime<Utc>) -> Result<RunSummary, SyncError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, "starting reconciliation run");

    let mut priors = Vec::with_capacity(Category::ALL.len());
    for category in Category::ALL {
        let prior = db::load_records(&ctx.pool, category)
            .await
            .map_err(SyncError::Persistence)?;
        priors.push((category, prior));
    }

    let results = join_all(
        priors
            .into_iter()
            .map(|(category, prior)| reconcile_category(ctx, category, prior, now)),
    )
    .await;

    let mut categories = Vec::with_capacity(results.len());
    let mut fatal = None;
    for result in results {
        match result {
            Ok(summary) => categories.push(summary),
            Err(err) => {
                warn!(%err, "category commit failed");
                fatal.get_or_insert(err);
            }
        }
    }
    if let Some(err) = fatal {
        return Err(err);
    }

    let summary = RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        dry_run: ctx.settings.dry_run,
        categories,
    };
    match serde_json::to_value(&summary) {
        Ok(value) => {
            if let Err(err) = db::record_run(
                &ctx.pool,
                run_id,
                summary.started_at,
                summary.finished_at,
                summary.dry_run,
                &value,
            )
            .await
            {
                warn!(?err, "failed to record run history");
            }
        }
        Err(err) => warn!(?err, "failed to serialize run summary"),
    }
    summary.log();
    Ok(summary)
}

#[instrument(skip_all, fields(category = %category))]
async fn reconcile_category(
    ctx: &RunContext,
    category: Category,
    prior: Snapshot,
    now: DateTime<Utc>,
) -> Result<CategorySummary, SyncError> {
    let settings = &ctx.settings;
    let raw = match fetch_with_retry(ctx.source.as_ref(), category, settings.retry).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%err, "fetch failed; leaving category untouched");
            return Ok(CategorySummary {
                aborted: Some(err.to_string()),
                ..CategorySummary::new(category)
            });
        }
    };

    let mut items = Vec::with_capacity(raw.len());
    let mut invalid = 0;
    for (index, raw_item) in raw.iter().enumerate() {
        match normalize(raw_item) {
            Ok(item) => items.push(item),
            Err(err) => {
                warn!(%err, index, "skipping invalid source item");
                invalid += 1;
            }
        }
    }
    let plan = reconcile::plan(
        category,
        items,
        prior,
        now,
        settings.missing_runs_before_delete,
    );
    if plan.duplicates > 0 {
        warn!(duplicates = plan.duplicates, "source reported duplicate identities; later ones win");
    }

    if settings.dry_run {
        for item in &plan.create {
            info!(source_id = %item.source_id, title = %item.title, "would create");
        }
        for (record, _) in &plan.update {
            info!(source_id = %record.source_id, target_event_id = %record.target_event_id, "would update");
        }
        for deletion in &plan.delete {
            info!(source_id = %deletion.record.source_id, reason = ?deletion.reason, "would delete");
        }
        let mut summary = CategorySummary::planned(&plan);
        summary.skipped += invalid;
        return Ok(summary);
    }

    let calendar_id = settings.calendars.for_category(category);
    let outcome = reconcile::apply(
        plan,
        ctx.calendar.as_ref(),
        calendar_id,
        now,
        settings.op_timeout,
    )
    .await;

    db::commit_records(&ctx.pool, category, &outcome.records)
        .await
        .map_err(SyncError::Persistence)?;

    let mut summary = outcome.summary;
    summary.skipped += invalid;
    Ok(summary)
}

/// Read a credential file; the trimmed content must be non-empty.
pub fn read_credential(path: &Path) -> Result<String, SyncError> {
    let raw = fs::read_to_string(path).map_err(|err| SyncError::Credentials {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let token = raw.trim();
    if token.is_empty() {
        return Err(SyncError::Credentials {
            path: path.to_path_buf(),
            reason: "file is empty".into(),
        });
    }
    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn credential_is_trimmed() {
        let td = tempdir().unwrap();
        let path = td.path().join("token");
        fs::write(&path, "  abc123\n").unwrap();
        assert_eq!(read_credential(&path).unwrap(), "abc123");
    }

    #[test]
    fn empty_or_missing_credential_is_fatal() {
        let td = tempdir().unwrap();
        let empty = td.path().join("empty");
        fs::write(&empty, "\n").unwrap();
        assert!(matches!(read_credential(&empty), Err(SyncError::Credentials { .. })));
        let missing = td.path().join("missing");
        assert!(matches!(read_credential(&missing), Err(SyncError::Credentials { .. })));
    }

    #[tokio::test]
    async fn malformed_config_file_is_a_config_error() {
        let td = tempdir().unwrap();
        let path = td.path().join("config.yaml");
        fs::write(&path, "app: [not, a, mapping]\n").unwrap();
        match RunContext::from_config_file(&path, false).await {
            Err(SyncError::Config(_)) => {}
            Err(other) => panic!("expected a config error, got {other}"),
            Ok(_) => panic!("malformed config was accepted"),
        }
    }

    #[tokio::test]
    async fn invalid_config_values_are_a_config_error() {
        let td = tempdir().unwrap();
        let path = td.path().join("config.yaml");
        let yaml = crate::config::example().replace("max_attempts: 3", "max_attempts: 0");
        fs::write(&path, yaml).unwrap();
        let err = RunContext::from_config_file(&path, false).await.err().unwrap();
        assert!(matches!(err, SyncError::Config(crate::config::ConfigError::Invalid(_))));
    }

    #[test]
    fn settings_follow_config() {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        let settings = Settings::from_config(&cfg, true);
        assert!(settings.dry_run);
        assert_eq!(settings.op_timeout, Duration::from_secs(cfg.app.request_timeout_secs));
        assert_eq!(settings.retry.max_attempts, cfg.source.max_attempts);
        assert_eq!(settings.calendars, cfg.calendar.calendars);
    }
}
