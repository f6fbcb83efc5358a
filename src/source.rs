use crate::error::SourceError;
use crate::model::{Category, RawItem};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Read access to the work items published by the source platform.
#[async_trait]
pub trait SourceService: Send + Sync {
    async fn fetch(&self, category: Category) -> Result<Vec<RawItem>, SourceError>;
}

/// How a category fetch is retried within one run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

/// Fetch one category, retrying rate limits and transient failures with
/// capped exponential backoff. `Unauthorized` is returned immediately.
#[instrument(skip_all, fields(category = %category))]
pub async fn fetch_with_retry(
    source: &dyn SourceService,
    category: Category,
    policy: RetryPolicy,
) -> Result<Vec<RawItem>, SourceError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.attempt_timeout, source.fetch(category)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Transient(format!(
                "fetch timed out after {:?}",
                policy.attempt_timeout
            ))),
        };
        match result {
            Ok(items) => {
                debug!(count = items.len(), attempt, "fetched source items");
                return Ok(items);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff_delay(policy.base_delay, attempt);
                warn!(%err, attempt, ?delay, "source fetch failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << (attempt.saturating_sub(1)).min(10);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// HTTP client for the source platform's REST API.
#[derive(Clone)]
pub struct PlatformClient {
    http: Client,
    base_url: Url,
    token: String,
    page_size: u32,
    max_pages: u32,
    upcoming_window_days: u32,
}

impl fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformClient")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl PlatformClient {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context("invalid source base URL")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(concat!("calsync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build source HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            page_size: 20,
            max_pages: 10,
            upcoming_window_days: 5,
        })
    }

    pub fn with_paging(mut self, page_size: u32, max_pages: u32) -> Self {
        self.page_size = page_size.max(1);
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn with_upcoming_window(mut self, days: u32) -> Self {
        self.upcoming_window_days = days.max(1);
        self
    }

    /// Build the GET request for one page of a category listing.
    pub fn build_request(
        &self,
        category: Category,
        page: u32,
        now: DateTime<Utc>,
    ) -> Result<reqwest::Request> {
        let per_page = self.page_size.to_string();
        let page = page.to_string();
        let (path, query): (&str, Vec<(&str, String)>) = match category {
            Category::Mission => (
                "api/tasks/v2/tasks",
                vec![
                    ("perPage", per_page),
                    ("viewed", "true".into()),
                    ("page", page),
                    ("status", "CLAIMED".into()),
                    ("includeAssignedBySynackUser", "true".into()),
                ],
            ),
            Category::Patch => (
                "api/patch_verifications",
                vec![("page", page), ("per_page", per_page)],
            ),
            Category::Upcoming => {
                let until = now + ChronoDuration::days(i64::from(self.upcoming_window_days));
                (
                    "api/targets",
                    vec![
                        ("filter[primary]", "upcoming".into()),
                        ("filter[secondary]", "all".into()),
                        ("filter[category]", "all".into()),
                        ("filter[industry]", "all".into()),
                        ("filter[payout_status]", "all".into()),
                        ("filter[to]", until.timestamp().to_string()),
                        ("sorting[field]", "upcomingStartDate".into()),
                        ("sorting[direction]", "asc".into()),
                    ],
                )
            }
        };
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid source base URL")?;
        self.http
            .get(endpoint)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .query(&query)
            .build()
            .context("failed to build source request")
    }

    async fn fetch_page(
        &self,
        category: Category,
        page: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Value>, SourceError> {
        let request = self
            .build_request(category, page, now)
            .map_err(|e| SourceError::Transient(format!("{e:#}")))?;
        debug!(url = %request.url(), "requesting source page");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;
        if let Some(err) = classify_status(res.status()) {
            return Err(err);
        }
        let body: Value = res
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        match body {
            Value::Array(items) => Ok(items),
            other => Err(SourceError::Decode(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            ))),
        }
    }
}

#[async_trait]
impl SourceService for PlatformClient {
    async fn fetch(&self, category: Category) -> Result<Vec<RawItem>, SourceError> {
        let now = Utc::now();
        let paginated = !matches!(category, Category::Upcoming);
        let mut items = Vec::new();
        for page in 1..=self.max_pages {
            let batch = self.fetch_page(category, page, now).await?;
            let short_page = batch.len() < self.page_size as usize;
            items.extend(batch.into_iter().map(|fields| RawItem::new(category, fields)));
            if !paginated || short_page {
                return Ok(items);
            }
        }
        // Every page came back full, so the listing is incomplete.
        Err(SourceError::Transient(format!(
            "listing exceeded {} pages of {}",
            self.max_pages, self.page_size
        )))
    }
}

/// Map a non-success HTTP status onto the source error taxonomy.
pub fn classify_status(status: StatusCode) -> Option<SourceError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited,
        other => SourceError::Transient(format!("unexpected status {other}")),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
