//! Database view models used by repositories.

use chrono::{DateTime, Utc};

/// One row of run history.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub summary: serde_json::Value,
}
