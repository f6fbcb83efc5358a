//! Configuration loader and validator for the calendar mirror.
use crate::model::Category;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub source: Source,
    pub calendar: Calendar,
}

/// Run-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub state_db: String,
    #[serde(default)]
    pub lock_path: Option<String>,
    #[serde(default)]
    pub lock_wait_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_missing_runs")]
    pub missing_runs_before_delete: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

/// Source platform settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub base_url: String,
    pub token_path: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_upcoming_window_days")]
    pub upcoming_window_days: u32,
}

/// Target calendar service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Calendar {
    #[serde(default)]
    pub base_url: Option<String>,
    pub access_token_path: String,
    pub calendars: CalendarIds,
}

/// Category to calendar id mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarIds {
    pub mission: String,
    pub patch: String,
    pub upcoming: String,
}

impl CalendarIds {
    pub fn for_category(&self, category: Category) -> &str {
        match category {
            Category::Mission => &self.mission,
            Category::Patch => &self.patch,
            Category::Upcoming => &self.upcoming,
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_missing_runs() -> u32 {
    1
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_page_size() -> u32 {
    20
}

fn default_max_pages() -> u32 {
    10
}

fn default_upcoming_window_days() -> u32 {
    5
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(home.trim_end_matches('/')).join(rest);
        }
    }
    PathBuf::from(path)
}

impl App {
    pub fn state_db_path(&self) -> PathBuf {
        expand_home(&self.state_db)
    }

    /// Lock file guarding the state store; defaults to `<state_db>.lock`.
    pub fn lock_file_path(&self) -> PathBuf {
        match self.lock_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(p) => expand_home(p),
            None => {
                let mut p = self.state_db_path().into_os_string();
                p.push(".lock");
                PathBuf::from(p)
            }
        }
    }
}

impl Config {
    /// Ensure the state store's parent directory exists.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        match self.app.state_db_path().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.state_db.trim().is_empty() {
        return Err(ConfigError::Invalid("app.state_db must be non-empty"));
    }
    if cfg.app.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_secs must be > 0"));
    }
    if cfg.app.missing_runs_before_delete == 0 {
        return Err(ConfigError::Invalid(
            "app.missing_runs_before_delete must be >= 1",
        ));
    }
    if cfg.app.timezone.trim().is_empty() {
        return Err(ConfigError::Invalid("app.timezone must be non-empty"));
    }

    if reqwest::Url::parse(&cfg.source.base_url).is_err() {
        return Err(ConfigError::Invalid("source.base_url must be a valid URL"));
    }
    if cfg.source.token_path.trim().is_empty() {
        return Err(ConfigError::Invalid("source.token_path must be non-empty"));
    }
    if cfg.source.max_attempts == 0 {
        return Err(ConfigError::Invalid("source.max_attempts must be >= 1"));
    }
    if cfg.source.page_size == 0 || cfg.source.max_pages == 0 {
        return Err(ConfigError::Invalid(
            "source.page_size and source.max_pages must be >= 1",
        ));
    }
    if cfg.source.upcoming_window_days == 0 {
        return Err(ConfigError::Invalid(
            "source.upcoming_window_days must be >= 1",
        ));
    }

    if let Some(url) = cfg.calendar.base_url.as_deref() {
        if reqwest::Url::parse(url).is_err() {
            return Err(ConfigError::Invalid("calendar.base_url must be a valid URL"));
        }
    }
    if cfg.calendar.access_token_path.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "calendar.access_token_path must be non-empty",
        ));
    }
    let ids = &cfg.calendar.calendars;
    if ids.mission.trim().is_empty() {
        return Err(ConfigError::Invalid("calendar.calendars.mission must be non-empty"));
    }
    if ids.patch.trim().is_empty() {
        return Err(ConfigError::Invalid("calendar.calendars.patch must be non-empty"));
    }
    if ids.upcoming.trim().is_empty() {
        return Err(ConfigError::Invalid("calendar.calendars.upcoming must be non-empty"));
    }

    Ok(())
}

/// Example configuration accepted by `load`.
pub fn example() -> &'static str {
    r#"app:
  state_db: "~/.local/share/calsync/state.db"
  # lock_path defaults to "<state_db>.lock"
  lock_wait_ms: 0
  request_timeout_secs: 30
  # Delete an event only after its item is absent from this many runs in a row.
  missing_runs_before_delete: 1
  timezone: "America/New_York"

source:
  base_url: "https://platform.synack.com"
  token_path: "/tmp/synacktoken"
  max_attempts: 3
  page_size: 20
  max_pages: 10
  upcoming_window_days: 5

calendar:
  access_token_path: "~/.config/calsync/calendar_token"
  calendars:
    mission: "MISSION_CALENDAR_ID@group.calendar.google.com"
    patch: "PATCH_CALENDAR_ID@group.calendar.google.com"
    upcoming: "UPCOMING_CALENDAR_ID@group.calendar.google.com"
"#
}
