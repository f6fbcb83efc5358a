//! Allow-list sanitizer. This is the only path by which source text reaches
//! the calendar or the state store.
//!
//! Only the fields named in [`sanitize`] are ever read. Payouts, client and
//! organisation names, and internal identifiers are never looked at. Every
//! string that does pass is masked for IPv4 addresses and domain names.
use crate::model::{Category, RawItem};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Longest summary forwarded to the calendar, in characters.
pub const MAX_SUMMARY_CHARS: usize = 1000;
const MAX_TITLE_CHARS: usize = 200;

static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("valid IPv4 pattern"));
static DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[a-zA-Z0-9-]+\.)+[a-zA-Z]{2,}\b").expect("valid domain pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sanitized {
    pub title: String,
    pub summary: String,
}

/// Produce the title and summary for a raw item. Never fails: a missing or
/// non-string field contributes an empty string.
pub fn sanitize(raw: &RawItem) -> Sanitized {
    let f = &raw.fields;
    let (title, summary) = match raw.category {
        Category::Mission => {
            let title = text_at(f, &["title"]);
            let codename = text_at(f, &["listingCodename"]);
            let title = if codename.is_empty() {
                title
            } else if title.is_empty() {
                codename
            } else {
                format!("{title} - {codename}")
            };
            (title, text_at(f, &["description"]))
        }
        Category::Patch => {
            let vuln = text_at(f, &["vulnerability", "title"]);
            let title = if vuln.is_empty() {
                "Patch Verification".to_string()
            } else {
                format!("Patch Verification for {vuln}")
            };
            (title, text_at(f, &["message"]))
        }
        Category::Upcoming => {
            let kind = text_at(f, &["category", "name"]);
            let summary = if kind.is_empty() {
                String::new()
            } else {
                format!("Category: {kind}")
            };
            (text_at(f, &["codename"]), summary)
        }
    };

    Sanitized {
        title: truncate_chars(&collapse_whitespace(&mask(&title)), MAX_TITLE_CHARS),
        summary: truncate_chars(mask(&summary).trim(), MAX_SUMMARY_CHARS),
    }
}

/// Replace IPv4 addresses and domain names with placeholders.
pub fn mask(text: &str) -> String {
    let masked = IPV4.replace_all(text, "*.*.*.*");
    DOMAIN.replace_all(&masked, "[domain]").into_owned()
}

fn text_at(value: &Value, path: &[&str]) -> String {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
