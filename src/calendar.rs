use crate::model::EventBody;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The event no longer exists on the calendar.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Write access to the target calendars. Event ids are opaque handles.
#[async_trait]
pub trait CalendarService: Send + Sync {
    async fn create_event(&self, calendar_id: &str, event: &EventBody) -> Result<String>;

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &EventBody,
    ) -> Result<UpdateOutcome>;

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<DeleteOutcome>;
}

/// Google Calendar v3 REST client authenticated with a bearer access token.
#[derive(Clone)]
pub struct GoogleCalendarClient {
    http: Client,
    base_url: Url,
    token: String,
    timezone: String,
}

impl fmt::Debug for GoogleCalendarClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleCalendarClient")
            .field("base_url", &self.base_url)
            .field("timezone", &self.timezone)
            .finish_non_exhaustive()
    }
}

impl GoogleCalendarClient {
    pub fn new(token: String, timezone: String, timeout: Duration) -> Result<Self> {
        Self::with_base_url(token, timezone, timeout, CALENDAR_API_BASE)
    }

    pub fn with_base_url(
        token: String,
        timezone: String,
        timeout: Duration,
        base_url: &str,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid calendar base URL")?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("calendar base URL {} cannot be a base", base_url));
        }
        let http = Client::builder()
            .user_agent(concat!("calsync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build calendar HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            timezone,
        })
    }

    /// `.../calendars/{calendar_id}/events[/{event_id}]` with each id
    /// percent-encoded as a single path segment.
    pub fn events_url(&self, calendar_id: &str, event_id: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("calendar base URL cannot be a base"))?;
            segments
                .pop_if_empty()
                .push("calendars")
                .push(calendar_id)
                .push("events");
            if let Some(id) = event_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    pub fn build_request(&self, method: Method, url: Url, body: Option<&Value>) -> Result<reqwest::Request> {
        let mut builder = self.http.request(method, url).bearer_auth(&self.token);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.build().context("failed to build calendar request")
    }

    async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        debug!(method = %request.method(), url = %request.url(), "sending calendar request");
        self.http
            .execute(request)
            .await
            .context("failed to reach calendar service")
    }
}

#[async_trait]
impl CalendarService for GoogleCalendarClient {
    async fn create_event(&self, calendar_id: &str, event: &EventBody) -> Result<String> {
        let body = build_event_body(event, &self.timezone);
        let url = self.events_url(calendar_id, None)?;
        let res = self.send(self.build_request(Method::POST, url, Some(&body))?).await?;
        let res = ensure_success(res).await?;
        let payload: EventResponse = res.json().await.context("invalid calendar response")?;
        Ok(payload.id)
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &EventBody,
    ) -> Result<UpdateOutcome> {
        let body = build_event_body(event, &self.timezone);
        let url = self.events_url(calendar_id, Some(event_id))?;
        let res = self.send(self.build_request(Method::PUT, url, Some(&body))?).await?;
        if is_gone(res.status()) {
            return Ok(UpdateOutcome::Missing);
        }
        ensure_success(res).await?;
        Ok(UpdateOutcome::Updated)
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<DeleteOutcome> {
        let url = self.events_url(calendar_id, Some(event_id))?;
        let res = self.send(self.build_request(Method::DELETE, url, None)?).await?;
        if is_gone(res.status()) {
            return Ok(DeleteOutcome::NotFound);
        }
        ensure_success(res).await?;
        Ok(DeleteOutcome::Deleted)
    }
}

pub fn build_event_body(event: &EventBody, timezone: &str) -> Value {
    json!({
        "summary": event.summary,
        "description": event.description,
        "start": {
            "dateTime": event.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            "timeZone": timezone,
        },
        "end": {
            "dateTime": event.end.to_rfc3339_opts(SecondsFormat::Secs, true),
            "timeZone": timezone,
        },
    })
}

fn is_gone(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
}

async fn ensure_success(res: reqwest::Response) -> Result<reqwest::Response> {
    let status = res.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let body = res.text().await.unwrap_or_default();
        return Err(anyhow!("received 429 from calendar service: {}", body));
    }
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(anyhow!("calendar error {}: {}", status, body));
    }
    Ok(res)
}

#[derive(Deserialize)]
struct EventResponse {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn client() -> GoogleCalendarClient {
        GoogleCalendarClient::new("token".into(), "Europe/Berlin".into(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn event_body_carries_window_and_timezone() {
        let event = EventBody {
            summary: "Patch Verification for XSS".into(),
            description: "retest".into(),
            start: Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap(),
        };
        let body = build_event_body(&event, "Europe/Berlin");
        assert_eq!(body["summary"], "Patch Verification for XSS");
        assert_eq!(body["description"], "retest");
        assert_eq!(body["start"]["dateTime"], "2024-06-01T08:00:00Z");
        assert_eq!(body["end"]["dateTime"], "2024-06-01T09:30:00Z");
        assert_eq!(body["end"]["timeZone"], "Europe/Berlin");
    }

    #[test]
    fn events_url_encodes_calendar_id() {
        let url = client()
            .events_url("team#missions@group.calendar.google.com", Some("evt1"))
            .unwrap();
        assert_eq!(
            url.path(),
            "/calendar/v3/calendars/team%23missions@group.calendar.google.com/events/evt1"
        );
    }

    #[test]
    fn build_request_sets_auth_and_json() {
        let client = client();
        let url = client.events_url("cal", None).unwrap();
        let body = json!({ "summary": "x" });
        let request = client.build_request(Method::POST, url, Some(&body)).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/calendar/v3/calendars/cal/events");
        let headers = request.headers();
        assert_eq!(
            headers.get("Authorization").and_then(|h| h.to_str().ok()).unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers.get("Content-Type").and_then(|h| h.to_str().ok()).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn debug_output_hides_token() {
        let client = GoogleCalendarClient::new("sekret-value".into(), "UTC".into(), Duration::from_secs(1)).unwrap();
        assert!(!format!("{:?}", client).contains("sekret"));
    }
}
