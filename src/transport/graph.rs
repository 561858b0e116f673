//! Microsoft Graph (Teams) transport.
//!
//! App-only auth via OAuth2 client credentials; the bearer token is cached
//! until shortly before expiry. Deletion uses the `softDelete` endpoint, which
//! the platform refuses (403/412) for most user-authored content. That is
//! surfaced as `DeletionForbidden`, not as a failure.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ChannelRef, ChannelTransport, Message, MessageId, strip_html};
use crate::error::{ConfigError, TransportError};

const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh the token this long before it expires.
const TOKEN_SKEW: Duration = Duration::from_secs(120);

/// Graph transport configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub team_id: String,
    pub graph_url: String,
    pub authority: String,
    /// Messages requested per page (`$top`).
    pub page_size: u32,
    /// Upper bound on pages followed per fetch. Hitting it fails the fetch.
    pub max_pages: u32,
    pub request_timeout: Duration,
}

impl GraphConfig {
    /// Build config from environment variables.
    ///
    /// Credentials are required; a missing one is a startup error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let required = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        Ok(Self {
            tenant_id: required("TEAMS_TENANT_ID")?,
            client_id: required("TEAMS_CLIENT_ID")?,
            client_secret: SecretString::from(required("TEAMS_CLIENT_SECRET")?),
            team_id: required("TEAMS_TEAM_ID")?,
            graph_url: std::env::var("GRAPH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GRAPH_URL.to_string()),
            authority: std::env::var("GRAPH_AUTHORITY")
                .unwrap_or_else(|_| DEFAULT_AUTHORITY.to_string()),
            page_size: std::env::var("GRAPH_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50),
            max_pages: std::env::var("GRAPH_MAX_PAGES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(100),
            request_timeout: Duration::from_secs(
                std::env::var("MODERATOR_TRANSPORT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct ChannelPage {
    #[serde(default)]
    value: Vec<GraphChannel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphChannel {
    id: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    message_type: Option<String>,
    created_date_time: Option<DateTime<Utc>>,
    deleted_date_time: Option<DateTime<Utc>>,
    from: Option<GraphFrom>,
    body: Option<GraphBody>,
}

#[derive(Debug, Deserialize)]
struct GraphFrom {
    user: Option<GraphUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: Option<String>,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    #[serde(default)]
    content: String,
    #[serde(default)]
    content_type: Option<String>,
}

/// Convert one page of Graph messages into moderation messages.
///
/// Drops system events, bot/app posts (no user author), deleted messages,
/// and anything at or below `after`.
fn convert_page(
    channel: &ChannelRef,
    page: &MessagePage,
    after: Option<&MessageId>,
) -> Vec<Message> {
    page.value
        .iter()
        .filter(|m| m.message_type.as_deref().unwrap_or("message") == "message")
        .filter(|m| m.deleted_date_time.is_none())
        .filter_map(|m| {
            let user = m.from.as_ref()?.user.as_ref()?;
            let author_id = user.id.clone()?;
            let id = MessageId::new(m.id.clone());
            if after.is_some_and(|a| &id <= a) {
                return None;
            }
            let body = m
                .body
                .as_ref()
                .map(|b| match b.content_type.as_deref() {
                    Some("html") => strip_html(&b.content),
                    _ => b.content.trim().to_string(),
                })
                .unwrap_or_default();

            Some(Message {
                id,
                channel_id: channel.id.clone(),
                channel_name: channel.name.clone(),
                author_id,
                author_name: user
                    .display_name
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                body,
                created_at: m.created_date_time.unwrap_or_else(Utc::now),
            })
        })
        .collect()
}

/// Whether the page reaches back to (or past) the cursor.
fn page_reaches(page: &MessagePage, after: Option<&MessageId>) -> bool {
    match after {
        Some(a) => page.value.iter().any(|m| &MessageId::new(m.id.clone()) <= a),
        None => false,
    }
}

/// Map an error status from the delete endpoint.
fn map_delete_status(status: StatusCode, message_id: &MessageId, body: &str) -> TransportError {
    match status {
        StatusCode::FORBIDDEN | StatusCode::PRECONDITION_FAILED => {
            TransportError::DeletionForbidden {
                message_id: message_id.to_string(),
                reason: format!("{status}: {}", truncate(body, 200)),
            }
        }
        StatusCode::NOT_FOUND => TransportError::MessageNotFound {
            message_id: message_id.to_string(),
        },
        other => map_status(other, body),
    }
}

/// Map a generic error status.
fn map_status(status: StatusCode, body: &str) -> TransportError {
    match status {
        StatusCode::UNAUTHORIZED => TransportError::Auth(truncate(body, 200)),
        StatusCode::TOO_MANY_REQUESTS => TransportError::Unavailable("rate limited".into()),
        s if s.is_server_error() => TransportError::Unavailable(format!("{s}")),
        s => TransportError::Http(format!("{s}: {}", truncate(body, 200))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

// ── Transport ───────────────────────────────────────────────────────

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Teams channel transport over Microsoft Graph.
pub struct GraphTransport {
    config: GraphConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl GraphTransport {
    pub fn new(config: GraphConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    fn map_reqwest(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.config.request_timeout)
        } else if e.is_connect() {
            TransportError::Unavailable(e.to_string())
        } else {
            TransportError::Http(e.to_string())
        }
    }

    async fn access_token(&self) -> Result<String, TransportError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority, self.config.tenant_id
        );
        let resp = self
            .http
            .post(&url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Auth(format!(
                "token request failed ({status}): {}",
                truncate(&body, 200)
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(format!("token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SKEW);
        debug!(lifetime_secs = lifetime.as_secs(), "Acquired Graph access token");
        *guard = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn channel_url(&self, channel_id: &str) -> String {
        format!(
            "{}/teams/{}/channels/{}",
            self.config.graph_url, self.config.team_id, channel_id
        )
    }

    async fn get_page(&self, url: &str, channel: &ChannelRef) -> Result<MessagePage, TransportError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::ChannelNotFound {
                channel: channel.name.clone(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        resp.json()
            .await
            .map_err(|e| TransportError::InvalidResponse(format!("message page: {e}")))
    }
}

/// Walk message pages, newest first, until one reaches back to `after`.
///
/// Without a cursor only the first page is read. Running into `max_pages`
/// before the cursor is an error: handing back only the newest part of the
/// backlog would let the cursor jump over the unread remainder.
async fn collect_pages<F, Fut>(
    channel: &ChannelRef,
    first_url: String,
    after: Option<&MessageId>,
    max_pages: u32,
    mut fetch_page: F,
) -> Result<Vec<Message>, TransportError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<MessagePage, TransportError>>,
{
    let mut url = first_url;
    let mut messages = Vec::new();

    for page_no in 1..=max_pages.max(1) {
        let page = fetch_page(url).await?;
        messages.extend(convert_page(channel, &page, after));

        if after.is_none() || page_reaches(&page, after) {
            return Ok(in_order(messages));
        }
        match page.next_link {
            Some(next) => {
                debug!(channel = %channel.name, page = page_no, "Following next page");
                url = next;
            }
            // History ends before the cursor (cursor message purged upstream).
            None => return Ok(in_order(messages)),
        }
    }

    warn!(
        channel = %channel.name,
        max_pages,
        fetched = messages.len(),
        "Backlog exceeds page limit; cursor not reached"
    );
    Err(TransportError::Unavailable(format!(
        "backlog in {} exceeds {max_pages} pages without reaching the cursor",
        channel.name
    )))
}

fn in_order(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by(|a, b| a.id.cmp(&b.id));
    messages.dedup_by(|a, b| a.id == b.id);
    messages
}

#[async_trait]
impl ChannelTransport for GraphTransport {
    fn name(&self) -> &str {
        "graph"
    }

    async fn list_channels(&self) -> Result<Vec<ChannelRef>, TransportError> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/teams/{}/channels",
            self.config.graph_url, self.config.team_id
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let page: ChannelPage = resp
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(format!("channel list: {e}")))?;

        Ok(page
            .value
            .into_iter()
            .map(|c| ChannelRef {
                id: c.id,
                name: c.display_name,
            })
            .collect())
    }

    async fn fetch_messages(
        &self,
        channel: &ChannelRef,
        after: Option<&MessageId>,
    ) -> Result<Vec<Message>, TransportError> {
        let url = format!(
            "{}/messages?$top={}",
            self.channel_url(&channel.id),
            self.config.page_size
        );
        collect_pages(
            channel,
            url,
            after,
            self.config.max_pages,
            move |url: String| async move { self.get_page(&url, channel).await },
        )
        .await
    }

    async fn message_exists(
        &self,
        channel: &ChannelRef,
        message_id: &MessageId,
    ) -> Result<bool, TransportError> {
        let token = self.access_token().await?;
        let url = format!("{}/messages/{}", self.channel_url(&channel.id), message_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => {
                let msg: GraphMessage = resp
                    .json()
                    .await
                    .map_err(|e| TransportError::InvalidResponse(format!("message: {e}")))?;
                Ok(msg.deleted_date_time.is_none())
            }
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(map_status(s, &body))
            }
        }
    }

    async fn delete_message(
        &self,
        channel: &ChannelRef,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/messages/{}/softDelete",
            self.channel_url(&channel.id),
            message_id
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = resp.status();
        if status.is_success() {
            info!(channel = %channel.name, message_id = %message_id, "Message soft-deleted");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(map_delete_status(status, message_id, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelRef {
        ChannelRef {
            id: "19:abc@thread.tacv2".into(),
            name: "General".into(),
        }
    }

    fn page(json: serde_json::Value) -> MessagePage {
        serde_json::from_value(json).unwrap()
    }

    fn sample_page() -> MessagePage {
        page(serde_json::json!({
            "value": [
                {
                    "id": "1700000000300",
                    "messageType": "message",
                    "createdDateTime": "2026-10-01T10:00:03Z",
                    "from": {"user": {"id": "u1", "displayName": "Alice"}},
                    "body": {"contentType": "html", "content": "<p>third</p>"}
                },
                {
                    "id": "1700000000200",
                    "messageType": "systemEventMessage",
                    "createdDateTime": "2026-10-01T10:00:02Z",
                    "from": null,
                    "body": {"contentType": "html", "content": "<systemEventMessage/>"}
                },
                {
                    "id": "1700000000150",
                    "messageType": "message",
                    "createdDateTime": "2026-10-01T10:00:01Z",
                    "from": {"application": {"id": "bot"}},
                    "body": {"contentType": "text", "content": "bot post"}
                },
                {
                    "id": "1700000000100",
                    "messageType": "message",
                    "createdDateTime": "2026-10-01T10:00:00Z",
                    "from": {"user": {"id": "u2", "displayName": "Bob"}},
                    "body": {"contentType": "text", "content": " first "}
                }
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/next"
        }))
    }

    #[test]
    fn convert_page_keeps_user_messages_only() {
        let msgs = convert_page(&channel(), &sample_page(), None);
        let ids: Vec<&str> = msgs.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1700000000300", "1700000000100"]);
        assert_eq!(msgs[0].body, "third");
        assert_eq!(msgs[1].body, "first");
        assert_eq!(msgs[1].author_name, "Bob");
        assert_eq!(msgs[0].channel_name, "General");
    }

    #[test]
    fn convert_page_filters_at_or_below_cursor() {
        let after = MessageId::new("1700000000100");
        let msgs = convert_page(&channel(), &sample_page(), Some(&after));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id.as_str(), "1700000000300");
    }

    #[test]
    fn convert_page_skips_deleted() {
        let p = page(serde_json::json!({
            "value": [{
                "id": "5",
                "deletedDateTime": "2026-10-01T10:00:00Z",
                "from": {"user": {"id": "u1", "displayName": "A"}},
                "body": {"content": ""}
            }]
        }));
        assert!(convert_page(&channel(), &p, None).is_empty());
    }

    #[test]
    fn page_reaches_cursor() {
        let p = sample_page();
        assert!(page_reaches(&p, Some(&MessageId::new("1700000000200"))));
        assert!(!page_reaches(&p, Some(&MessageId::new("1"))));
        assert!(!page_reaches(&p, None));
    }

    /// A page of two user messages with the given ids, newest first.
    fn backlog_page(ids: [u64; 2], next: Option<&str>) -> MessagePage {
        let value: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "id": id.to_string(),
                    "messageType": "message",
                    "from": {"user": {"id": "u1", "displayName": "Alice"}},
                    "body": {"contentType": "text", "content": format!("msg {id}")}
                })
            })
            .collect();
        page(serde_json::json!({ "value": value, "@odata.nextLink": next }))
    }

    #[tokio::test]
    async fn follows_pages_back_to_the_cursor() {
        let after = MessageId::new("10");
        let mut urls = Vec::new();
        let msgs = collect_pages(&channel(), "p1".into(), Some(&after), 10, |url: String| {
            let page = match url.as_str() {
                "p1" => backlog_page([40, 30], Some("p2")),
                "p2" => backlog_page([20, 15], Some("p3")),
                _ => backlog_page([11, 10], Some("p4")),
            };
            urls.push(url);
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(urls, vec!["p1", "p2", "p3"]);
        let ids: Vec<&str> = msgs.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["11", "15", "20", "30", "40"]);
    }

    #[tokio::test]
    async fn backlog_beyond_page_limit_fails_the_fetch() {
        let after = MessageId::new("1");
        let mut calls = 0u64;
        let err = collect_pages(&channel(), "p".into(), Some(&after), 3, |_url: String| {
            calls += 1;
            let newest = 1000 - calls * 10;
            let page = backlog_page([newest, newest - 5], Some("next"));
            async move { Ok(page) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 3);
        assert!(matches!(err, TransportError::Unavailable(_)));
    }

    #[tokio::test]
    async fn without_cursor_only_the_first_page_is_read() {
        let mut calls = 0;
        let msgs = collect_pages(&channel(), "p".into(), None, 10, |_url: String| {
            calls += 1;
            let page = backlog_page([9, 8], Some("next"));
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(msgs.len(), 2);
    }

    #[tokio::test]
    async fn history_ending_before_cursor_returns_everything() {
        let after = MessageId::new("5");
        let msgs = collect_pages(&channel(), "p".into(), Some(&after), 10, |_url: String| {
            let page = backlog_page([9, 8], None);
            async move { Ok(page) }
        })
        .await
        .unwrap();
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn delete_412_is_forbidden() {
        let err = map_delete_status(
            StatusCode::PRECONDITION_FAILED,
            &MessageId::new("1"),
            "Precondition Failed",
        );
        assert!(matches!(err, TransportError::DeletionForbidden { .. }));
    }

    #[test]
    fn delete_403_is_forbidden() {
        let err = map_delete_status(StatusCode::FORBIDDEN, &MessageId::new("1"), "");
        assert!(matches!(err, TransportError::DeletionForbidden { .. }));
    }

    #[test]
    fn delete_404_is_not_found() {
        let err = map_delete_status(StatusCode::NOT_FOUND, &MessageId::new("1"), "");
        assert!(matches!(err, TransportError::MessageNotFound { .. }));
    }

    #[test]
    fn generic_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, ""),
            TransportError::Auth(_)
        ));
        assert!(matches!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            TransportError::Unavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, ""),
            TransportError::Unavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, "bad"),
            TransportError::Http(_)
        ));
    }
}
