//! Gmail mailbox source — history API over REST with an OAuth refresh token.
//!
//! `baseline` reads the profile's current `historyId`. `history_since` walks
//! `users.history.list` (all pages) for `messageAdded` records, then fetches
//! each message in full. A message deleted before it could be fetched (404)
//! is skipped; any other failure fails the whole call so the marker stays.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channels::credentials::CredentialsProvider;
use crate::error::FetchError;
use crate::pipeline::fetcher::{HistoryPage, MailSource};
use crate::pipeline::types::PendingMessage;

const PROVIDER: &str = "gmail";
const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Refresh the access token this long before it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// ── Configuration ───────────────────────────────────────────────────

/// OAuth client settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub api_base: String,
    pub token_url: String,
}

impl GmailConfig {
    /// Returns `None` if `GOOGLE_CLIENT_ID` or `GOOGLE_CLIENT_SECRET` is not set.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("GOOGLE_CLIENT_ID").ok()?;
        let client_secret = std::env::var("GOOGLE_CLIENT_SECRET").ok()?;

        Some(Self {
            client_id,
            client_secret: SecretString::from(client_secret),
            api_base: std::env::var("GMAIL_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            token_url: std::env::var("GOOGLE_TOKEN_URL")
                .unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string()),
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    history_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    id: String,
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    internal_date: Option<String>,
    #[serde(default)]
    payload: MessagePart,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: PartBody,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct PartBody {
    data: Option<String>,
}

// ── Parsing ─────────────────────────────────────────────────────────

fn header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Decode Gmail's base64url body data, tolerating padding and standard alphabet.
fn decode_body(data: &str) -> Option<String> {
    let trimmed = data.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(data))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// First `text/plain` part, searching nested multiparts depth-first.
fn find_text_part(part: &MessagePart) -> Option<&MessagePart> {
    part.parts.iter().find_map(|p| {
        if p.mime_type.eq_ignore_ascii_case("text/plain") && p.body.data.is_some() {
            Some(p)
        } else {
            find_text_part(p)
        }
    })
}

fn extract_body(payload: &MessagePart) -> String {
    let data = if payload.parts.is_empty() {
        payload.body.data.as_deref()
    } else {
        find_text_part(payload).and_then(|p| p.body.data.as_deref())
    };
    data.and_then(decode_body).unwrap_or_default()
}

fn to_pending(message: GmailMessage) -> PendingMessage {
    let subject = header(&message.payload.headers, "Subject").unwrap_or_default();
    let sender = header(&message.payload.headers, "From").unwrap_or_default();
    let body = extract_body(&message.payload);

    let pending = PendingMessage::new(subject, sender, body, message.id.clone());
    match message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    {
        Some(at) => pending.with_received_at(at),
        None => pending,
    }
}

/// Message ids added across history records, first occurrence order.
fn added_message_ids(records: &[HistoryRecord]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    records
        .iter()
        .flat_map(|r| r.messages_added.iter())
        .filter(|m| seen.insert(m.message.id.clone()))
        .map(|m| m.message.id.clone())
        .collect()
}

// ── Source ──────────────────────────────────────────────────────────

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

/// Gmail REST mail source.
pub struct GmailSource {
    config: GmailConfig,
    credentials: Arc<dyn CredentialsProvider>,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl GmailSource {
    pub fn new(config: GmailConfig, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            config,
            credentials,
            client: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    fn request_failed(e: reqwest::Error) -> FetchError {
        FetchError::RequestFailed {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        }
    }

    fn invalid_response(e: impl std::fmt::Display) -> FetchError {
        FetchError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        }
    }

    /// Cached access token, exchanging the refresh token when stale.
    async fn access_token(&self) -> Result<String, FetchError> {
        let mut cached = self.token.lock().await;
        if let Some(t) = cached.as_ref() {
            if Instant::now() < t.expires_at {
                return Ok(t.token.expose_secret().to_string());
            }
        }

        let refresh = self
            .credentials
            .refresh_token()
            .ok_or_else(|| FetchError::AuthFailed {
                provider: PROVIDER.into(),
                reason: "no refresh token".into(),
            })?;

        let resp = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("refresh_token", refresh.expose_secret()),
            ])
            .send()
            .await
            .map_err(Self::request_failed)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::AuthFailed {
                provider: PROVIDER.into(),
                reason: format!("token endpoint returned {status}: {body}"),
            });
        }

        let token: TokenResponse = resp.json().await.map_err(Self::invalid_response)?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        debug!(expires_in_secs = lifetime.as_secs(), "Refreshed Gmail access token");

        let access = token.access_token;
        *cached = Some(CachedToken {
            token: SecretString::from(access.clone()),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });
        Ok(access)
    }

    /// GET `{api_base}{path}` with the bearer token and decode JSON.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(format!("{}{path}", self.config.api_base))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(Self::request_failed)?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.token.lock().await.take();
            return Err(FetchError::AuthFailed {
                provider: PROVIDER.into(),
                reason: "access token rejected".into(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                provider: PROVIDER.into(),
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        resp.json().await.map_err(Self::invalid_response)
    }

    async fn fetch_message(&self, id: &str) -> Result<PendingMessage, FetchError> {
        let message: GmailMessage = self
            .get_json(&format!("/messages/{id}"), &[("format", "full")])
            .await?;
        Ok(to_pending(message))
    }
}

#[async_trait]
impl MailSource for GmailSource {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn baseline(&self) -> Result<String, FetchError> {
        let profile: Profile = self.get_json("/profile", &[]).await?;
        Ok(profile.history_id)
    }

    async fn history_since(&self, marker: &str) -> Result<HistoryPage, FetchError> {
        let mut records = Vec::new();
        let mut latest: Option<String> = None;
        let mut page_token: Option<String> = None;

        loop {
            let result = {
                let mut query = vec![
                    ("startHistoryId", marker),
                    ("historyTypes", "messageAdded"),
                ];
                if let Some(t) = page_token.as_deref() {
                    query.push(("pageToken", t));
                }
                self.get_json::<HistoryListResponse>("/history", &query).await
            };

            let page = match result {
                Ok(page) => page,
                // Gmail answers 404 when startHistoryId is too old.
                Err(FetchError::Status { status: 404, .. }) => {
                    return Err(FetchError::MarkerExpired {
                        marker: marker.to_string(),
                    });
                }
                Err(e) => return Err(e),
            };

            if let Some(id) = page
                .history_id
                .or_else(|| page.history.last().map(|r| r.id.clone()))
            {
                latest = Some(id);
            }
            records.extend(page.history);

            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }

        let ids = added_message_ids(&records);
        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.fetch_message(id).await {
                Ok(m) => messages.push(m),
                Err(e @ FetchError::Status { status: 404, .. }) => {
                    warn!(message_id = %id, error = %e, "Skipping message deleted before fetch");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(HistoryPage {
            messages,
            next_marker: latest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(s: &str) -> String {
        URL_SAFE_NO_PAD.encode(s)
    }

    fn message(value: serde_json::Value) -> GmailMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn simple_message_uses_top_level_body() {
        let m = message(json!({
            "id": "m1",
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    {"name": "Subject", "value": "Quarterly report"},
                    {"name": "From", "value": "Boss <boss@corp.com>"}
                ],
                "body": {"data": encode("Please review by Friday")}
            }
        }));

        let p = to_pending(m);
        assert_eq!(p.external_id, "m1");
        assert_eq!(p.subject, "Quarterly report");
        assert_eq!(p.sender, "Boss <boss@corp.com>");
        assert_eq!(p.body, "Please review by Friday");
        assert_eq!(p.received_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn multipart_picks_text_plain() {
        let m = message(json!({
            "id": "m2",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [{"name": "subject", "value": "Hi"}],
                "parts": [
                    {"mimeType": "text/html", "body": {"data": encode("<p>html</p>")}},
                    {"mimeType": "text/plain", "body": {"data": encode("plain ü")}}
                ]
            }
        }));

        let p = to_pending(m);
        assert_eq!(p.subject, "Hi");
        assert_eq!(p.sender, "");
        assert_eq!(p.body, "plain ü");
        assert!(p.received_at.is_none());
    }

    #[test]
    fn nested_multipart_is_searched() {
        let m = message(json!({
            "id": "m3",
            "payload": {
                "mimeType": "multipart/mixed",
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "parts": [
                            {"mimeType": "text/plain", "body": {"data": encode("inner")}}
                        ]
                    },
                    {"mimeType": "application/pdf", "body": {}}
                ]
            }
        }));
        assert_eq!(to_pending(m).body, "inner");
    }

    #[test]
    fn multipart_without_text_part_has_empty_body() {
        let m = message(json!({
            "id": "m4",
            "payload": {
                "parts": [{"mimeType": "text/html", "body": {"data": encode("<b>x</b>")}}]
            }
        }));
        assert_eq!(to_pending(m).body, "");
    }

    #[test]
    fn decode_accepts_padding_and_url_alphabet() {
        assert_eq!(decode_body("aGk=").as_deref(), Some("hi"));
        // "??>" encodes to "Pz8-" in the URL-safe alphabet.
        assert_eq!(decode_body("Pz8-").as_deref(), Some("??>"));
        assert!(decode_body("***").is_none());
    }

    #[test]
    fn history_ids_deduplicated_in_order() {
        let page: HistoryListResponse = serde_json::from_value(json!({
            "history": [
                {"id": "11", "messagesAdded": [{"message": {"id": "a"}}, {"message": {"id": "b"}}]},
                {"id": "12"},
                {"id": "13", "messagesAdded": [{"message": {"id": "a"}}, {"message": {"id": "c"}}]}
            ],
            "historyId": "13"
        }))
        .unwrap();

        assert_eq!(added_message_ids(&page.history), vec!["a", "b", "c"]);
        assert_eq!(page.history_id.as_deref(), Some("13"));
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn empty_history_response_parses() {
        let page: HistoryListResponse =
            serde_json::from_value(json!({"historyId": "99"})).unwrap();
        assert!(page.history.is_empty());
    }

    // ── Against a local mock of the Gmail API ───────────────────────

    use std::collections::HashMap;

    use axum::{
        Json, Router,
        extract::{Path, State},
        http::StatusCode,
        routing::{get, post},
    };

    use crate::channels::credentials::StaticCredentials;

    /// Serve a fake token endpoint and mailbox; `statuses` overrides the
    /// response code for individual message ids.
    async fn mock_gmail(statuses: HashMap<String, u16>) -> GmailSource {
        async fn message(
            State(statuses): State<Arc<HashMap<String, u16>>>,
            Path(id): Path<String>,
        ) -> (StatusCode, Json<serde_json::Value>) {
            let status = statuses.get(&id).copied().unwrap_or(200);
            let body = json!({
                "id": id,
                "payload": {
                    "mimeType": "text/plain",
                    "headers": [{"name": "Subject", "value": format!("Subject {id}")}],
                    "body": {"data": URL_SAFE_NO_PAD.encode("body")}
                }
            });
            (StatusCode::from_u16(status).unwrap(), Json(body))
        }

        let app = Router::new()
            .route(
                "/token",
                post(|| async { Json(json!({"access_token": "at-1", "expires_in": 3600})) }),
            )
            .route(
                "/history",
                get(|| async {
                    Json(json!({
                        "history": [
                            {"id": "11", "messagesAdded": [
                                {"message": {"id": "a"}},
                                {"message": {"id": "b"}}
                            ]}
                        ],
                        "historyId": "11"
                    }))
                }),
            )
            .route("/messages/{id}", get(message))
            .with_state(Arc::new(statuses));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = GmailConfig {
            client_id: "client".into(),
            client_secret: SecretString::from("secret"),
            api_base: format!("http://127.0.0.1:{port}"),
            token_url: format!("http://127.0.0.1:{port}/token"),
        };
        GmailSource::new(config, Arc::new(StaticCredentials::new("rt-1")))
    }

    #[tokio::test]
    async fn history_returns_all_added_messages() {
        let source = mock_gmail(HashMap::new()).await;
        let page = source.history_since("10").await.unwrap();

        let ids: Vec<_> = page.messages.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(page.messages[0].subject, "Subject a");
        assert_eq!(page.next_marker.as_deref(), Some("11"));
    }

    #[tokio::test]
    async fn transient_message_failure_fails_the_history_call() {
        let source = mock_gmail(HashMap::from([("a".to_string(), 503)])).await;
        let err = source.history_since("10").await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn rejected_token_fails_the_history_call() {
        let source = mock_gmail(HashMap::from([("b".to_string(), 401)])).await;
        let err = source.history_since("10").await.unwrap_err();
        assert!(matches!(err, FetchError::AuthFailed { .. }));
        assert!(source.token.lock().await.is_none());
    }

    #[tokio::test]
    async fn deleted_message_is_skipped() {
        let source = mock_gmail(HashMap::from([("a".to_string(), 404)])).await;
        let page = source.history_since("10").await.unwrap();

        let ids: Vec<_> = page.messages.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(page.next_marker.as_deref(), Some("11"));
    }
}
