//! Webhook client
//!
//! Every backend operation is a JSON POST to an n8n webhook. Responses come in
//! several envelope shapes; `extract_records` finds the record array in them.

use crate::config::{Config, Endpoints, ORG_HEADER};
use crate::error::{Error, Result};
use crate::message::UserId;
use crate::normalize::RawRecord;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Where the record array was found in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Array,
    Conversations,
    Messages,
    Data,
    Unrecognized,
}

/// Detect the response envelope, in priority order
pub fn detect_shape(value: &Value) -> ResponseShape {
    if value.is_array() {
        return ResponseShape::Array;
    }
    for (key, shape) in [
        ("conversations", ResponseShape::Conversations),
        ("messages", ResponseShape::Messages),
        ("data", ResponseShape::Data),
    ] {
        if value.get(key).map_or(false, Value::is_array) {
            return shape;
        }
    }
    ResponseShape::Unrecognized
}

/// Pull the record array out of a response. Unknown shapes yield no records.
pub fn extract_records(value: Value) -> Vec<RawRecord> {
    let shape = detect_shape(&value);
    let records = match (shape, value) {
        (ResponseShape::Array, Value::Array(items)) => items,
        (ResponseShape::Conversations, Value::Object(mut obj)) => take_array(&mut obj, "conversations"),
        (ResponseShape::Messages, Value::Object(mut obj)) => take_array(&mut obj, "messages"),
        (ResponseShape::Data, Value::Object(mut obj)) => take_array(&mut obj, "data"),
        (_, other) => {
            warn!(body = %truncate(&other.to_string(), 200), "Unrecognized response shape, treating as empty");
            Vec::new()
        }
    };
    debug!(?shape, count = records.len(), "Extracted records");
    records
}

fn take_array(obj: &mut serde_json::Map<String, Value>, key: &str) -> Vec<Value> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Auto-reply text from the send webhook: `{reply}`, a bare string, or `{data: {reply}}`
pub fn extract_reply_text(value: &Value) -> Option<String> {
    let reply = match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(_) => value
            .get("reply")
            .and_then(Value::as_str)
            .or_else(|| value.pointer("/data/reply").and_then(Value::as_str)),
        _ => None,
    };
    reply
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
}

/// `{success}` or `[{success}]`
pub fn reply_succeeded(value: &Value) -> bool {
    let target = match value {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    target
        .and_then(|v| v.get("success"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Parse a success body; blank bodies and non-JSON are fetch failures
pub fn parse_body(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Err(Error::EmptyBody);
    }
    serde_json::from_str(text).map_err(|e| Error::InvalidJson(e.to_string()))
}

/// Human message for a non-2xx reply
fn error_message(status: u16, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("HTTP Error: {}", status))
}

/// Member message to the support chat
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageRequest {
    pub org_id: Option<i64>,
    pub user_id: UserId,
    pub user_name: String,
    pub phone: Option<String>,
    pub message: String,
    pub timestamp: String,
}

/// Admin reply into a member's conversation
#[derive(Debug, Clone, Serialize)]
pub struct ChatReplyRequest {
    pub org_id: Option<i64>,
    pub user_id: UserId,
    pub admin_id: UserId,
    pub admin_name: String,
    pub message: String,
    pub timestamp: String,
}

/// HTTP client for the chat webhooks
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    timeout_secs: u64,
}

impl WebhookClient {
    /// Build a client for one tenant. `org_id` goes out as `x-org-id` on every call.
    pub fn new(config: &Config, org_id: Option<i64>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(org_id) = org_id {
            let value = HeaderValue::from_str(&org_id.to_string())
                .map_err(|e| Error::Config(format!("invalid org id header: {}", e)))?;
            headers.insert(HeaderName::from_static(ORG_HEADER), value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            endpoints: config.endpoints(),
            timeout_secs: config.request_timeout_secs,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout_secs)
        } else {
            Error::Http(e)
        }
    }

    /// POST a JSON body and parse the JSON reply
    pub async fn post_json<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<Value> {
        debug!(url, "POST webhook");

        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                message: error_message(status.as_u16(), &text),
            });
        }

        parse_body(&text)
    }

    /// POST and extract the record array from whatever envelope comes back
    pub async fn fetch_records<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<Vec<RawRecord>> {
        let value = self.post_json(url, body).await?;
        Ok(extract_records(value))
    }

    /// Member's own history (app messages and WhatsApp relays)
    pub async fn fetch_chat_history(&self, user_id: &UserId) -> Result<Vec<RawRecord>> {
        self.fetch_records(&self.endpoints.chat_history, &json!({ "user_id": user_id }))
            .await
    }

    /// Admin inbox, one entry per conversation (or flat rows)
    pub async fn fetch_admin_conversations(&self, org_id: i64) -> Result<Vec<RawRecord>> {
        self.fetch_records(
            &self.endpoints.admin_chat_conversations,
            &json!({ "org_id": org_id }),
        )
        .await
    }

    /// Every conversation of the organization
    pub async fn fetch_all_conversations(&self, org_id: i64) -> Result<Vec<RawRecord>> {
        self.fetch_records(
            &self.endpoints.all_chat_conversations,
            &json!({ "org_id": org_id }),
        )
        .await
    }

    /// One member's thread, as seen from the admin side
    pub async fn fetch_chat_messages(&self, user_id: &UserId) -> Result<Vec<RawRecord>> {
        self.fetch_records(&self.endpoints.chat_messages, &json!({ "user_id": user_id }))
            .await
    }

    /// Send a member message; returns the workflow's auto-reply if it gave one
    pub async fn send_chat_message(&self, request: &ChatMessageRequest) -> Result<Option<String>> {
        let value = self
            .post_json(&self.endpoints.send_chat_message, request)
            .await?;
        Ok(extract_reply_text(&value))
    }

    /// Send an admin reply; true when the workflow confirmed it
    pub async fn send_chat_reply(&self, request: &ChatReplyRequest) -> Result<bool> {
        let value = self.post_json(&self.endpoints.chat_reply, request).await?;
        Ok(reply_succeeded(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_shape_priority() {
        assert_eq!(detect_shape(&json!([])), ResponseShape::Array);
        assert_eq!(
            detect_shape(&json!({"conversations": [], "messages": [], "data": []})),
            ResponseShape::Conversations
        );
        assert_eq!(
            detect_shape(&json!({"messages": [], "data": []})),
            ResponseShape::Messages
        );
        assert_eq!(
            detect_shape(&json!({"success": true, "data": []})),
            ResponseShape::Data
        );
        assert_eq!(
            detect_shape(&json!({"conversations": "nope"})),
            ResponseShape::Unrecognized
        );
        assert_eq!(detect_shape(&json!("text")), ResponseShape::Unrecognized);
    }

    #[test]
    fn test_extract_records() {
        let records = extract_records(json!({"data": [{"user_id": 1}, {"user_id": 2}]}));
        assert_eq!(records.len(), 2);

        let records = extract_records(json!([{"user_id": 1}]));
        assert_eq!(records.len(), 1);

        assert!(extract_records(json!({"ok": true})).is_empty());
        assert!(extract_records(json!(null)).is_empty());
    }

    #[test]
    fn test_extract_reply_text() {
        assert_eq!(
            extract_reply_text(&json!({"reply": "We got it"})).as_deref(),
            Some("We got it")
        );
        assert_eq!(extract_reply_text(&json!("Plain")).as_deref(), Some("Plain"));
        assert_eq!(
            extract_reply_text(&json!({"data": {"reply": "Nested"}})).as_deref(),
            Some("Nested")
        );
        assert_eq!(extract_reply_text(&json!({"reply": ""})), None);
        assert_eq!(extract_reply_text(&json!({"ok": true})), None);
        assert_eq!(extract_reply_text(&json!([1, 2])), None);
    }

    #[test]
    fn test_reply_succeeded() {
        assert!(reply_succeeded(&json!({"success": true, "id": 9})));
        assert!(reply_succeeded(&json!([{"success": true, "id": 9}])));
        assert!(!reply_succeeded(&json!({"success": false})));
        assert!(!reply_succeeded(&json!([])));
        assert!(!reply_succeeded(&json!({"id": 9})));
    }

    #[test]
    fn test_parse_body() {
        assert!(matches!(parse_body(""), Err(Error::EmptyBody)));
        assert!(matches!(parse_body("  \n"), Err(Error::EmptyBody)));
        assert!(matches!(parse_body("<html>"), Err(Error::InvalidJson(_))));
        assert_eq!(parse_body("[1]").unwrap(), json!([1]));
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(400, r#"{"message": "org_id required"}"#),
            "org_id required"
        );
        assert_eq!(error_message(502, "<html>bad gateway</html>"), "HTTP Error: 502");
    }

    #[test]
    fn test_client_builds_with_org_header() {
        let config = Config::for_test(&std::env::temp_dir());
        let client = WebhookClient::new(&config, Some(3)).unwrap();
        assert!(client.endpoints().chat_history.ends_with("/chat-history"));
    }

    #[test]
    fn test_request_bodies() {
        let req = ChatReplyRequest {
            org_id: Some(3),
            user_id: UserId::Int(7),
            admin_id: UserId::Int(1),
            admin_name: "Pastor".to_string(),
            message: "Noted".to_string(),
            timestamp: "2024-01-01T10:00:00.000Z".to_string(),
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["user_id"], json!(7));
        assert_eq!(body["org_id"], json!(3));
        assert_eq!(body["admin_name"], json!("Pastor"));
    }
}
