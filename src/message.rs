//! Canonical message model
//!
//! Every source (app chat, WhatsApp relay, admin replies) is mapped into
//! `CanonicalMessage`. Identifiers are tagged by the space that minted them so
//! dedup never has to guess from the magnitude of a number.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Integer or opaque string identifier as assigned by the backend.
///
/// Strings holding a canonical integer ("42", not "042") collapse to `Int`
/// so the same row is recognised whichever way the webhook serialized it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerId {
    Int(i64),
    Text(String),
}

impl ServerId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ServerId::Int(i))
                } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15) {
                    Some(ServerId::Int(f as i64))
                } else {
                    Some(ServerId::Text(n.to_string()))
                }
            }
            Value::String(s) => Self::from_text(s),
            _ => None,
        }
    }

    pub fn from_text(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        match s.parse::<i64>() {
            Ok(i) if i.to_string() == s => Some(ServerId::Int(i)),
            _ => Some(ServerId::Text(s.to_string())),
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerId::Int(i) => write!(f, "{}", i),
            ServerId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Message identifier, tagged by the space that minted it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Minted on this client (millisecond timestamp) before the server knows the message
    Local(u64),
    /// Assigned by the backend
    Server(ServerId),
    /// Derived from message content when the source carried no id
    Derived(u64),
}

impl MessageId {
    /// Fresh local id from the current wall clock
    pub fn local_now() -> Self {
        MessageId::Local(Utc::now().timestamp_millis().max(0) as u64)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Local(n) => write!(f, "{}", n),
            MessageId::Server(id) => write!(f, "{}", id),
            MessageId::Derived(h) => write!(f, "derived-{:016x}", h),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            MessageId::Local(n) => serializer.serialize_u64(*n),
            MessageId::Server(ServerId::Int(i)) => serializer.serialize_i64(*i),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

/// Conversation owner. Shares the canonical-integer rule of `ServerId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserId {
    Int(i64),
    Text(String),
}

impl UserId {
    /// Resolve from a JSON value; empty strings, null, bools and containers don't count
    pub fn from_value(value: &Value) -> Option<Self> {
        match ServerId::from_value(value)? {
            ServerId::Int(i) => Some(UserId::Int(i)),
            ServerId::Text(s) => Some(UserId::Text(s)),
        }
    }

    /// Aggregation key
    pub fn key(&self) -> String {
        self.to_string()
    }

    pub fn to_value(&self) -> Value {
        match self {
            UserId::Int(i) => Value::from(*i),
            UserId::Text(s) => Value::from(s.as_str()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            UserId::Int(i) => Some(*i),
            UserId::Text(_) => None,
        }
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId::Int(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Int(i) => write!(f, "{}", i),
            UserId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            UserId::Int(i) => serializer.serialize_i64(*i),
            UserId::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// Who wrote the message. Channels that don't fit the enum keep their own tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SenderRole {
    User,
    Admin,
    Other(String),
}

impl SenderRole {
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "user" | "" => SenderRole::User,
            "admin" => SenderRole::Admin,
            _ => SenderRole::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SenderRole::User => "user",
            SenderRole::Admin => "admin",
            SenderRole::Other(s) => s,
        }
    }

    /// Words that name a role rather than a person
    pub fn is_role_keyword(s: &str) -> bool {
        matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "user" | "admin" | "whatsapp" | "system" | "bot" | "auto"
        )
    }
}

impl Default for SenderRole {
    fn default() -> Self {
        SenderRole::User
    }
}

impl Serialize for SenderRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A message after normalization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalMessage {
    pub id: MessageId,
    pub user_id: UserId,
    pub text: String,
    pub timestamp: String, // ISO-8601 as received (or generated)
    pub sender: SenderRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>, // "app", "whatsapp", "auto"; labeling only
}

impl CanonicalMessage {
    /// A message minted on this client, not yet confirmed by the server
    pub fn local(user_id: UserId, text: &str, sender: SenderRole, source: &str) -> Self {
        Self {
            id: MessageId::local_now(),
            user_id,
            text: text.to_string(),
            timestamp: now_iso(),
            sender,
            source: Some(source.to_string()),
        }
    }

    pub fn parsed_time(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    /// Label shown next to relayed messages
    pub fn source_label(&self) -> &'static str {
        match self.source.as_deref() {
            Some("whatsapp") => "WhatsApp",
            Some("app") => "App",
            _ => "",
        }
    }
}

/// Current time in the `2024-01-01T10:00:00.000Z` form the portal writes
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse the timestamp shapes the webhooks emit into an instant.
///
/// Offset-less values are taken as UTC. Returns `None` instead of failing.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // Postgres text output: "2024-01-01 10:00:00.123+03" / "+03:00"
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Render a raw timestamp value as a string; numbers are epoch seconds or millis
pub fn timestamp_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => {
            let raw = n.as_f64()?;
            // Anything past ~5138 AD in seconds is really milliseconds
            let millis = if raw.abs() >= 1.0e11 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64)
                .single()
                .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        _ => None,
    }
}
