//! Message normalizer
//!
//! Maps one raw webhook record into a `CanonicalMessage`. Field names differ by
//! source, so each canonical field is resolved through an ordered alias list
//! (first non-empty value wins). Every field has a default; the only way a record
//! is rejected is an unresolvable user id.

use crate::message::{
    now_iso, parse_timestamp, timestamp_from_value, CanonicalMessage, MessageId, SenderRole,
    ServerId, UserId,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Untyped record as received from a webhook
pub type RawRecord = Value;

/// Key under which n8n wraps item payloads
const ENVELOPE_KEY: &str = "json";

pub const DEFAULT_USER_NAME: &str = "Unknown";

/// Ordered alias list per canonical field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AliasTable {
    pub user_id: Vec<String>,
    pub user_name: Vec<String>,
    pub phone: Vec<String>,
    pub timestamp: Vec<String>,
    pub text: Vec<String>,
    pub sender: Vec<String>,
    pub id: Vec<String>,
    pub source: Vec<String>,
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for AliasTable {
    fn default() -> Self {
        Self {
            user_id: keys(&["user_id", "userId", "id"]),
            user_name: keys(&["user_name", "sender", "name"]),
            phone: keys(&["user_phone", "phone", "telephone"]),
            timestamp: keys(&["created_at", "createdAt", "timestamp", "date"]),
            text: keys(&["message", "text", "msg", "content"]),
            sender: keys(&["sender_type", "senderType", "type"]),
            id: keys(&["id"]),
            source: keys(&["source", "channel"]),
        }
    }
}

/// Alias table used when the tenant doesn't supply one
pub static DEFAULT_ALIASES: Lazy<AliasTable> = Lazy::new(AliasTable::default);

/// Output of a successful normalization
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub message: CanonicalMessage,
    pub user_name: String,
    pub phone: String,
    /// False when the timestamp was present but could not be parsed
    pub timestamp_valid: bool,
}

/// Unwrap one `{ json: {...} }` envelope level, if present
pub fn unwrap_envelope(raw: &Value) -> Option<&Map<String, Value>> {
    let obj = raw.as_object()?;
    match obj.get(ENVELOPE_KEY) {
        Some(Value::Object(inner)) => Some(inner),
        _ => Some(obj),
    }
}

/// First alias whose value passes `extract`
pub fn resolve_first<'a, T>(
    record: &'a Map<String, Value>,
    aliases: &[String],
    extract: impl Fn(&'a Value) -> Option<T>,
) -> Option<T> {
    aliases
        .iter()
        .filter_map(|key| record.get(key))
        .find_map(extract)
}

/// Non-blank string or a number rendered as text
fn non_empty_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalize one record; `None` means drop (no resolvable user id)
pub fn normalize(raw: &RawRecord, aliases: &AliasTable) -> Option<NormalizedRecord> {
    let record = unwrap_envelope(raw)?;
    let user_id = resolve_first(record, &aliases.user_id, UserId::from_value)?;

    let user_name = resolve_first(record, &aliases.user_name, |v| {
        non_empty_text(v).filter(|s| !SenderRole::is_role_keyword(s))
    })
    .unwrap_or_else(|| DEFAULT_USER_NAME.to_string());

    let phone = resolve_first(record, &aliases.phone, non_empty_text).unwrap_or_default();

    let raw_timestamp = resolve_first(record, &aliases.timestamp, timestamp_from_value);
    let timestamp_valid = raw_timestamp
        .as_deref()
        .map_or(true, |ts| parse_timestamp(ts).is_some());

    let text = resolve_first(record, &aliases.text, non_empty_text).unwrap_or_default();

    // Portal-written rows carry the role in a name field ("sender": "admin")
    let sender = resolve_first(record, &aliases.sender, non_empty_text)
        .or_else(|| {
            resolve_first(record, &aliases.user_name, |v| {
                non_empty_text(v).filter(|s| SenderRole::is_role_keyword(s))
            })
        })
        .map(|s| SenderRole::parse(&s))
        .unwrap_or_default();

    let source = resolve_first(record, &aliases.source, non_empty_text)
        .map(|s| s.trim().to_ascii_lowercase());

    // Hash the received timestamp, not the generated one
    let id = resolve_first(record, &aliases.id, ServerId::from_value)
        .map(MessageId::Server)
        .unwrap_or_else(|| derive_id(&user_id, raw_timestamp.as_deref(), &text));
    let timestamp = raw_timestamp.unwrap_or_else(now_iso);

    Some(NormalizedRecord {
        message: CanonicalMessage {
            id,
            user_id,
            text,
            timestamp,
            sender,
            source,
        },
        user_name,
        phone,
        timestamp_valid,
    })
}

/// Normalize a record whose owner is known from context (a user's history, a
/// conversation's nested messages). The owner wins over any id in the record.
pub fn normalize_owned(
    raw: &RawRecord,
    owner: &UserId,
    aliases: &AliasTable,
) -> Option<NormalizedRecord> {
    let Some(owner_key) = aliases.user_id.first() else {
        return normalize(raw, aliases);
    };
    let mut record = unwrap_envelope(raw)?.clone();
    record.insert(owner_key.clone(), owner.to_value());
    normalize(&Value::Object(record), aliases)
}

/// Stable id for id-less records so a re-fetch of the same row dedups
fn derive_id(user_id: &UserId, timestamp: Option<&str>, text: &str) -> MessageId {
    let mut hasher = DefaultHasher::new();
    user_id.key().hash(&mut hasher);
    timestamp.hash(&mut hasher);
    text.hash(&mut hasher);
    MessageId::Derived(hasher.finish())
}
