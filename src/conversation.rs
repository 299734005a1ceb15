//! Conversation aggregation
//!
//! Folds flat message rows into one `Conversation` per user. `last_message_time`
//! tracks the chronologically newest message, which is not necessarily the last
//! one appended: rows arrive in whatever order the workflow emitted them.

use crate::message::{parse_timestamp, CanonicalMessage, UserId};
use crate::normalize::{normalize, AliasTable, NormalizedRecord, RawRecord, DEFAULT_USER_NAME};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

/// All messages between one user and the organization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub user_id: UserId,
    pub user_name: String,
    pub phone: String,
    pub last_message_time: String,
    pub messages: Vec<CanonicalMessage>,
}

impl Conversation {
    pub fn new(user_id: UserId, user_name: &str, phone: &str, last_message_time: &str) -> Self {
        Self {
            user_id,
            user_name: user_name.to_string(),
            phone: phone.to_string(),
            last_message_time: last_message_time.to_string(),
            messages: Vec::new(),
        }
    }

    /// Empty conversation seeded from the first record seen for its user
    pub fn from_record(record: &NormalizedRecord) -> Self {
        Self::new(
            record.message.user_id.clone(),
            &record.user_name,
            &record.phone,
            &record.message.timestamp,
        )
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.last_message_time)
    }

    /// Append in arrival order and keep `last_message_time` at the maximum
    pub fn push(&mut self, message: CanonicalMessage) {
        if self.messages.is_empty() || is_newer(&message.timestamp, &self.last_message_time) {
            self.last_message_time = message.timestamp.clone();
        }
        self.messages.push(message);
    }

    /// Recompute `last_message_time` over every message currently held
    pub fn recompute_last_message_time(&mut self) {
        let mut latest: Option<&str> = None;
        for message in &self.messages {
            match latest {
                Some(current) if !is_newer(&message.timestamp, current) => {}
                _ => latest = Some(message.timestamp.as_str()),
            }
        }
        if let Some(latest) = latest {
            self.last_message_time = latest.to_string();
        }
    }

    /// Replace placeholder profile fields with better data from a later record.
    /// Returns true if anything changed.
    pub fn fill_profile(&mut self, user_name: &str, phone: &str) -> bool {
        let mut changed = false;
        if self.user_name == DEFAULT_USER_NAME && user_name != DEFAULT_USER_NAME {
            self.user_name = user_name.to_string();
            changed = true;
        }
        if self.phone.is_empty() && !phone.is_empty() {
            self.phone = phone.to_string();
            changed = true;
        }
        changed
    }

    /// Last message text for list views
    pub fn preview(&self, max_chars: usize) -> String {
        let Some(last) = self.messages.last() else {
            return "No messages".to_string();
        };
        if last.text.chars().count() > max_chars {
            let head: String = last.text.chars().take(max_chars).collect();
            format!("{}...", head)
        } else {
            last.text.clone()
        }
    }
}

/// Chronological comparison. An unparsable candidate is never newer; a valid
/// candidate always beats an unparsable current value.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    match (parse_timestamp(candidate), parse_timestamp(current)) {
        (Some(c), Some(cur)) => c > cur,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Diagnostics for one aggregation or merge pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateReport {
    pub records: usize,
    pub dropped: usize,
    pub unparsable_timestamps: usize,
}

impl AggregateReport {
    /// Count one normalization result; returns the record if it was kept
    pub fn observe(&mut self, outcome: Option<NormalizedRecord>) -> Option<NormalizedRecord> {
        self.records += 1;
        match outcome {
            Some(record) => {
                if !record.timestamp_valid {
                    self.unparsable_timestamps += 1;
                    debug!(
                        user_id = %record.message.user_id,
                        timestamp = %record.message.timestamp,
                        "Unparsable timestamp"
                    );
                }
                Some(record)
            }
            None => {
                self.dropped += 1;
                debug!("Dropping record without a resolvable user id");
                None
            }
        }
    }

    pub fn log_summary(&self, context: &str) {
        if self.dropped > 0 || self.unparsable_timestamps > 0 {
            warn!(
                context,
                records = self.records,
                dropped = self.dropped,
                unparsable_timestamps = self.unparsable_timestamps,
                "Data quality issues in batch"
            );
        }
    }
}

/// Conversations keyed by user, kept in first-seen order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversations {
    list: Vec<Conversation>,
    index: HashMap<String, usize>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold flat rows into conversations. Every kept row becomes exactly one
    /// message; rows without a user id are dropped and counted.
    pub fn aggregate(records: &[RawRecord], aliases: &AliasTable) -> (Self, AggregateReport) {
        let mut conversations = Self::new();
        let mut report = AggregateReport::default();

        for raw in records {
            let Some(record) = report.observe(normalize(raw, aliases)) else {
                continue;
            };
            let (conversation, _) = conversations.get_or_insert_with(&record.message.user_id, || {
                Conversation::from_record(&record)
            });
            conversation.fill_profile(&record.user_name, &record.phone);
            conversation.push(record.message);
        }

        (conversations, report)
    }

    /// Look up or lazily create the conversation for `user_id`.
    /// The flag is true when it was created by this call.
    pub fn get_or_insert_with(
        &mut self,
        user_id: &UserId,
        create: impl FnOnce() -> Conversation,
    ) -> (&mut Conversation, bool) {
        let key = user_id.key();
        if let Some(&pos) = self.index.get(&key) {
            return (&mut self.list[pos], false);
        }
        let pos = self.list.len();
        self.index.insert(key, pos);
        self.list.push(create());
        (&mut self.list[pos], true)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&Conversation> {
        self.index.get(&user_id.key()).map(|&pos| &self.list[pos])
    }

    pub fn get_mut(&mut self, user_id: &UserId) -> Option<&mut Conversation> {
        let pos = *self.index.get(&user_id.key())?;
        self.list.get_mut(pos)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Conversation> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.list.iter().map(|c| c.messages.len()).sum()
    }

    /// Newest conversation first; unparsable times sink to the bottom
    pub fn by_recency(&self) -> Vec<&Conversation> {
        let mut sorted: Vec<&Conversation> = self.list.iter().collect();
        sorted.sort_by(|a, b| match (a.last_message_at(), b.last_message_at()) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        sorted
    }

    pub fn into_vec(self) -> Vec<Conversation> {
        self.list
    }
}

impl Serialize for Conversations {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.list.iter())
    }
}
