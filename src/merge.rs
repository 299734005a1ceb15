//! Incremental merge of freshly fetched messages into held conversations
//!
//! Dedup is by `MessageId`. Ids are tagged by the space that minted them, so a
//! server id can only ever match a server id and an optimistic local message is
//! never mistaken for a confirmed one. Merging never removes or reorders what is
//! already held; new messages go to the end in batch order.

use crate::conversation::{AggregateReport, Conversation, Conversations};
use crate::message::{timestamp_from_value, CanonicalMessage, MessageId, UserId};
use crate::normalize::{normalize, normalize_owned, unwrap_envelope, AliasTable, RawRecord};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Keys of a pre-grouped conversation's nested messages and last activity
const MESSAGES_KEY: &str = "messages";
const LAST_MESSAGE_TIME_KEYS: &[&str] = &["last_message_time", "lastMessageTime"];

/// Result of merging one batch into one message list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub appended: usize,
    pub duplicates: usize,
}

/// Append messages whose id isn't already held. `existing` is untouched when
/// nothing in the batch is new.
pub fn merge_messages(
    existing: &mut Vec<CanonicalMessage>,
    batch: impl IntoIterator<Item = CanonicalMessage>,
) -> MergeCounts {
    let mut known: HashSet<MessageId> = existing.iter().map(|m| m.id.clone()).collect();
    let mut counts = MergeCounts::default();

    for message in batch {
        if known.insert(message.id.clone()) {
            existing.push(message);
            counts.appended += 1;
        } else {
            counts.duplicates += 1;
        }
    }

    counts
}

/// Merge a batch into one conversation and refresh `last_message_time`
pub fn merge_into(
    conversation: &mut Conversation,
    batch: impl IntoIterator<Item = CanonicalMessage>,
) -> MergeCounts {
    let counts = merge_messages(&mut conversation.messages, batch);
    if counts.appended > 0 {
        conversation.recompute_last_message_time();
    }
    counts
}

/// Outcome of merging a fetched record batch into a conversation map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub appended: usize,
    pub duplicates: usize,
    pub new_conversations: usize,
    pub profiles_updated: usize,
    pub quality: AggregateReport,
}

impl MergeReport {
    /// False when the held state is exactly as it was before the merge
    pub fn changed(&self) -> bool {
        self.appended > 0 || self.new_conversations > 0 || self.profiles_updated > 0
    }
}

/// Per-user batches in first-seen order
#[derive(Default)]
struct PendingBatches {
    batches: Vec<(UserId, Vec<CanonicalMessage>)>,
    index: HashMap<String, usize>,
}

impl PendingBatches {
    fn push(&mut self, message: CanonicalMessage) {
        let key = message.user_id.key();
        match self.index.get(&key) {
            Some(&pos) => self.batches[pos].1.push(message),
            None => {
                self.index.insert(key, self.batches.len());
                self.batches.push((message.user_id.clone(), vec![message]));
            }
        }
    }
}

/// A `{user_id, user_name, phone, last_message_time, messages: [...]}` record
fn grouped_messages(raw: &RawRecord) -> Option<(&Map<String, Value>, &Vec<Value>)> {
    let obj = unwrap_envelope(raw)?;
    match obj.get(MESSAGES_KEY) {
        Some(Value::Array(nested)) => Some((obj, nested)),
        _ => None,
    }
}

fn last_message_time_of(obj: &Map<String, Value>) -> String {
    LAST_MESSAGE_TIME_KEYS
        .iter()
        .filter_map(|key| obj.get(*key))
        .find_map(timestamp_from_value)
        .unwrap_or_default()
}

/// Merge a fetched batch (flat rows, pre-grouped conversations, or a mix) into
/// `conversations`. With `owner` set, every row is attributed to that user.
pub fn merge_records(
    conversations: &mut Conversations,
    records: &[RawRecord],
    aliases: &AliasTable,
    owner: Option<&UserId>,
) -> MergeReport {
    let mut report = MergeReport::default();
    let mut pending = PendingBatches::default();

    let resolve = |raw: &RawRecord| match owner {
        Some(owner) => normalize_owned(raw, owner, aliases),
        None => normalize(raw, aliases),
    };

    for raw in records {
        if let Some((parent, nested)) = grouped_messages(raw) {
            let Some(parent_rec) = resolve(raw) else {
                report.quality.observe(None);
                continue;
            };
            let user_id = parent_rec.message.user_id.clone();
            let (conversation, created) = conversations.get_or_insert_with(&user_id, || {
                Conversation::new(
                    user_id.clone(),
                    &parent_rec.user_name,
                    &parent_rec.phone,
                    &last_message_time_of(parent),
                )
            });
            if created {
                report.new_conversations += 1;
            } else if conversation.fill_profile(&parent_rec.user_name, &parent_rec.phone) {
                report.profiles_updated += 1;
            }
            for message in nested {
                if let Some(rec) = report.quality.observe(normalize_owned(message, &user_id, aliases)) {
                    pending.push(rec.message);
                }
            }
            continue;
        }

        let Some(rec) = report.quality.observe(resolve(raw)) else {
            continue;
        };
        let (conversation, created) = conversations
            .get_or_insert_with(&rec.message.user_id, || Conversation::from_record(&rec));
        if created {
            report.new_conversations += 1;
        } else if conversation.fill_profile(&rec.user_name, &rec.phone) {
            report.profiles_updated += 1;
        }
        pending.push(rec.message);
    }

    for (user_id, batch) in pending.batches {
        if let Some(conversation) = conversations.get_mut(&user_id) {
            let counts = merge_into(conversation, batch);
            report.appended += counts.appended;
            report.duplicates += counts.duplicates;
        }
    }

    report
}

impl Conversations {
    /// Build conversations from an admin payload. Duplicate user entries fold
    /// into one conversation with their messages deduplicated.
    pub fn from_grouped(records: &[RawRecord], aliases: &AliasTable) -> (Self, MergeReport) {
        let mut conversations = Self::new();
        let report = merge_records(&mut conversations, records, aliases, None);
        (conversations, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SenderRole, ServerId};
    use crate::normalize::DEFAULT_ALIASES;
    use serde_json::json;

    fn msg(id: i64, ts: &str) -> CanonicalMessage {
        CanonicalMessage {
            id: MessageId::Server(ServerId::Int(id)),
            user_id: UserId::Int(1),
            text: format!("m{}", id),
            timestamp: ts.to_string(),
            sender: SenderRole::User,
            source: None,
        }
    }

    #[test]
    fn test_no_duplicates() {
        let mut existing = vec![msg(100, "2024-01-01T10:00:00Z")];
        let counts = merge_messages(
            &mut existing,
            vec![msg(100, "2024-01-01T10:00:00Z"), msg(101, "2024-01-01T10:05:00Z")],
        );
        assert_eq!(existing.len(), 2);
        assert_eq!(counts, MergeCounts { appended: 1, duplicates: 1 });
    }

    #[test]
    fn test_idempotent() {
        let batch = vec![msg(100, "2024-01-01T10:00:00Z"), msg(101, "2024-01-01T10:05:00Z")];
        let mut conv = Conversation::new(UserId::Int(1), "Ann", "", "2024-01-01T10:00:00Z");
        conv.messages.push(msg(100, "2024-01-01T10:00:00Z"));

        merge_into(&mut conv, batch.clone());
        let after_first = conv.clone();
        let counts = merge_into(&mut conv, batch);

        assert_eq!(counts.appended, 0);
        assert_eq!(conv, after_first);
        assert_eq!(conv.last_message_time, "2024-01-01T10:05:00Z");
    }

    #[test]
    fn test_appends_after_existing_in_batch_order() {
        let mut existing = vec![msg(5, "2024-01-01T10:00:00Z"), msg(1, "2024-01-01T09:00:00Z")];
        merge_messages(
            &mut existing,
            vec![msg(9, "2024-01-01T08:00:00Z"), msg(1, "x"), msg(7, "2024-01-01T07:00:00Z")],
        );
        let ids: Vec<String> = existing.iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["5", "1", "9", "7"]);
    }

    #[test]
    fn test_duplicate_within_batch() {
        let mut existing = Vec::new();
        let counts = merge_messages(&mut existing, vec![msg(3, "a"), msg(3, "a")]);
        assert_eq!(counts.appended, 1);
        assert_eq!(counts.duplicates, 1);
    }

    #[test]
    fn test_local_and_server_ids_do_not_collide() {
        let mut local = msg(0, "2024-01-01T10:00:00Z");
        local.id = MessageId::Local(1_704_103_200_000);
        let mut existing = vec![local];

        let mut server = msg(0, "2024-01-01T10:00:01Z");
        server.id = MessageId::Server(ServerId::Int(1_704_103_200_000));
        let counts = merge_messages(&mut existing, vec![server]);

        assert_eq!(counts.appended, 1);
        assert_eq!(existing.len(), 2);
    }

    #[test]
    fn test_last_message_time_over_merged_set() {
        let mut conv = Conversation::new(UserId::Int(1), "Ann", "", "2024-01-01T10:00:00Z");
        conv.messages.push(msg(1, "2024-01-01T10:00:00Z"));
        merge_into(&mut conv, vec![msg(2, "2023-12-31T10:00:00Z")]);
        assert_eq!(conv.last_message_time, "2024-01-01T10:00:00Z");
        merge_into(&mut conv, vec![msg(3, "2024-02-01T10:00:00Z")]);
        assert_eq!(conv.last_message_time, "2024-02-01T10:00:00Z");
    }

    #[test]
    fn test_merge_records_flat() {
        let mut convs = Conversations::new();
        let batch = vec![
            json!({"id": 1, "user_id": 7, "message": "a", "created_at": "2024-01-01T10:00:00Z"}),
            json!({"id": 2, "user_id": 8, "message": "b", "created_at": "2024-01-01T11:00:00Z"}),
            json!({"message": "orphan"}),
        ];
        let report = merge_records(&mut convs, &batch, &DEFAULT_ALIASES, None);
        assert_eq!(report.appended, 2);
        assert_eq!(report.new_conversations, 2);
        assert_eq!(report.quality.dropped, 1);
        assert!(report.changed());

        let again = merge_records(&mut convs, &batch, &DEFAULT_ALIASES, None);
        assert_eq!(again.appended, 0);
        assert_eq!(again.duplicates, 2);
        assert!(!again.changed());
        assert_eq!(convs.message_count(), 2);
    }

    #[test]
    fn test_row_without_id_or_time_merges_once() {
        let mut convs = Conversations::new();
        let batch = vec![json!({"user_id": 7, "message": "hello from whatsapp"})];

        let first = merge_records(&mut convs, &batch, &DEFAULT_ALIASES, None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = merge_records(&mut convs, &batch, &DEFAULT_ALIASES, None);

        assert_eq!(first.appended, 1);
        assert_eq!(second.appended, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(convs.message_count(), 1);
    }

    #[test]
    fn test_merge_records_with_owner() {
        let mut convs = Conversations::new();
        let owner = UserId::Int(7);
        let batch = vec![
            json!({"id": 100, "text": "hello", "sender": "user"}),
            json!({"id": 101, "text": "hi back", "sender_type": "admin"}),
        ];
        let report = merge_records(&mut convs, &batch, &DEFAULT_ALIASES, Some(&owner));
        assert_eq!(report.appended, 2);
        assert_eq!(convs.len(), 1);
        let conv = convs.get(&owner).unwrap();
        assert_eq!(conv.messages[1].sender, SenderRole::Admin);
    }

    #[test]
    fn test_from_grouped_folds_duplicate_users() {
        let payload = vec![
            json!({
                "user_id": 4, "user_name": "Grace", "phone": "0700",
                "last_message_time": "2024-01-02T00:00:00Z",
                "messages": [
                    {"id": 1, "text": "one", "timestamp": "2024-01-01T00:00:00Z", "sender": "user"},
                    {"id": 2, "text": "two", "timestamp": "2024-01-02T00:00:00Z", "sender": "admin"}
                ]
            }),
            json!({
                "user_id": 4, "user_name": "Grace",
                "messages": [
                    {"id": 2, "text": "two", "timestamp": "2024-01-02T00:00:00Z"},
                    {"id": 3, "text": "three", "timestamp": "2024-01-03T00:00:00Z"}
                ]
            }),
            json!({"user_id": 5, "user_name": "Idle", "last_message_time": "2023-05-05T00:00:00Z", "messages": []}),
        ];
        let (convs, report) = Conversations::from_grouped(&payload, &DEFAULT_ALIASES);
        assert_eq!(convs.len(), 2);
        let grace = convs.get(&UserId::Int(4)).unwrap();
        assert_eq!(grace.user_name, "Grace");
        assert_eq!(grace.phone, "0700");
        assert_eq!(grace.messages.len(), 3);
        assert!(grace.messages.iter().all(|m| m.user_id == UserId::Int(4)));
        assert_eq!(grace.last_message_time, "2024-01-03T00:00:00Z");
        assert_eq!(report.duplicates, 1);

        let idle = convs.get(&UserId::Int(5)).unwrap();
        assert!(idle.messages.is_empty());
        assert_eq!(idle.last_message_time, "2023-05-05T00:00:00Z");
    }
}
