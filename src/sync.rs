//! Chat sync driver
//!
//! A `ChatSync` holds the conversation state behind one chat view. It is loaded
//! once, refreshed by a cancellable poll task, and refreshed on demand. All of
//! these go through `sync`, and each merge holds the state lock while it runs.

use crate::client::{ChatMessageRequest, ChatReplyRequest, WebhookClient};
use crate::conversation::{Conversation, Conversations};
use crate::error::{Error, Result};
use crate::merge::{merge_into, merge_records, MergeReport};
use crate::message::{now_iso, CanonicalMessage, MessageId, SenderRole, UserId};
use crate::normalize::{AliasTable, RawRecord};
use crate::session::Session;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shown when the send webhook answered without a reply text
pub const FALLBACK_REPLY: &str =
    "Thank you for your message. Our church team will respond shortly.";

/// Shown when the send webhook could not be reached
pub const OFFLINE_REPLY: &str = "Thanks for your message! For urgent matters, please use the WhatsApp button below. We'll respond shortly.";

/// Something that yields raw message records
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Label for logs
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<RawRecord>>;

    /// Set when every fetched row belongs to one known user
    fn owner(&self) -> Option<UserId> {
        None
    }
}

/// A member's own chat history
pub struct HistorySource {
    client: Arc<WebhookClient>,
    user_id: UserId,
}

impl HistorySource {
    pub fn new(client: Arc<WebhookClient>, user_id: UserId) -> Self {
        Self { client, user_id }
    }
}

#[async_trait]
impl RecordSource for HistorySource {
    fn name(&self) -> &str {
        "chat-history"
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>> {
        self.client.fetch_chat_history(&self.user_id).await
    }

    fn owner(&self) -> Option<UserId> {
        Some(self.user_id.clone())
    }
}

/// The admin inbox for one organization
pub struct InboxSource {
    client: Arc<WebhookClient>,
    org_id: i64,
    everything: bool,
}

impl InboxSource {
    /// Conversations waiting on the admin team
    pub fn admin(client: Arc<WebhookClient>, org_id: i64) -> Self {
        Self {
            client,
            org_id,
            everything: false,
        }
    }

    /// Every conversation of the organization
    pub fn all(client: Arc<WebhookClient>, org_id: i64) -> Self {
        Self {
            client,
            org_id,
            everything: true,
        }
    }
}

#[async_trait]
impl RecordSource for InboxSource {
    fn name(&self) -> &str {
        if self.everything {
            "all-chat-conversations"
        } else {
            "admin-chat-conversations"
        }
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>> {
        if self.everything {
            self.client.fetch_all_conversations(self.org_id).await
        } else {
            self.client.fetch_admin_conversations(self.org_id).await
        }
    }
}

/// One member's thread, opened from the admin inbox
pub struct ThreadSource {
    client: Arc<WebhookClient>,
    user_id: UserId,
}

impl ThreadSource {
    pub fn new(client: Arc<WebhookClient>, user_id: UserId) -> Self {
        Self { client, user_id }
    }
}

#[async_trait]
impl RecordSource for ThreadSource {
    fn name(&self) -> &str {
        "chat-messages"
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>> {
        self.client.fetch_chat_messages(&self.user_id).await
    }

    fn owner(&self) -> Option<UserId> {
        Some(self.user_id.clone())
    }
}

/// Who asked for a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Initial,
    Poll,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Initial => "initial",
            SyncTrigger::Poll => "poll",
            SyncTrigger::Manual => "manual",
        }
    }
}

/// Outcome of one sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub fetched: usize,
    pub merge: MergeReport,
    /// Set when a poll fetch failed and the held state was kept
    pub error: Option<String>,
}

impl SyncReport {
    fn failed(trigger: SyncTrigger, err: &Error) -> Self {
        Self {
            trigger,
            fetched: 0,
            merge: MergeReport::default(),
            error: Some(err.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of an optimistic send
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub sent: CanonicalMessage,
    pub reply: CanonicalMessage,
    /// False when the webhook failed and the offline reply was shown
    pub delivered: bool,
}

/// Running poll task. Dropping the handle also stops the loop.
pub struct PollHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Stop polling and wait for the task to exit
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Poll task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Conversation state for one view plus the source that refreshes it
pub struct ChatSync<S> {
    source: Arc<S>,
    aliases: Arc<AliasTable>,
    state: Arc<Mutex<Conversations>>,
    version: Arc<watch::Sender<u64>>,
    last_local_id: Arc<AtomicU64>,
}

impl<S> Clone for ChatSync<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            aliases: Arc::clone(&self.aliases),
            state: Arc::clone(&self.state),
            version: Arc::clone(&self.version),
            last_local_id: Arc::clone(&self.last_local_id),
        }
    }
}

impl<S: RecordSource + 'static> ChatSync<S> {
    pub fn new(source: S, aliases: AliasTable) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            source: Arc::new(source),
            aliases: Arc::new(aliases),
            state: Arc::new(Mutex::new(Conversations::new())),
            version: Arc::new(version),
            last_local_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch from the source and merge. A failed fetch leaves the state as it
    /// was; poll failures are logged and reported, others are returned.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let name = self.source.name();
        let records = match self.source.fetch().await {
            Ok(records) => records,
            Err(e) if trigger == SyncTrigger::Poll => {
                warn!(source = name, error = %e, "Poll failed, keeping last state");
                return Ok(SyncReport::failed(trigger, &e));
            }
            Err(e) => {
                error!(source = name, trigger = trigger.as_str(), error = %e, "Sync failed");
                return Err(e);
            }
        };

        let owner = self.source.owner();
        let merge = {
            let mut state = self.state.lock().await;
            merge_records(&mut *state, &records, &self.aliases, owner.as_ref())
        };
        merge.quality.log_summary(name);

        if merge.changed() {
            self.version.send_modify(|v| *v += 1);
            info!(
                source = name,
                trigger = trigger.as_str(),
                appended = merge.appended,
                new_conversations = merge.new_conversations,
                "Merged new messages"
            );
        } else {
            debug!(source = name, trigger = trigger.as_str(), "No new messages");
        }

        Ok(SyncReport {
            trigger,
            fetched: records.len(),
            merge,
            error: None,
        })
    }

    /// Copy of the held conversations
    pub async fn snapshot(&self) -> Conversations {
        self.state.lock().await.clone()
    }

    pub async fn conversation(&self, user_id: &UserId) -> Option<Conversation> {
        self.state.lock().await.get(user_id).cloned()
    }

    /// Bumped every time the held state changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Local ids are millisecond timestamps, forced strictly increasing
    fn next_local_id(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let prev = self
            .last_local_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or_else(|prev| prev);
        now.max(prev + 1)
    }

    /// Append a client-side message to its conversation, creating it if needed
    pub async fn append_local(&self, message: CanonicalMessage, user_name: &str, phone: &str) -> bool {
        let appended = {
            let mut state = self.state.lock().await;
            let user_id = message.user_id.clone();
            let (conversation, _) = state.get_or_insert_with(&user_id, || {
                Conversation::new(user_id.clone(), user_name, phone, &message.timestamp)
            });
            merge_into(conversation, [message]).appended > 0
        };
        if appended {
            self.version.send_modify(|v| *v += 1);
        }
        appended
    }

    /// Member send: show the message at once, post it, then show the
    /// workflow's auto reply (or the offline reply if the post failed)
    pub async fn send(
        &self,
        client: &WebhookClient,
        session: &Session,
        text: &str,
    ) -> Result<SendOutcome> {
        if text.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }
        let user = session.require_user()?;
        let user_id = user.user_id();
        let user_name = user.display_name();
        let phone = user.phone.clone().unwrap_or_default();

        let sent = CanonicalMessage {
            id: MessageId::Local(self.next_local_id()),
            ..CanonicalMessage::local(user_id.clone(), text, SenderRole::User, "app")
        };
        self.append_local(sent.clone(), &user_name, &phone).await;

        let request = ChatMessageRequest {
            org_id: session.org_id(),
            user_id: user_id.clone(),
            user_name: user_name.clone(),
            phone: user.phone.clone(),
            message: sent.text.clone(),
            timestamp: sent.timestamp.clone(),
        };

        let (reply_text, delivered) = match client.send_chat_message(&request).await {
            Ok(reply) => (reply.unwrap_or_else(|| FALLBACK_REPLY.to_string()), true),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Send failed, showing offline reply");
                (OFFLINE_REPLY.to_string(), false)
            }
        };

        let reply = CanonicalMessage {
            id: MessageId::Local(self.next_local_id()),
            ..CanonicalMessage::local(user_id, &reply_text, SenderRole::Admin, "auto")
        };
        self.append_local(reply.clone(), &user_name, &phone).await;

        Ok(SendOutcome {
            sent,
            reply,
            delivered,
        })
    }

    /// Admin reply into `user_id`'s conversation; reloads on success
    pub async fn reply(
        &self,
        client: &WebhookClient,
        session: &Session,
        user_id: &UserId,
        text: &str,
    ) -> Result<bool> {
        if text.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }
        let admin = session.require_user()?;
        if !admin.is_admin() {
            return Err(Error::AdminRequired);
        }

        let request = ChatReplyRequest {
            org_id: session.org_id(),
            user_id: user_id.clone(),
            admin_id: admin.user_id(),
            admin_name: admin.display_name(),
            message: text.to_string(),
            timestamp: now_iso(),
        };

        let delivered = client.send_chat_reply(&request).await?;
        if delivered {
            // Delivery is confirmed; the next poll picks the reply up
            if let Err(e) = self.sync(SyncTrigger::Manual).await {
                warn!(user_id = %user_id, error = %e, "Reply delivered but reload failed");
            }
        } else {
            warn!(user_id = %user_id, "Reply webhook did not confirm");
        }
        Ok(delivered)
    }

    /// Poll every `every` until the handle is stopped. The first tick is
    /// skipped since the caller has just loaded.
    pub fn start_polling(&self, every: Duration) -> PollHandle {
        let (stop, mut stopped) = watch::channel(false);
        let sync = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sync.sync(SyncTrigger::Poll).await {
                            warn!(error = %e, "Poll tick failed");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            debug!(source = sync.source.name(), "Polling stopped");
        });

        PollHandle { stop, task }
    }
}
