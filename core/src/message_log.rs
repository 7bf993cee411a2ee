/// Message log: append-only, per-conversation ordered message history
///
/// One record per conversation under `conversation:{id}:messages`, plus a
/// locator under `message:{id}` mapping each message id to its conversation
/// and sequence. All writes to a conversation go through a store transaction
/// on its log key, which makes sequence assignment single-writer.
use crate::error::{ChatError, Result};
use crate::local_store::LocalStore;
use crate::messenger_types::{DeliveryState, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

const CONVERSATION_PREFIX: &str = "conversation:";

/// Highest storable sequence; reads address sequences as non-negative `i64`
pub const MAX_SEQUENCE: u64 = i64::MAX as u64;

pub fn messages_key(conversation_id: &str) -> String {
    format!("{}{}:messages", CONVERSATION_PREFIX, conversation_id)
}

pub fn locator_key(message_id: &str) -> String {
    format!("message:{}", message_id)
}

/// Persisted log of one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationLog {
    pub conversation_id: String,
    pub participant_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    /// Next sequence handed to a local append
    pub next_sequence: u64,
    pub read_through: u64,
    /// Messages at or below this sequence were compacted away
    pub compacted_through: u64,
    /// Sorted by strictly increasing sequence
    pub messages: Vec<Message>,
}

impl ConversationLog {
    fn new(
        conversation_id: &str,
        participant_ids: BTreeSet<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            participant_ids,
            created_at,
            next_sequence: 1,
            read_through: 0,
            compacted_through: 0,
            messages: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last().map(|m| m.sequence).unwrap_or(0)
    }

    fn position(&self, sequence: u64) -> std::result::Result<usize, usize> {
        self.messages.binary_search_by_key(&sequence, |m| m.sequence)
    }

    fn occupied(&self, sequence: u64) -> bool {
        sequence <= self.compacted_through || self.position(sequence).is_ok()
    }

    fn insert(&mut self, message: Message) -> Result<()> {
        let successor = match message.sequence.checked_add(1) {
            Some(next) if message.sequence <= MAX_SEQUENCE => next,
            _ => {
                return Err(ChatError::OutOfRange(format!(
                    "sequence {} in {} exceeds {}",
                    message.sequence, self.conversation_id, MAX_SEQUENCE
                )))
            }
        };
        let at = match self.position(message.sequence) {
            Ok(at) | Err(at) => at,
        };
        self.next_sequence = self.next_sequence.max(successor);
        self.participant_ids.insert(message.author_id.clone());
        self.messages.insert(at, message);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageLocator {
    conversation_id: String,
    sequence: u64,
}

/// How a message landed in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    Inserted,
    /// Same id and content already present; nothing written
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The stored message, with its final sequence
    pub message: Message,
    pub status: AppendStatus,
}

#[derive(Clone, Copy)]
enum SequencePolicy {
    /// Local send: take the next free sequence
    Assign,
    /// Remote message: keep its sequence when that slot is free
    Keep,
}

/// Per-conversation ordered message store
#[derive(Clone)]
pub struct MessageLog {
    store: LocalStore,
}

impl MessageLog {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Create the conversation's log if missing, or add participants to it
    pub async fn ensure_conversation(
        &self,
        conversation_id: &str,
        participant_ids: &BTreeSet<String>,
        created_at: DateTime<Utc>,
    ) -> Result<ConversationLog> {
        let key = messages_key(conversation_id);
        self.store
            .transaction(&[key.clone()], |txn| {
                let existing = txn.get_record::<ConversationLog>(&key)?;
                let created = existing.is_none();
                let mut log = existing.unwrap_or_else(|| {
                    ConversationLog::new(conversation_id, BTreeSet::new(), created_at)
                });
                let before = log.participant_ids.len();
                log.participant_ids.extend(participant_ids.iter().cloned());
                if created || before != log.participant_ids.len() {
                    txn.set_record(&key, &log)?;
                }
                Ok(log)
            })
            .await
    }

    /// Append a locally authored message and return its sequence.
    ///
    /// Re-appending an id that is already present returns the existing
    /// sequence without writing.
    pub async fn append(&self, conversation_id: &str, message: Message) -> Result<u64> {
        let outcome = self.append_local(conversation_id, message).await?;
        Ok(outcome.message.sequence)
    }

    pub async fn append_local(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<AppendOutcome> {
        self.insert(conversation_id, message, SequencePolicy::Assign)
            .await
    }

    /// Merge a remote message, keeping its remote-assigned sequence if free.
    ///
    /// An occupied slot means both sides sequenced different messages at the
    /// same point; the incoming one moves to the next free local sequence.
    pub async fn merge_remote(&self, message: Message) -> Result<AppendOutcome> {
        let conversation_id = message.conversation_id.clone();
        self.insert(&conversation_id, message, SequencePolicy::Keep)
            .await
    }

    async fn insert(
        &self,
        conversation_id: &str,
        mut message: Message,
        policy: SequencePolicy,
    ) -> Result<AppendOutcome> {
        if message.id.is_empty() {
            return Err(ChatError::OutOfRange("message id is empty".to_string()));
        }
        message.conversation_id = conversation_id.to_string();

        let log_key = messages_key(conversation_id);
        let loc_key = locator_key(&message.id);

        self.store
            .transaction(&[log_key.clone(), loc_key.clone()], |txn| {
                let mut log = txn
                    .get_record::<ConversationLog>(&log_key)?
                    .unwrap_or_else(|| {
                        ConversationLog::new(conversation_id, BTreeSet::new(), message.created_at)
                    });

                if let Some(loc) = txn.get_record::<MessageLocator>(&loc_key)? {
                    return resolve_duplicate(&log, &loc, message);
                }

                let sequence = match policy {
                    SequencePolicy::Assign => log.next_sequence,
                    SequencePolicy::Keep if message.sequence == 0 => log.next_sequence,
                    SequencePolicy::Keep if log.occupied(message.sequence) => {
                        warn!(
                            "Sequence {} in {} already taken, re-sequencing {} to {}",
                            message.sequence, conversation_id, message.id, log.next_sequence
                        );
                        log.next_sequence
                    }
                    SequencePolicy::Keep if message.sequence > MAX_SEQUENCE => {
                        warn!(
                            "Rejecting {} in {}: sequence {} out of range",
                            message.id, conversation_id, message.sequence
                        );
                        return Err(ChatError::OutOfRange(format!(
                            "remote sequence {} exceeds {}",
                            message.sequence, MAX_SEQUENCE
                        )));
                    }
                    SequencePolicy::Keep => message.sequence,
                };
                message.sequence = sequence;

                log.insert(message.clone())?;
                txn.set_record(&log_key, &log)?;
                txn.set_record(
                    &loc_key,
                    &MessageLocator {
                        conversation_id: conversation_id.to_string(),
                        sequence,
                    },
                )?;
                debug!("Appended {} to {} at seq {}", message.id, conversation_id, sequence);
                Ok(AppendOutcome {
                    message,
                    status: AppendStatus::Inserted,
                })
            })
            .await
    }

    /// Messages with `sequence >= from_sequence`, ascending, at most `limit`
    pub async fn get(
        &self,
        conversation_id: &str,
        from_sequence: i64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        if from_sequence < 0 {
            return Err(ChatError::OutOfRange(format!(
                "negative start sequence {}",
                from_sequence
            )));
        }
        let from = from_sequence as u64;
        let Some(log) = self.load(conversation_id)? else {
            return Ok(Vec::new());
        };
        if log.compacted_through > 0 && from <= log.compacted_through {
            return Err(ChatError::OutOfRange(format!(
                "{} is compacted through seq {}, requested from {}",
                conversation_id, log.compacted_through, from
            )));
        }
        let start = match log.position(from) {
            Ok(at) | Err(at) => at,
        };
        Ok(log.messages.into_iter().skip(start).take(limit).collect())
    }

    /// The newest `limit` messages, ascending
    pub async fn latest(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.before(conversation_id, u64::MAX, limit).await
    }

    /// Up to `limit` messages strictly below `before_sequence`, ascending
    pub async fn before(
        &self,
        conversation_id: &str,
        before_sequence: u64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let Some(log) = self.load(conversation_id)? else {
            return Ok(Vec::new());
        };
        let end = match log.position(before_sequence) {
            Ok(at) | Err(at) => at,
        };
        let start = end.saturating_sub(limit);
        Ok(log.messages[start..end].to_vec())
    }

    /// Look a message up by id
    pub fn find(&self, message_id: &str) -> Result<Option<Message>> {
        let Some(loc) = self
            .store
            .get_record::<MessageLocator>(&locator_key(message_id))?
        else {
            return Ok(None);
        };
        let Some(log) = self.load(&loc.conversation_id)? else {
            return Ok(None);
        };
        Ok(log
            .position(loc.sequence)
            .ok()
            .map(|at| log.messages[at].clone()))
    }

    pub async fn mark_delivered(&self, message_id: &str) -> Result<Option<Message>> {
        self.set_delivery_state(message_id, DeliveryState::Delivered)
            .await
    }

    /// Move a message's delivery state forward.
    ///
    /// Returns the updated message, or `None` when the step would not change
    /// anything or would regress (e.g. delivered -> pending).
    pub async fn set_delivery_state(
        &self,
        message_id: &str,
        state: DeliveryState,
    ) -> Result<Option<Message>> {
        let loc = self
            .store
            .get_record::<MessageLocator>(&locator_key(message_id))?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        let log_key = messages_key(&loc.conversation_id);

        self.store
            .transaction(&[log_key.clone()], |txn| {
                let mut log = txn
                    .get_record::<ConversationLog>(&log_key)?
                    .ok_or_else(|| {
                        ChatError::NotFound(format!("conversation {}", loc.conversation_id))
                    })?;
                let at = log.position(loc.sequence).map_err(|_| {
                    ChatError::NotFound(format!("message {} (compacted)", message_id))
                })?;

                let current = log.messages[at].delivery_state;
                if !current.can_advance_to(state) {
                    if current != state {
                        debug!(
                            "Ignoring delivery state {:?} -> {:?} for {}",
                            current, state, message_id
                        );
                    }
                    return Ok(None);
                }
                log.messages[at].delivery_state = state;
                let updated = log.messages[at].clone();
                txn.set_record(&log_key, &log)?;
                Ok(Some(updated))
            })
            .await
    }

    /// Raise the read watermark (clamped to the highest known sequence)
    pub async fn mark_read(&self, conversation_id: &str, through_sequence: u64) -> Result<u64> {
        let key = messages_key(conversation_id);
        self.store
            .transaction(&[key.clone()], |txn| {
                let mut log = txn
                    .get_record::<ConversationLog>(&key)?
                    .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;
                let target = through_sequence.min(log.last_sequence());
                if target > log.read_through {
                    log.read_through = target;
                    txn.set_record(&key, &log)?;
                }
                Ok(log.read_through)
            })
            .await
    }

    /// Drop settled, read messages at or below `through_sequence`.
    ///
    /// Stops before the first pending/failed message and always keeps the
    /// newest message. Returns how many messages were removed.
    pub async fn compact(&self, conversation_id: &str, through_sequence: u64) -> Result<usize> {
        let key = messages_key(conversation_id);
        self.store
            .transaction(&[key.clone()], |txn| {
                let mut log = txn
                    .get_record::<ConversationLog>(&key)?
                    .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;

                let mut limit = through_sequence
                    .min(log.read_through)
                    .min(log.last_sequence().saturating_sub(1));
                if let Some(unsettled) = log
                    .messages
                    .iter()
                    .find(|m| !m.delivery_state.is_settled())
                {
                    limit = limit.min(unsettled.sequence.saturating_sub(1));
                }
                if limit <= log.compacted_through {
                    return Ok(0);
                }

                let before = log.messages.len();
                log.messages.retain(|m| m.sequence > limit);
                log.compacted_through = limit;
                let removed = before - log.messages.len();
                txn.set_record(&key, &log)?;
                debug!("Compacted {} messages from {}", removed, conversation_id);
                Ok(removed)
            })
            .await
    }

    /// Full log record of one conversation
    pub fn load(&self, conversation_id: &str) -> Result<Option<ConversationLog>> {
        self.store
            .get_record::<ConversationLog>(&messages_key(conversation_id))
    }

    /// Every conversation with a log, in key order
    pub fn conversation_ids(&self) -> Result<Vec<String>> {
        Ok(self.load_all()?.into_iter().map(|l| l.conversation_id).collect())
    }

    pub fn load_all(&self) -> Result<Vec<ConversationLog>> {
        let mut out = Vec::new();
        for (key, bytes) in self.store.scan_prefix(CONVERSATION_PREFIX)? {
            if !key.ends_with(":messages") {
                continue;
            }
            out.push(crate::local_store::decode_record::<ConversationLog>(
                &key, &bytes,
            )?);
        }
        Ok(out)
    }

    /// Pending and failed messages across all conversations
    pub fn unsettled(&self) -> Result<Vec<Message>> {
        Ok(self
            .load_all()?
            .into_iter()
            .flat_map(|log| log.messages.into_iter())
            .filter(|m| !m.delivery_state.is_settled())
            .collect())
    }
}

fn resolve_duplicate(
    log: &ConversationLog,
    loc: &MessageLocator,
    incoming: Message,
) -> Result<AppendOutcome> {
    if loc.conversation_id != log.conversation_id {
        warn!(
            "Message {} already stored in {}, refusing copy in {}",
            incoming.id, loc.conversation_id, log.conversation_id
        );
        return Err(ChatError::Conflict {
            message_id: incoming.id,
            reason: format!("id already used in conversation {}", loc.conversation_id),
        });
    }

    match log.position(loc.sequence) {
        Ok(at) => {
            let existing = &log.messages[at];
            if existing.same_content(&incoming) {
                Ok(AppendOutcome {
                    message: existing.clone(),
                    status: AppendStatus::Duplicate,
                })
            } else {
                warn!(
                    "Conflicting payload for message {}: kept {}, rejected {}",
                    incoming.id,
                    existing.fingerprint(),
                    incoming.fingerprint()
                );
                Err(ChatError::Conflict {
                    message_id: incoming.id,
                    reason: "payload differs from first-seen copy".to_string(),
                })
            }
        }
        // Compacted: only settled messages are compacted, content no longer comparable
        Err(_) => Ok(AppendOutcome {
            message: Message {
                sequence: loc.sequence,
                delivery_state: DeliveryState::Delivered,
                ..incoming
            },
            status: AppendStatus::Duplicate,
        }),
    }
}
