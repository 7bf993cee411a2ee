/// Conversation index: one derived summary per conversation
///
/// Never the source of truth. Every summary can be recomputed from the
/// conversation's log, and `rebuild_from` does exactly that after corruption.
use crate::error::Result;
use crate::local_store::{decode_record, LocalStore};
use crate::message_log::{ConversationLog, MessageLog};
use crate::messenger_types::{ConversationSummary, Message};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

pub fn summary_key(conversation_id: &str) -> String {
    format!("conversation:{}:summary", conversation_id)
}

/// Recompute a summary from a log.
///
/// Unread = messages by other authors above the read watermark.
pub fn summarize(log: &ConversationLog, local_user_id: &str) -> ConversationSummary {
    let mut summary = ConversationSummary::empty(
        log.conversation_id.clone(),
        log.participant_ids.clone(),
        log.created_at,
    );
    summary.read_through = log.read_through;
    if let Some(last) = log.last() {
        summary.last_message_id = Some(last.id.clone());
        summary.last_sequence = last.sequence;
        summary.updated_at = last.created_at;
    }
    summary.unread_count = log
        .messages
        .iter()
        .filter(|m| m.author_id != local_user_id && m.sequence > log.read_through)
        .count() as u32;
    summary
}

#[derive(Clone)]
pub struct ConversationIndex {
    store: LocalStore,
    local_user_id: String,
}

impl ConversationIndex {
    pub fn new(store: LocalStore, local_user_id: impl Into<String>) -> Self {
        Self {
            store,
            local_user_id: local_user_id.into(),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Create an empty summary if missing; merge participants otherwise
    pub async fn ensure(
        &self,
        conversation_id: &str,
        participant_ids: &BTreeSet<String>,
        created_at: DateTime<Utc>,
    ) -> Result<ConversationSummary> {
        self.update(conversation_id, created_at, |summary| {
            let before = summary.participant_ids.len();
            summary
                .participant_ids
                .extend(participant_ids.iter().cloned());
            before != summary.participant_ids.len()
        })
        .await
    }

    /// Record a message. Only a higher sequence moves `last_message_id`.
    pub async fn touch(
        &self,
        conversation_id: &str,
        message: &Message,
    ) -> Result<ConversationSummary> {
        self.update(conversation_id, message.created_at, |summary| {
            let mut changed = summary.participant_ids.insert(message.author_id.clone());
            if message.sequence > summary.last_sequence {
                summary.last_message_id = Some(message.id.clone());
                summary.last_sequence = message.sequence;
                summary.updated_at = message.created_at;
                changed = true;
            }
            changed
        })
        .await
    }

    /// Count a newly arrived remote message as unread
    pub async fn increment_unread(
        &self,
        conversation_id: &str,
        message: &Message,
    ) -> Result<ConversationSummary> {
        let local = self.local_user_id.clone();
        self.update(conversation_id, message.created_at, |summary| {
            if message.author_id == local || message.sequence <= summary.read_through {
                return false;
            }
            summary.unread_count += 1;
            true
        })
        .await
    }

    /// Mark everything up to the newest known message as read
    pub async fn clear_unread(&self, conversation_id: &str) -> Result<ConversationSummary> {
        self.update(conversation_id, Utc::now(), |summary| {
            let changed =
                summary.unread_count != 0 || summary.read_through < summary.last_sequence;
            summary.unread_count = 0;
            summary.read_through = summary.read_through.max(summary.last_sequence);
            changed
        })
        .await
    }

    /// Replace one summary with the value recomputed from its log
    pub async fn refresh(&self, log: &ConversationLog) -> Result<ConversationSummary> {
        let key = summary_key(&log.conversation_id);
        let summary = summarize(log, &self.local_user_id);
        let stored = summary.clone();
        self.store
            .transaction(&[key.clone()], move |txn| txn.set_record(&key, &stored))
            .await?;
        Ok(summary)
    }

    /// Replay every log and overwrite the whole index with the result
    pub async fn rebuild_from(&self, log: &MessageLog) -> Result<Vec<ConversationSummary>> {
        let logs = log.load_all()?;
        let summaries: Vec<ConversationSummary> = logs
            .iter()
            .map(|l| summarize(l, &self.local_user_id))
            .collect();

        let keys: Vec<String> = summaries
            .iter()
            .map(|s| summary_key(&s.conversation_id))
            .collect();
        self.store
            .transaction(&keys, |txn| {
                for (key, summary) in keys.iter().zip(&summaries) {
                    txn.set_record(key, summary)?;
                }
                Ok(())
            })
            .await?;

        let live: BTreeSet<&String> = keys.iter().collect();
        for (key, _) in self.store.scan_prefix("conversation:")? {
            if key.ends_with(":summary") && !live.contains(&key) {
                warn!("Dropping summary {} with no log behind it", key);
                self.store.remove(&key)?;
            }
        }

        info!("Rebuilt conversation index: {} conversations", summaries.len());
        Ok(sorted(summaries))
    }

    pub fn get(&self, conversation_id: &str) -> Result<Option<ConversationSummary>> {
        self.store.get_record(&summary_key(conversation_id))
    }

    /// All conversations, newest first; ties broken by id ascending
    pub fn list(&self) -> Result<Vec<ConversationSummary>> {
        let mut out = Vec::new();
        for (key, bytes) in self.store.scan_prefix("conversation:")? {
            if key.ends_with(":summary") {
                out.push(decode_record::<ConversationSummary>(&key, &bytes)?);
            }
        }
        Ok(sorted(out))
    }

    async fn update<F>(
        &self,
        conversation_id: &str,
        created_at: DateTime<Utc>,
        apply: F,
    ) -> Result<ConversationSummary>
    where
        F: FnOnce(&mut ConversationSummary) -> bool,
    {
        let key = summary_key(conversation_id);
        self.store
            .transaction(&[key.clone()], |txn| {
                let existing = txn.get_record::<ConversationSummary>(&key)?;
                let created = existing.is_none();
                let mut summary = existing.unwrap_or_else(|| {
                    ConversationSummary::empty(conversation_id, BTreeSet::new(), created_at)
                });
                if apply(&mut summary) || created {
                    debug!(
                        "Summary {} -> last seq {}, unread {}",
                        conversation_id, summary.last_sequence, summary.unread_count
                    );
                    txn.set_record(&key, &summary)?;
                }
                Ok(summary)
            })
            .await
    }
}

fn sorted(mut summaries: Vec<ConversationSummary>) -> Vec<ConversationSummary> {
    summaries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });
    summaries
}
