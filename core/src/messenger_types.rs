/// Shared types for the messaging core
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Message kind, derived from the payload variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Deleted,
}

/// Message content, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Text {
        body: String,
    },
    Image {
        uri: String,
        caption: Option<String>,
    },
    File {
        uri: String,
        file_name: String,
        size_bytes: u64,
    },
    /// Tombstone for a removed message; the original stays in the log
    Deleted {
        target_id: String,
    },
}

impl Payload {
    pub fn text(body: impl Into<String>) -> Self {
        Payload::Text { body: body.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Text { .. } => MessageKind::Text,
            Payload::Image { .. } => MessageKind::Image,
            Payload::File { .. } => MessageKind::File,
            Payload::Deleted { .. } => MessageKind::Deleted,
        }
    }

    /// Short human-readable preview for conversation lists
    pub fn preview(&self) -> String {
        match self {
            Payload::Text { body } => body.clone(),
            Payload::Image { caption, .. } => match caption {
                Some(c) if !c.is_empty() => format!("[image] {}", c),
                _ => "[image]".to_string(),
            },
            Payload::File {
                file_name,
                size_bytes,
                ..
            } => format!("[file] {} ({})", file_name, format_size(*size_bytes)),
            Payload::Deleted { .. } => "[deleted]".to_string(),
        }
    }
}

/// Delivery state of a message.
///
/// Moves forward only: pending -> sent -> delivered. The side edges are
/// pending -> failed, failed -> pending (retry) and failed -> sent/delivered
/// (late ack).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryState {
    /// Whether moving from `self` to `next` is a legal, state-changing step
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Delivered)
                | (Pending, Failed)
                | (Sent, Delivered)
                | (Failed, Pending)
                | (Failed, Sent)
                | (Failed, Delivered)
        )
    }

    /// Acknowledged by the transport; no further sync work needed
    pub fn is_settled(self) -> bool {
        matches!(self, DeliveryState::Sent | DeliveryState::Delivered)
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique, the merge key
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    /// Per-conversation order. 0 until the log assigns one.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub payload: Payload,
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Create a locally authored message, not yet sequenced
    pub fn new_local(
        conversation_id: impl Into<String>,
        author_id: impl Into<String>,
        payload: Payload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            author_id: author_id.into(),
            sequence: 0,
            created_at,
            payload,
            delivery_state: DeliveryState::Pending,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Content equality used by idempotent merge. Delivery state and
    /// sequence are local bookkeeping and excluded.
    pub fn same_content(&self, other: &Message) -> bool {
        self.conversation_id == other.conversation_id
            && self.author_id == other.author_id
            && self.payload == other.payload
    }

    /// SHA-256 over author and payload, base64 encoded. Reported with conflicts.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.author_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(&self.payload).unwrap_or_default());
        general_purpose::STANDARD.encode(hasher.finalize())
    }
}

/// Summary of one conversation thread (derived, rebuildable)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub participant_ids: BTreeSet<String>,
    /// Highest-sequence message known
    pub last_message_id: Option<String>,
    pub last_sequence: u64,
    pub unread_count: u32,
    /// Read watermark: everything at or below is read
    pub read_through: u64,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSummary {
    pub fn empty(
        conversation_id: impl Into<String>,
        participant_ids: BTreeSet<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            participant_ids,
            last_message_id: None,
            last_sequence: 0,
            unread_count: 0,
            read_through: 0,
            updated_at: created_at,
        }
    }
}

/// Canonical ID for a two-party conversation: "dm:{min_id}:{max_id}"
pub fn direct_conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("dm:{}:{}", lo, hi)
}

/// Fresh ID for a group conversation
pub fn group_conversation_id() -> String {
    format!("group:{}", Uuid::new_v4())
}

/// Canonical conversation ID for a participant set
pub fn conversation_id_for(participants: &BTreeSet<String>) -> String {
    let ids: Vec<&String> = participants.iter().collect();
    match ids.as_slice() {
        [a, b] => direct_conversation_id(a, b),
        _ => group_conversation_id(),
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_state_never_regresses() {
        use DeliveryState::*;
        assert!(Pending.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Delivered));
        assert!(Pending.can_advance_to(Failed));
        assert!(Failed.can_advance_to(Pending));

        assert!(!Delivered.can_advance_to(Pending));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Delivered.can_advance_to(Failed));
        assert!(!Sent.can_advance_to(Pending));
        assert!(!Sent.can_advance_to(Failed));
        assert!(!Pending.can_advance_to(Pending));
    }

    #[test]
    fn test_direct_conversation_id_is_order_independent() {
        assert_eq!(direct_conversation_id("bob", "alice"), "dm:alice:bob");
        assert_eq!(direct_conversation_id("alice", "bob"), "dm:alice:bob");

        let pair: BTreeSet<String> = ["zed".to_string(), "amy".to_string()].into();
        assert_eq!(conversation_id_for(&pair), "dm:amy:zed");

        let group: BTreeSet<String> =
            ["a".to_string(), "b".to_string(), "c".to_string()].into();
        assert!(conversation_id_for(&group).starts_with("group:"));
    }

    #[test]
    fn test_payload_serializes_with_kind_tag() {
        let p = Payload::File {
            uri: "file:///tmp/report.pdf".into(),
            file_name: "report.pdf".into(),
            size_bytes: 2048,
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["kind"], "file");
        assert_eq!(p.kind(), MessageKind::File);
        assert_eq!(p.preview(), "[file] report.pdf (2.0 KB)");
    }

    #[test]
    fn test_same_content_ignores_bookkeeping() {
        let now = Utc::now();
        let a = Message::new_local("dm:a:b", "a", Payload::text("hi"), now);
        let mut b = a.clone();
        b.sequence = 7;
        b.delivery_state = DeliveryState::Delivered;
        assert!(a.same_content(&b));
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.payload = Payload::text("hello");
        assert!(!a.same_content(&b));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
