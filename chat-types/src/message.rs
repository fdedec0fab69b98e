//! Message documents.

use crate::ids::{ConversationId, MessageId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What produced the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Typed by a participant.
    Text,
    /// Synthetic notice (member joined, group renamed, ...).
    System,
    /// Copied from another conversation.
    Forwarded,
}

/// Delivery status as seen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Accepted by the remote store.
    Sent,
    /// Reached a recipient device.
    Delivered,
    /// Read by a recipient.
    Read,
}

/// Ciphertext and metadata produced by the encryption collaborator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Encoded ciphertext.
    pub ciphertext: String,
    /// Encoded IV / nonce.
    pub iv: String,
    /// Encoded authentication tag.
    pub auth_tag: String,
    /// Key identifier.
    pub key_id: String,
}

impl std::fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field(
                "ciphertext",
                &format!("[{} chars REDACTED]", self.ciphertext.len()),
            )
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// One emoji and the users who reacted with it.
///
/// `count` always equals `user_ids.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// The emoji.
    pub emoji: String,
    /// Who reacted.
    pub user_ids: BTreeSet<UserId>,
    /// Size of `user_ids`.
    pub count: u32,
}

/// Informational back-reference to the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    /// Target message.
    pub message_id: MessageId,
    /// Target sender.
    pub sender_id: UserId,
    /// Target sender name.
    pub sender_name: String,
    /// Denormalized snippet of the target body.
    pub snippet: String,
}

/// One version in a message's edit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRecord {
    /// Body at this version.
    pub text: String,
    /// When this version was written.
    pub edited_at: Timestamp,
}

/// Where a forwarded message came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardProvenance {
    /// Original message.
    pub original_message_id: MessageId,
    /// Original conversation.
    pub original_conversation_id: ConversationId,
    /// Original sender.
    pub original_sender_id: UserId,
    /// Original sender name.
    pub original_sender_name: String,
    /// Original body.
    pub original_text: String,
    /// Original timestamp.
    pub original_timestamp: Timestamp,
}

/// Attachment reference. Upload happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Download URL.
    pub url: String,
    /// MIME type.
    pub mime_type: String,
    /// File name.
    pub name: Option<String>,
    /// Size in bytes.
    pub size_bytes: Option<u64>,
}

/// A message document.
///
/// Once `is_deleted` is set the message is terminal: no further edits,
/// reactions or pin changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Document id.
    pub id: MessageId,
    /// Parent conversation.
    pub conversation_id: ConversationId,
    /// Sender.
    pub sender_id: UserId,
    /// Sender display name.
    pub sender_name: String,
    /// Text, system or forwarded.
    pub kind: MessageKind,
    /// Body. Empty when `encrypted` carries the body.
    pub text: String,
    /// Encrypted body, when the conversation opts into encryption.
    #[serde(default)]
    pub encrypted: Option<EncryptedPayload>,
    /// Creation time.
    pub timestamp: Timestamp,
    /// Delivery status.
    pub status: MessageStatus,
    /// Whether the body was edited.
    #[serde(default)]
    pub is_edited: bool,
    /// Time of the latest edit.
    #[serde(default)]
    pub edited_at: Option<Timestamp>,
    /// Append-only list of versions, original first.
    #[serde(default)]
    pub edit_history: Vec<EditRecord>,
    /// Deleted for everyone.
    #[serde(default)]
    pub is_deleted: bool,
    /// Who deleted it for everyone.
    #[serde(default)]
    pub deleted_by: Option<UserId>,
    /// When it was deleted for everyone.
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
    /// Users who hid the message for themselves only.
    #[serde(default)]
    pub deleted_for: BTreeSet<UserId>,
    /// Pinned in the conversation.
    #[serde(default)]
    pub is_pinned: bool,
    /// Who pinned it.
    #[serde(default)]
    pub pinned_by: Option<UserId>,
    /// When it was pinned.
    #[serde(default)]
    pub pinned_at: Option<Timestamp>,
    /// Reaction groups.
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// Message being replied to.
    #[serde(default)]
    pub reply_to: Option<ReplyRef>,
    /// Provenance when forwarded.
    #[serde(default)]
    pub forwarded_from: Option<ForwardProvenance>,
    /// Attachments.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// A fresh plain-text message in `Sent` status.
    pub fn new_text(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: impl Into<String>,
        text: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            sender_name: sender_name.into(),
            kind: MessageKind::Text,
            text: text.into(),
            encrypted: None,
            timestamp,
            status: MessageStatus::Sent,
            is_edited: false,
            edited_at: None,
            edit_history: Vec::new(),
            is_deleted: false,
            deleted_by: None,
            deleted_at: None,
            deleted_for: BTreeSet::new(),
            is_pinned: false,
            pinned_by: None,
            pinned_at: None,
            reactions: Vec::new(),
            reply_to: None,
            forwarded_from: None,
            attachments: Vec::new(),
        }
    }

    /// A system notice authored by the system pseudo-user.
    pub fn new_system(
        conversation_id: ConversationId,
        text: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        let mut msg = Self::new_text(
            MessageId::generate(),
            conversation_id,
            UserId::system(),
            "System",
            text,
            timestamp,
        );
        msg.kind = MessageKind::System;
        msg
    }

    /// Whether `user` still sees this message (not hidden via delete-for-me).
    pub fn is_visible_to(&self, user: &UserId) -> bool {
        !self.deleted_for.contains(user)
    }

    /// First `max_chars` characters of the body, for reply and list previews.
    pub fn snippet(&self, max_chars: usize) -> String {
        let mut chars = self.text.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{}…", head)
        } else {
            head
        }
    }
}
