//! Message mutation rules.
//!
//! Each function validates authorization and message state, then applies
//! the mutation to the document in place. They are meant to run inside a
//! remote transaction against the freshly read document: when two actors
//! race, the loser re-runs the same rule against the winner's result and
//! fails cleanly (an edit against an already deleted message returns
//! `StateConflict`, it never resurrects the body).
//!
//! State machine per message:
//!
//! ```text
//! active ──edit──► edited ──edit──► edited (bounded by the edit window)
//!   │  ▲ react / pin / unpin (repeatable)
//!   │
//!   ├──delete for everyone──► deleted (terminal)
//!   └──delete for me──► hidden for that user only
//! ```

use parley_types::{
    ChatError, Conversation, ConversationId, EditRecord, ForwardProvenance, Message, MessageId,
    MessageKind, Timestamp, UserId,
};

/// Limits applied to message bodies and mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePolicy {
    /// How long after creation a message may be edited or deleted for everyone (ms).
    pub edit_window_ms: i64,
    /// Maximum body length in characters.
    pub max_body_chars: usize,
    /// Body substituted for messages deleted for everyone.
    pub tombstone_text: String,
}

impl Default for MessagePolicy {
    fn default() -> Self {
        Self {
            edit_window_ms: 24 * 60 * 60 * 1000,
            max_body_chars: 10_000,
            tombstone_text: "This message was deleted".to_string(),
        }
    }
}

impl MessagePolicy {
    fn window_label(&self) -> String {
        let hours = self.edit_window_ms / (60 * 60 * 1000);
        if hours >= 1 {
            format!("{} hours", hours)
        } else {
            format!("{} minutes", self.edit_window_ms / (60 * 1000))
        }
    }

    fn within_window(&self, message: &Message, now: Timestamp) -> bool {
        now.saturating_sub(message.timestamp) <= self.edit_window_ms
    }
}

/// Validate and normalize an outgoing body.
///
/// Whitespace-only bodies are rejected unless the message carries attachments.
pub fn validate_body(
    policy: &MessagePolicy,
    text: &str,
    has_attachments: bool,
) -> Result<String, ChatError> {
    let trimmed = text.trim();
    if trimmed.is_empty() && !has_attachments {
        return Err(ChatError::validation("Message cannot be empty"));
    }
    let chars = trimmed.chars().count();
    if chars > policy.max_body_chars {
        return Err(ChatError::validation(format!(
            "Message is too long ({} characters, maximum is {})",
            chars, policy.max_body_chars
        )));
    }
    Ok(trimmed.to_string())
}

/// Require `actor` to participate in `conversation`.
pub fn check_participant(conversation: &Conversation, actor: &UserId) -> Result<(), ChatError> {
    if conversation.is_participant(actor) {
        Ok(())
    } else {
        Err(ChatError::permission(
            "You are not a participant in this conversation",
        ))
    }
}

/// Require `sender` to be allowed to post into `conversation`.
pub fn check_send_permission(conversation: &Conversation, sender: &UserId) -> Result<(), ChatError> {
    check_participant(conversation, sender)?;
    if let Some(group) = conversation.group() {
        if group.settings.only_admins_can_message && !group.admins.contains(sender) {
            return Err(ChatError::permission(
                "Only admins can send messages in this group",
            ));
        }
    }
    Ok(())
}

fn ensure_not_deleted(message: &Message, what: &str) -> Result<(), ChatError> {
    if message.is_deleted {
        Err(ChatError::conflict(format!(
            "This message has been deleted and can no longer be {}",
            what
        )))
    } else {
        Ok(())
    }
}

/// Check whether `actor` may edit `message` at `now`.
pub fn check_can_edit(
    policy: &MessagePolicy,
    message: &Message,
    actor: &UserId,
    now: Timestamp,
) -> Result<(), ChatError> {
    ensure_not_deleted(message, "edited")?;
    if message.kind == MessageKind::System {
        return Err(ChatError::permission("System messages cannot be edited"));
    }
    if &message.sender_id != actor {
        return Err(ChatError::permission("You can only edit your own messages"));
    }
    if !policy.within_window(message, now) {
        return Err(ChatError::permission(format!(
            "Messages can only be edited within {}",
            policy.window_label()
        )));
    }
    Ok(())
}

/// Replace the body of `message`, recording the edit history.
///
/// The first edit snapshots the original body before appending the new
/// version. Returns `false` when the new body equals the current one.
pub fn apply_edit(
    policy: &MessagePolicy,
    message: &mut Message,
    actor: &UserId,
    new_text: &str,
    now: Timestamp,
) -> Result<bool, ChatError> {
    check_can_edit(policy, message, actor, now)?;
    let body = validate_body(policy, new_text, !message.attachments.is_empty())?;
    if body == message.text && message.encrypted.is_none() {
        return Ok(false);
    }

    if message.edit_history.is_empty() {
        message.edit_history.push(EditRecord {
            text: message.text.clone(),
            edited_at: message.timestamp,
        });
    }
    message.edit_history.push(EditRecord {
        text: body.clone(),
        edited_at: now,
    });
    message.text = body;
    message.is_edited = true;
    message.edited_at = Some(now);
    Ok(true)
}

/// Delete `message` for every participant.
///
/// Terminal: body, ciphertext, attachments and history are replaced by the
/// tombstone, and the message is unpinned.
pub fn apply_delete_for_everyone(
    policy: &MessagePolicy,
    message: &mut Message,
    actor: &UserId,
    now: Timestamp,
) -> Result<(), ChatError> {
    if message.is_deleted {
        return Err(ChatError::conflict("This message has already been deleted"));
    }
    if &message.sender_id != actor {
        return Err(ChatError::permission(
            "You can only delete your own messages for everyone",
        ));
    }
    if !policy.within_window(message, now) {
        return Err(ChatError::permission(format!(
            "Messages can only be deleted for everyone within {}",
            policy.window_label()
        )));
    }

    message.is_deleted = true;
    message.text = policy.tombstone_text.clone();
    message.encrypted = None;
    message.attachments.clear();
    message.edit_history.clear();
    message.reactions.clear();
    message.deleted_by = Some(actor.clone());
    message.deleted_at = Some(now);
    message.is_pinned = false;
    message.pinned_by = None;
    message.pinned_at = None;
    Ok(())
}

/// Hide `message` for `actor` only. Idempotent; no time window.
pub fn apply_delete_for_me(
    conversation: &Conversation,
    message: &mut Message,
    actor: &UserId,
) -> Result<(), ChatError> {
    check_participant(conversation, actor)?;
    message.deleted_for.insert(actor.clone());
    Ok(())
}

/// Check whether `actor` may react to `message`.
pub fn check_can_react(
    conversation: &Conversation,
    message: &Message,
    actor: &UserId,
) -> Result<(), ChatError> {
    check_participant(conversation, actor)?;
    ensure_not_deleted(message, "reacted to")
}

/// Pin `message`.
pub fn apply_pin(
    conversation: &Conversation,
    message: &mut Message,
    actor: &UserId,
    now: Timestamp,
) -> Result<(), ChatError> {
    check_participant(conversation, actor)?;
    ensure_not_deleted(message, "pinned")?;
    if message.is_pinned {
        return Err(ChatError::conflict("This message is already pinned"));
    }
    message.is_pinned = true;
    message.pinned_by = Some(actor.clone());
    message.pinned_at = Some(now);
    Ok(())
}

/// Unpin `message`. Only the pinner or, in groups, an admin may unpin.
pub fn apply_unpin(
    conversation: &Conversation,
    message: &mut Message,
    actor: &UserId,
) -> Result<(), ChatError> {
    check_participant(conversation, actor)?;
    ensure_not_deleted(message, "unpinned")?;
    if !message.is_pinned {
        return Err(ChatError::conflict("This message is not pinned"));
    }
    let is_pinner = message.pinned_by.as_ref() == Some(actor);
    if !is_pinner && !conversation.is_admin(actor) {
        return Err(ChatError::permission(
            "Only the person who pinned this message or a group admin can unpin it",
        ));
    }
    message.is_pinned = false;
    message.pinned_by = None;
    message.pinned_at = None;
    Ok(())
}

/// Check that `source` can be forwarded by `actor`.
pub fn check_can_forward(message: &Message, actor: &UserId) -> Result<(), ChatError> {
    if message.is_deleted {
        return Err(ChatError::conflict("Deleted messages cannot be forwarded"));
    }
    if !message.is_visible_to(actor) {
        return Err(ChatError::not_found(format!("message {}", message.id)));
    }
    if message.kind == MessageKind::System {
        return Err(ChatError::validation("System messages cannot be forwarded"));
    }
    Ok(())
}

/// Everything needed to write a forwarded copy of a message.
#[derive(Debug, Clone)]
pub struct ForwardDraft<'a> {
    /// The message being forwarded, with a plaintext body.
    pub source: &'a Message,
    /// Where the copy goes.
    pub target: ConversationId,
    /// Id of the copy.
    pub new_id: MessageId,
    /// Forwarding user.
    pub actor: &'a UserId,
    /// Forwarding user's display name.
    pub actor_name: &'a str,
    /// Optional comment from the forwarding user.
    pub additional_text: Option<&'a str>,
}

/// Build the forwarded copy of a message.
///
/// Provenance of an already forwarded message points at the first original,
/// not at the intermediate copy.
pub fn build_forward(draft: ForwardDraft<'_>, now: Timestamp) -> Message {
    let source = draft.source;
    let provenance = source
        .forwarded_from
        .clone()
        .unwrap_or_else(|| ForwardProvenance {
            original_message_id: source.id.clone(),
            original_conversation_id: source.conversation_id.clone(),
            original_sender_id: source.sender_id.clone(),
            original_sender_name: source.sender_name.clone(),
            original_text: source.text.clone(),
            original_timestamp: source.timestamp,
        });

    let text = match draft.additional_text.map(str::trim).filter(|t| !t.is_empty()) {
        Some(comment) => format!("{}\n\n{}", comment, provenance.original_text),
        None => provenance.original_text.clone(),
    };

    let mut message = Message::new_text(
        draft.new_id,
        draft.target,
        draft.actor.clone(),
        draft.actor_name,
        text,
        now,
    );
    message.kind = MessageKind::Forwarded;
    message.attachments = source.attachments.clone();
    message.forwarded_from = Some(provenance);
    message
}
