//! Interfaces to the services around the core.
//!
//! All collaborators are optional. Push and analytics failures are logged
//! and never fail the operation that triggered them; encryption failures
//! do fail the send, since storing plaintext would be worse.

use async_trait::async_trait;
use parley_types::{
    ChatError, ConversationId, EncryptedPayload, Message, MessageId, MessageKind, UserId,
};

/// Body shown for encrypted messages that cannot be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[Unable to decrypt message]";

/// Per-conversation encryption hook.
pub trait Encryptor: Send + Sync {
    /// Encrypt a body for the participants of `conversation`.
    fn encrypt(
        &self,
        plaintext: &str,
        conversation: &ConversationId,
        participants: &[UserId],
        sender: &UserId,
    ) -> Result<EncryptedPayload, ChatError>;

    /// Decrypt a body previously produced by [`Encryptor::encrypt`].
    fn decrypt(
        &self,
        payload: &EncryptedPayload,
        conversation: &ConversationId,
    ) -> Result<String, ChatError>;
}

/// What a push notification says about a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSummary {
    /// Conversation the message landed in.
    pub conversation_id: ConversationId,
    /// Group name, `None` for direct conversations.
    pub group_name: Option<String>,
    /// Sender.
    pub sender_id: UserId,
    /// Sender display name.
    pub sender_name: String,
    /// Short preview of the body.
    pub preview: String,
}

/// Push-notification sender.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    /// Notify `recipient` about a new message.
    async fn notify(&self, recipient: &UserId, summary: &PushSummary) -> Result<(), ChatError>;
}

/// Events reported to the analytics sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyticsEvent {
    /// A message was written.
    MessageSent {
        /// Conversation.
        conversation_id: ConversationId,
        /// New message.
        message_id: MessageId,
        /// Kind of message.
        kind: MessageKind,
        /// Whether the conversation is a group.
        is_group: bool,
        /// Whether the message carries attachments.
        has_attachments: bool,
    },
    /// A conversation was created.
    ConversationCreated {
        /// New conversation.
        conversation_id: ConversationId,
        /// Whether it is a group.
        is_group: bool,
        /// Number of participants at creation.
        participant_count: usize,
    },
}

/// Analytics sink.
pub trait AnalyticsSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: AnalyticsEvent) -> Result<(), ChatError>;
}

pub(crate) fn record_analytics(sink: Option<&dyn AnalyticsSink>, event: AnalyticsEvent) {
    if let Some(sink) = sink {
        if let Err(e) = sink.record(event) {
            tracing::warn!(error = %e, "analytics sink rejected event");
        }
    }
}

/// Replace an encrypted body with its plaintext for display.
///
/// Without an encryptor, or when decryption fails, the body becomes
/// [`UNDECRYPTABLE_PLACEHOLDER`].
pub(crate) fn decrypt_for_display(encryptor: Option<&dyn Encryptor>, mut message: Message) -> Message {
    let Some(payload) = message.encrypted.as_ref() else {
        return message;
    };
    let plaintext = encryptor.and_then(|enc| match enc.decrypt(payload, &message.conversation_id) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::debug!(message_id = %message.id, error = %e, "message could not be decrypted");
            None
        }
    });
    message.text = plaintext.unwrap_or_else(|| UNDECRYPTABLE_PLACEHOLDER.to_string());
    message
}
