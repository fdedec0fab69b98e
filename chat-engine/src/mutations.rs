//! Message mutation transaction layer.
//!
//! Every operation re-reads the message and its conversation inside one
//! transaction and re-checks authorization there, so a caller acting on a
//! stale view fails cleanly instead of overwriting a concurrent change.
//!
//! Encryption is consulted outside the transaction where possible, since a
//! transaction body may run more than once.

use crate::clock::Clock;
use crate::collaborators::{
    record_analytics, AnalyticsEvent, AnalyticsSink, Encryptor, PushNotifier, PushSummary,
};
use crate::store::{transact, RemoteStore, Transaction};
use futures_util::future::join_all;
use parley_core::aggregate::{preview_text, record_incoming_message, refresh_last_message};
use parley_core::mutation::{
    apply_delete_for_everyone, apply_delete_for_me, apply_edit, apply_pin, apply_unpin,
    build_forward, check_can_forward, check_can_react, check_participant,
    check_send_permission, validate_body, ForwardDraft, MessagePolicy,
};
use parley_core::reactions::{toggle_reaction, ReactionChange};
use parley_types::{
    Attachment, ChatError, Conversation, ConversationId, EncryptedPayload, Message, MessageId,
    ReplyRef, Timestamp, UserId,
};
use std::sync::Arc;

/// Optional parts of an outgoing message.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Message being replied to.
    pub reply_to: Option<ReplyRef>,
    /// Already-uploaded attachments.
    pub attachments: Vec<Attachment>,
    /// Use this id instead of generating one. Re-sending with the same id
    /// is a no-op that returns the stored message.
    pub message_id: Option<MessageId>,
}

/// One denied target of a forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardFailure {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Why nothing was written there.
    pub error: ChatError,
}

/// Outcome of forwarding a batch of messages to several targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    /// Messages written, grouped by target in request order.
    pub forwarded: Vec<Message>,
    /// Targets where nothing was written.
    pub denied: Vec<ForwardFailure>,
}

impl ForwardReport {
    /// Whether every target received the batch.
    pub fn is_complete(&self) -> bool {
        self.denied.is_empty()
    }
}

/// Atomic message operations against the remote store.
pub struct MutationLayer<S: RemoteStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: MessagePolicy,
    encryptor: Option<Arc<dyn Encryptor>>,
    push: Option<Arc<dyn PushNotifier>>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
}

impl<S: RemoteStore> MutationLayer<S> {
    /// Create a mutation layer without collaborators.
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, policy: MessagePolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            encryptor: None,
            push: None,
            analytics: None,
        }
    }

    /// Encrypt bodies of conversations that opted into encryption.
    pub fn with_encryptor(mut self, encryptor: Option<Arc<dyn Encryptor>>) -> Self {
        self.encryptor = encryptor;
        self
    }

    /// Send push notifications for new messages.
    pub fn with_push(mut self, push: Option<Arc<dyn PushNotifier>>) -> Self {
        self.push = push;
        self
    }

    /// Report sends to an analytics sink.
    pub fn with_analytics(mut self, analytics: Option<Arc<dyn AnalyticsSink>>) -> Self {
        self.analytics = analytics;
        self
    }

    /// Rules applied to bodies and mutations.
    pub fn policy(&self) -> &MessagePolicy {
        &self.policy
    }

    /// Append a new message and update the conversation summary.
    ///
    /// Idempotent by message id: when `options.message_id` already exists
    /// the stored message is returned and nothing is written.
    pub async fn append_message(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        sender_name: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<Message, ChatError> {
        let body = validate_body(&self.policy, text, !options.attachments.is_empty())?;
        let id = options.message_id.unwrap_or_else(MessageId::generate);
        let now = self.clock.now_ms();

        let snapshot = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Conversation"))?;
        let encrypted = self.encrypt_for(&snapshot, &body, sender)?;

        let mut draft = Message::new_text(
            id.clone(),
            conversation_id.clone(),
            sender.clone(),
            sender_name,
            body,
            now,
        );
        draft.reply_to = options.reply_to;
        draft.attachments = options.attachments;
        if let Some(payload) = encrypted {
            draft.text.clear();
            draft.encrypted = Some(payload);
        }

        let outcome = transact(&*self.store, conversation_id, |tx: &mut Transaction| {
            if tx.has_message(&id) {
                return Ok((tx.message(&id)?.clone(), None));
            }
            check_send_permission(tx.conversation()?, sender)?;
            let conv = tx.conversation_mut()?;
            record_incoming_message(conv, &draft);
            let conv = conv.clone();
            tx.insert_message(draft.clone())?;
            Ok((draft.clone(), Some(conv)))
        })
        .await?;

        match outcome {
            (message, Some(conversation)) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    "message appended"
                );
                self.after_append(&conversation, std::slice::from_ref(&message))
                    .await;
                Ok(message)
            }
            (message, None) => {
                tracing::debug!(message_id = %message.id, "message already stored, skipping append");
                Ok(message)
            }
        }
    }

    /// Replace the body of the actor's own message.
    ///
    /// Returns the updated message; an unchanged body is not written.
    pub async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
        new_text: &str,
    ) -> Result<Message, ChatError> {
        let now = self.clock.now_ms();
        let edited = transact(&*self.store, conversation_id, |tx: &mut Transaction| {
            let conversation = tx.conversation()?;
            check_participant(conversation, actor)?;
            let participants: Vec<UserId> = conversation.participants.iter().cloned().collect();
            let current = tx.message(message_id)?.clone();
            let Some(updated) = self.edited_copy(current, &participants, actor, new_text, now)?
            else {
                return Ok(tx.message(message_id)?.clone());
            };
            *tx.message_mut(message_id)? = updated.clone();
            refresh_last_message(tx.conversation_mut()?, &updated);
            Ok(updated)
        })
        .await?;
        tracing::debug!(conversation_id = %conversation_id, message_id = %message_id, "message edited");
        Ok(edited)
    }

    fn edited_copy(
        &self,
        mut message: Message,
        participants: &[UserId],
        actor: &UserId,
        new_text: &str,
        now: Timestamp,
    ) -> Result<Option<Message>, ChatError> {
        let Some(payload) = message.encrypted.clone() else {
            let changed = apply_edit(&self.policy, &mut message, actor, new_text, now)?;
            return Ok(changed.then_some(message));
        };

        // Encrypted bodies are edited in plaintext, then sealed again;
        // history keeps timestamps only
        let encryptor = self.require_encryptor()?;
        message.text = encryptor.decrypt(&payload, &message.conversation_id)?;
        message.encrypted = None;
        if !apply_edit(&self.policy, &mut message, actor, new_text, now)? {
            return Ok(None);
        }
        let sealed = encryptor.encrypt(&message.text, &message.conversation_id, participants, actor)?;
        message.encrypted = Some(sealed);
        message.text.clear();
        for record in &mut message.edit_history {
            record.text.clear();
        }
        Ok(Some(message))
    }

    /// Delete the actor's own message for every participant.
    pub async fn delete_for_everyone(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<(), ChatError> {
        let now = self.clock.now_ms();
        transact(&*self.store, conversation_id, |tx: &mut Transaction| {
            check_participant(tx.conversation()?, actor)?;
            let message = tx.message_mut(message_id)?;
            apply_delete_for_everyone(&self.policy, message, actor, now)?;
            let message = message.clone();
            refresh_last_message(tx.conversation_mut()?, &message);
            Ok(())
        })
        .await?;
        tracing::info!(conversation_id = %conversation_id, message_id = %message_id, "message deleted for everyone");
        Ok(())
    }

    /// Hide a message for the actor only.
    pub async fn delete_for_me(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<(), ChatError> {
        transact(&*self.store, conversation_id, |tx: &mut Transaction| {
            let conversation = tx.conversation()?.clone();
            apply_delete_for_me(&conversation, tx.message_mut(message_id)?, actor)
        })
        .await
    }

    /// Toggle the actor's `emoji` reaction on a message.
    pub async fn toggle_reaction(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
        emoji: &str,
    ) -> Result<ReactionChange, ChatError> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(ChatError::validation("Reaction cannot be empty"));
        }
        transact(&*self.store, conversation_id, |tx: &mut Transaction| {
            let conversation = tx.conversation()?.clone();
            let message = tx.message_mut(message_id)?;
            check_can_react(&conversation, message, actor)?;
            Ok(toggle_reaction(&mut message.reactions, emoji, actor))
        })
        .await
    }

    /// Pin a message in its conversation.
    pub async fn pin_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<(), ChatError> {
        let now = self.clock.now_ms();
        transact(&*self.store, conversation_id, |tx: &mut Transaction| {
            let conversation = tx.conversation()?.clone();
            apply_pin(&conversation, tx.message_mut(message_id)?, actor, now)
        })
        .await
    }

    /// Unpin a message. Only its pinner or a group admin may do this.
    pub async fn unpin_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<(), ChatError> {
        transact(&*self.store, conversation_id, |tx: &mut Transaction| {
            let conversation = tx.conversation()?.clone();
            apply_unpin(&conversation, tx.message_mut(message_id)?, actor)
        })
        .await
    }

    /// Pinned messages of a conversation, oldest pin first.
    pub async fn pinned_messages(
        &self,
        conversation_id: &ConversationId,
        viewer: &UserId,
    ) -> Result<Vec<Message>, ChatError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Conversation"))?;
        check_participant(&conversation, viewer)?;
        let mut pinned: Vec<Message> = self
            .store
            .list_messages(conversation_id)
            .await?
            .into_iter()
            .filter(|m| m.is_pinned && m.is_visible_to(viewer))
            .collect();
        pinned.sort_by_key(|m| m.pinned_at);
        Ok(pinned)
    }

    /// Forward `sources` into every conversation of `targets`.
    ///
    /// Sources must all be readable by the actor, otherwise the whole call
    /// fails. Each target is written in its own transaction; a target the
    /// actor may not post to is reported in [`ForwardReport::denied`]
    /// without affecting the others.
    pub async fn forward_messages(
        &self,
        actor: &UserId,
        actor_name: &str,
        sources: &[(ConversationId, MessageId)],
        targets: &[ConversationId],
        comment: Option<&str>,
    ) -> Result<ForwardReport, ChatError> {
        if sources.is_empty() {
            return Err(ChatError::validation("Select at least one message to forward"));
        }
        if targets.is_empty() {
            return Err(ChatError::validation(
                "Select at least one conversation to forward to",
            ));
        }

        let mut originals = Vec::with_capacity(sources.len());
        for (conversation_id, message_id) in sources {
            originals.push(self.readable_source(conversation_id, message_id, actor).await?);
        }

        let mut report = ForwardReport::default();
        for target in targets {
            match self
                .forward_into(target, actor, actor_name, &originals, comment)
                .await
            {
                Ok((conversation, written)) => {
                    self.after_append(&conversation, &written).await;
                    report.forwarded.extend(written);
                }
                Err(error) => {
                    tracing::info!(conversation_id = %target, error = %error, "forward target denied");
                    report.denied.push(ForwardFailure {
                        conversation_id: target.clone(),
                        error,
                    });
                }
            }
        }
        tracing::info!(
            forwarded = report.forwarded.len(),
            denied = report.denied.len(),
            "forward finished"
        );
        Ok(report)
    }

    async fn readable_source(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<Message, ChatError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Conversation"))?;
        check_participant(&conversation, actor)?;
        let mut message = self
            .store
            .get_message(conversation_id, message_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Message"))?;
        check_can_forward(&message, actor)?;
        if let Some(payload) = message.encrypted.take() {
            message.text = self
                .require_encryptor()?
                .decrypt(&payload, conversation_id)?;
        }
        Ok(message)
    }

    async fn forward_into(
        &self,
        target: &ConversationId,
        actor: &UserId,
        actor_name: &str,
        originals: &[Message],
        comment: Option<&str>,
    ) -> Result<(Conversation, Vec<Message>), ChatError> {
        let now = self.clock.now_ms();
        let snapshot = self
            .store
            .get_conversation(target)
            .await?
            .ok_or_else(|| ChatError::not_found("Conversation"))?;

        let mut drafts = Vec::with_capacity(originals.len());
        for source in originals {
            let mut draft = build_forward(
                ForwardDraft {
                    source,
                    target: target.clone(),
                    new_id: MessageId::generate(),
                    actor,
                    actor_name,
                    additional_text: comment,
                },
                now,
            );
            if let Some(payload) = self.encrypt_for(&snapshot, &draft.text, actor)? {
                draft.text.clear();
                draft.encrypted = Some(payload);
                if let Some(provenance) = draft.forwarded_from.as_mut() {
                    provenance.original_text.clear();
                }
            }
            drafts.push(draft);
        }

        transact(&*self.store, target, |tx: &mut Transaction| {
            check_send_permission(tx.conversation()?, actor)?;
            for draft in &drafts {
                if tx.has_message(&draft.id) {
                    continue;
                }
                record_incoming_message(tx.conversation_mut()?, draft);
                tx.insert_message(draft.clone())?;
            }
            Ok((tx.conversation()?.clone(), drafts.clone()))
        })
        .await
    }

    fn require_encryptor(&self) -> Result<&dyn Encryptor, ChatError> {
        self.encryptor
            .as_deref()
            .ok_or_else(|| ChatError::encryption("no encryptor configured"))
    }

    fn encrypt_for(
        &self,
        conversation: &Conversation,
        body: &str,
        sender: &UserId,
    ) -> Result<Option<EncryptedPayload>, ChatError> {
        if !conversation.encryption_enabled {
            return Ok(None);
        }
        let participants: Vec<UserId> = conversation.participants.iter().cloned().collect();
        self.require_encryptor()?
            .encrypt(body, &conversation.id, &participants, sender)
            .map(Some)
    }

    /// Push to non-muted recipients and report analytics. Failures are logged.
    async fn after_append(&self, conversation: &Conversation, messages: &[Message]) {
        for message in messages {
            record_analytics(
                self.analytics.as_deref(),
                AnalyticsEvent::MessageSent {
                    conversation_id: conversation.id.clone(),
                    message_id: message.id.clone(),
                    kind: message.kind,
                    is_group: conversation.is_group(),
                    has_attachments: !message.attachments.is_empty(),
                },
            );
        }

        let (Some(push), Some(last)) = (self.push.as_ref(), messages.last()) else {
            return;
        };
        let summary = PushSummary {
            conversation_id: conversation.id.clone(),
            group_name: conversation.group().map(|g| g.name.clone()),
            sender_id: last.sender_id.clone(),
            sender_name: last.sender_name.clone(),
            preview: preview_text(last),
        };
        let recipients: Vec<&UserId> = conversation
            .participants
            .iter()
            .filter(|p| **p != last.sender_id && !conversation.muted_for(p))
            .collect();
        let results = join_all(recipients.iter().map(|r| push.notify(r, &summary))).await;
        for (recipient, result) in recipients.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(recipient = %recipient, error = %e, "push notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parley_core::aggregate::{new_direct, new_group};
    use parley_types::{ErrorKind, GroupSettings, MessageKind, ParticipantProfile};
    use std::sync::Mutex;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn member(id: &str) -> (UserId, ParticipantProfile) {
        (user(id), ParticipantProfile::named(id.to_uppercase()))
    }

    struct Fixture {
        store: MemoryStore,
        clock: Arc<ManualClock>,
        layer: MutationLayer<MemoryStore>,
        direct: ConversationId,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let conv = new_direct(member("alice"), member("bob"), 0).unwrap();
        let direct = conv.id.clone();
        store.insert_conversation(conv);
        let layer = MutationLayer::new(
            Arc::new(store.clone()),
            clock.clone(),
            MessagePolicy::default(),
        );
        Fixture {
            store,
            clock,
            layer,
            direct,
        }
    }

    async fn send(f: &Fixture, from: &str, text: &str) -> Message {
        f.layer
            .append_message(&f.direct, &user(from), from, text, SendOptions::default())
            .await
            .unwrap()
    }

    // ===========================================
    // Append Tests
    // ===========================================

    #[tokio::test]
    async fn append_updates_summary_and_unread() {
        let f = fixture();
        let msg = send(&f, "alice", "  hello  ").await;

        assert_eq!(msg.text, "hello");
        let conv = f.store.conversation(&f.direct).unwrap();
        assert_eq!(conv.last_message.as_ref().unwrap().text, "hello");
        assert_eq!(conv.unread_for(&user("bob")), 1);
        assert_eq!(conv.unread_for(&user("alice")), 0);
    }

    #[tokio::test]
    async fn append_is_idempotent_by_id() {
        let f = fixture();
        let options = SendOptions {
            message_id: Some(MessageId::new("fixed")),
            ..SendOptions::default()
        };
        f.layer
            .append_message(&f.direct, &user("alice"), "alice", "one", options.clone())
            .await
            .unwrap();
        let again = f
            .layer
            .append_message(&f.direct, &user("alice"), "alice", "one", options)
            .await
            .unwrap();

        assert_eq!(again.id.as_str(), "fixed");
        assert_eq!(f.store.messages(&f.direct).len(), 1);
        let conv = f.store.conversation(&f.direct).unwrap();
        assert_eq!(conv.unread_for(&user("bob")), 1);
    }

    #[tokio::test]
    async fn append_rejects_empty_and_outsiders() {
        let f = fixture();
        let empty = f
            .layer
            .append_message(&f.direct, &user("alice"), "alice", "   ", SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::Validation);

        let outsider = f
            .layer
            .append_message(&f.direct, &user("eve"), "eve", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(outsider.kind(), ErrorKind::Permission);
        assert!(f.store.messages(&f.direct).is_empty());
    }

    #[tokio::test]
    async fn append_surfaces_transport_errors() {
        let f = fixture();
        f.store.fail_next_transaction("deadline exceeded");
        let err = f
            .layer
            .append_message(&f.direct, &user("alice"), "alice", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    // ===========================================
    // Edit Tests
    // ===========================================

    #[tokio::test]
    async fn first_edit_snapshots_original() {
        let f = fixture();
        let msg = send(&f, "alice", "helo").await;
        f.clock.advance(Duration::from_secs(60));

        let edited = f
            .layer
            .edit_message(&f.direct, &msg.id, &user("alice"), "hello")
            .await
            .unwrap();

        assert!(edited.is_edited);
        let history: Vec<&str> = edited.edit_history.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(history, vec!["helo", "hello"]);
        let conv = f.store.conversation(&f.direct).unwrap();
        assert_eq!(conv.last_message.as_ref().unwrap().text, "hello");
    }

    #[tokio::test]
    async fn edit_outside_window_leaves_body_unchanged() {
        let f = fixture();
        let msg = send(&f, "alice", "original").await;
        f.clock.advance(HOUR * 25);

        let err = f
            .layer
            .edit_message(&f.direct, &msg.id, &user("alice"), "changed")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(err.to_string().contains("24 hours"));
        assert_eq!(f.store.message(&f.direct, &msg.id).unwrap().text, "original");
    }

    #[tokio::test]
    async fn only_sender_may_edit() {
        let f = fixture();
        let msg = send(&f, "alice", "mine").await;
        let err = f
            .layer
            .edit_message(&f.direct, &msg.id, &user("bob"), "yours")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    // ===========================================
    // Delete Tests
    // ===========================================

    #[tokio::test]
    async fn deleted_message_is_terminal() {
        let f = fixture();
        let msg = send(&f, "alice", "oops").await;
        f.layer
            .delete_for_everyone(&f.direct, &msg.id, &user("alice"))
            .await
            .unwrap();

        let stored = f.store.message(&f.direct, &msg.id).unwrap();
        assert!(stored.is_deleted);
        assert_eq!(stored.text, "This message was deleted");
        let conv = f.store.conversation(&f.direct).unwrap();
        assert_eq!(
            conv.last_message.as_ref().unwrap().text,
            "This message was deleted"
        );

        let edit = f
            .layer
            .edit_message(&f.direct, &msg.id, &user("alice"), "again")
            .await
            .unwrap_err();
        let react = f
            .layer
            .toggle_reaction(&f.direct, &msg.id, &user("bob"), "👍")
            .await
            .unwrap_err();
        let pin = f
            .layer
            .pin_message(&f.direct, &msg.id, &user("bob"))
            .await
            .unwrap_err();
        for err in [edit, react, pin] {
            assert_eq!(err.kind(), ErrorKind::StateConflict);
        }
        assert_eq!(f.store.message(&f.direct, &msg.id).unwrap(), stored);
    }

    #[tokio::test]
    async fn delete_for_me_hides_only_for_actor() {
        let f = fixture();
        let msg = send(&f, "alice", "secret").await;
        f.clock.advance(HOUR * 48);

        f.layer
            .delete_for_me(&f.direct, &msg.id, &user("bob"))
            .await
            .unwrap();

        let stored = f.store.message(&f.direct, &msg.id).unwrap();
        assert!(!stored.is_visible_to(&user("bob")));
        assert!(stored.is_visible_to(&user("alice")));
        assert!(!stored.is_deleted);
    }

    // ===========================================
    // Reaction & Pin Tests
    // ===========================================

    #[tokio::test]
    async fn double_toggle_restores_reactions() {
        let f = fixture();
        let msg = send(&f, "alice", "nice").await;

        let first = f
            .layer
            .toggle_reaction(&f.direct, &msg.id, &user("bob"), "👍")
            .await
            .unwrap();
        assert_eq!(first, ReactionChange::Added);
        let after_first = f.store.message(&f.direct, &msg.id).unwrap();
        assert_eq!(after_first.reactions.len(), 1);
        assert_eq!(after_first.reactions[0].count, 1);

        let second = f
            .layer
            .toggle_reaction(&f.direct, &msg.id, &user("bob"), "👍")
            .await
            .unwrap();
        assert_eq!(second, ReactionChange::Removed);
        assert!(f.store.message(&f.direct, &msg.id).unwrap().reactions.is_empty());
    }

    #[tokio::test]
    async fn unpin_requires_pinner_or_admin() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let group = new_group(
            ConversationId::new("g1"),
            member("alice"),
            vec![member("bob"), member("carol")],
            "Team",
            GroupSettings::default(),
            0,
        )
        .unwrap();
        store.insert_conversation(group);
        let layer = MutationLayer::new(Arc::new(store.clone()), clock, MessagePolicy::default());
        let id = ConversationId::new("g1");
        let msg = layer
            .append_message(&id, &user("carol"), "carol", "agenda", SendOptions::default())
            .await
            .unwrap();

        layer.pin_message(&id, &msg.id, &user("bob")).await.unwrap();
        let dup = layer.pin_message(&id, &msg.id, &user("carol")).await.unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::StateConflict);

        let denied = layer.unpin_message(&id, &msg.id, &user("carol")).await.unwrap_err();
        assert_eq!(denied.kind(), ErrorKind::Permission);

        // Admin may unpin someone else's pin
        layer.unpin_message(&id, &msg.id, &user("alice")).await.unwrap();
        assert!(!store.message(&id, &msg.id).unwrap().is_pinned);
    }

    // ===========================================
    // Forward Tests
    // ===========================================

    #[tokio::test]
    async fn forward_carries_provenance_and_comment() {
        let f = fixture();
        let msg = send(&f, "bob", "meet at 5").await;
        let other = new_direct(member("alice"), member("carol"), 0).unwrap();
        let target = other.id.clone();
        f.store.insert_conversation(other);

        let report = f
            .layer
            .forward_messages(
                &user("alice"),
                "ALICE",
                &[(f.direct.clone(), msg.id.clone())],
                &[target.clone()],
                Some("fyi"),
            )
            .await
            .unwrap();

        assert!(report.is_complete());
        let fwd = &report.forwarded[0];
        assert_eq!(fwd.kind, MessageKind::Forwarded);
        assert_eq!(fwd.text, "fyi\n\nmeet at 5");
        let provenance = fwd.forwarded_from.as_ref().unwrap();
        assert_eq!(provenance.original_sender_id, user("bob"));
        assert_eq!(provenance.original_conversation_id, f.direct);
        assert_eq!(f.store.messages(&target).len(), 1);
    }

    #[tokio::test]
    async fn forward_requires_access_to_source() {
        let f = fixture();
        let msg = send(&f, "bob", "private").await;
        let err = f
            .layer
            .forward_messages(
                &user("carol"),
                "CAROL",
                &[(f.direct.clone(), msg.id.clone())],
                &[f.direct.clone()],
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    // ===========================================
    // Collaborator Tests
    // ===========================================

    #[derive(Default)]
    struct RecordingPush {
        sent: Mutex<Vec<(UserId, PushSummary)>>,
        fail: bool,
    }

    #[async_trait]
    impl PushNotifier for RecordingPush {
        async fn notify(&self, recipient: &UserId, summary: &PushSummary) -> Result<(), ChatError> {
            self.sent
                .lock()
                .unwrap()
                .push((recipient.clone(), summary.clone()));
            if self.fail {
                return Err(ChatError::transport("push service down"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_skips_sender_and_muted_recipients() {
        let store = MemoryStore::new();
        let mut group = new_group(
            ConversationId::new("g1"),
            member("alice"),
            vec![member("bob"), member("carol")],
            "Team",
            GroupSettings::default(),
            0,
        )
        .unwrap();
        group.is_muted.insert(user("carol"), true);
        store.insert_conversation(group);
        let push = Arc::new(RecordingPush::default());
        let layer = MutationLayer::new(
            Arc::new(store),
            Arc::new(ManualClock::new(1_000)),
            MessagePolicy::default(),
        )
        .with_push(Some(push.clone() as Arc<dyn PushNotifier>));

        layer
            .append_message(
                &ConversationId::new("g1"),
                &user("alice"),
                "ALICE",
                "standup",
                SendOptions::default(),
            )
            .await
            .unwrap();

        let sent = push.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, user("bob"));
        assert_eq!(sent[0].1.group_name.as_deref(), Some("Team"));
        assert_eq!(sent[0].1.preview, "standup");
    }

    #[tokio::test]
    async fn push_failure_does_not_fail_send() {
        let f = fixture();
        let push = Arc::new(RecordingPush {
            fail: true,
            ..RecordingPush::default()
        });
        let layer = MutationLayer::new(
            Arc::new(f.store.clone()),
            f.clock.clone(),
            MessagePolicy::default(),
        )
        .with_push(Some(push as Arc<dyn PushNotifier>));

        layer
            .append_message(&f.direct, &user("alice"), "alice", "hi", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(f.store.messages(&f.direct).len(), 1);
    }

    struct Caesar;

    impl Encryptor for Caesar {
        fn encrypt(
            &self,
            plaintext: &str,
            _: &ConversationId,
            _: &[UserId],
            _: &UserId,
        ) -> Result<EncryptedPayload, ChatError> {
            Ok(EncryptedPayload {
                ciphertext: plaintext.chars().rev().collect(),
                iv: "iv".into(),
                auth_tag: "tag".into(),
                key_id: "k1".into(),
            })
        }

        fn decrypt(&self, payload: &EncryptedPayload, _: &ConversationId) -> Result<String, ChatError> {
            Ok(payload.ciphertext.chars().rev().collect())
        }
    }

    #[tokio::test]
    async fn encrypted_conversations_store_ciphertext_only() {
        let f = fixture();
        let mut conv = f.store.conversation(&f.direct).unwrap();
        conv.encryption_enabled = true;
        f.store.insert_conversation(conv);
        let layer = MutationLayer::new(
            Arc::new(f.store.clone()),
            f.clock.clone(),
            MessagePolicy::default(),
        )
        .with_encryptor(Some(Arc::new(Caesar) as Arc<dyn Encryptor>));

        let msg = layer
            .append_message(&f.direct, &user("alice"), "alice", "secret", SendOptions::default())
            .await
            .unwrap();
        let stored = f.store.message(&f.direct, &msg.id).unwrap();
        assert_eq!(stored.text, "");
        assert_eq!(stored.encrypted.as_ref().unwrap().ciphertext, "terces");
        let conv = f.store.conversation(&f.direct).unwrap();
        assert_eq!(conv.last_message.as_ref().unwrap().text, "Encrypted message");

        let edited = layer
            .edit_message(&f.direct, &msg.id, &user("alice"), "public")
            .await
            .unwrap();
        assert_eq!(edited.encrypted.as_ref().unwrap().ciphertext, "cilbup");
        assert!(edited.edit_history.iter().all(|r| r.text.is_empty()));
        assert_eq!(edited.edit_history.len(), 2);
    }

    #[tokio::test]
    async fn encrypted_send_without_encryptor_fails() {
        let f = fixture();
        let mut conv = f.store.conversation(&f.direct).unwrap();
        conv.encryption_enabled = true;
        f.store.insert_conversation(conv);

        let err = f
            .layer
            .append_message(&f.direct, &user("alice"), "alice", "secret", SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encryption);
        assert!(f.store.messages(&f.direct).is_empty());
    }
}
