//! Conversation aggregate store.
//!
//! Every write runs through [`transact`] so the per-participant maps are
//! updated against the latest remote copy of the conversation.

use crate::clock::Clock;
use crate::collaborators::{
    decrypt_for_display, record_analytics, AnalyticsEvent, AnalyticsSink, Encryptor,
};
use crate::store::{transact, RemoteStore, Transaction};
use parley_core::aggregate::{
    self, active_typers, mark_messages_read, new_direct, new_group, record_incoming_message,
    GroupInfoUpdate, SettingsUpdate,
};
use parley_core::history::{paginate, HistoryCursor, HistoryPage};
use parley_core::listing::{archived_view, conversation_view, total_unread};
use parley_core::mutation::check_participant;
use parley_types::{
    ChatError, Conversation, ConversationId, GroupSettings, Identity, Message, MessageId,
    Timestamp, UserId,
};
use std::sync::Arc;
use std::time::Duration;

/// How long a typing indicator stays visible without a refresh.
pub const TYPING_TTL: Duration = Duration::from_secs(10);

/// Reads and writes conversation metadata.
pub struct ConversationStore<S: RemoteStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    encryptor: Option<Arc<dyn Encryptor>>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
}

impl<S: RemoteStore> ConversationStore<S> {
    /// Create a store over `store`.
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        encryptor: Option<Arc<dyn Encryptor>>,
        analytics: Option<Arc<dyn AnalyticsSink>>,
    ) -> Self {
        Self {
            store,
            clock,
            encryptor,
            analytics,
        }
    }

    /// Open the direct conversation between `me` and `other`, creating it
    /// on first use. Calling again returns the existing conversation.
    pub async fn create_direct(
        &self,
        me: &Identity,
        other: &Identity,
    ) -> Result<Conversation, ChatError> {
        let now = self.clock.now_ms();
        let draft = new_direct(
            (me.uid.clone(), me.profile()),
            (other.uid.clone(), other.profile()),
            now,
        )?;
        let id = draft.id.clone();

        let (conversation, created) = transact(&*self.store, &id, |tx: &mut Transaction| {
            if tx.conversation_exists() {
                return Ok((tx.conversation()?.clone(), false));
            }
            tx.create_conversation(draft.clone())?;
            Ok((draft.clone(), true))
        })
        .await?;

        if created {
            tracing::info!(conversation_id = %id, "direct conversation created");
            record_analytics(
                self.analytics.as_deref(),
                AnalyticsEvent::ConversationCreated {
                    conversation_id: id,
                    is_group: false,
                    participant_count: conversation.participants.len(),
                },
            );
        }
        Ok(conversation)
    }

    /// Create a group owned by `creator`, who becomes its first admin.
    pub async fn create_group(
        &self,
        creator: &Identity,
        members: &[Identity],
        name: &str,
        settings: GroupSettings,
    ) -> Result<Conversation, ChatError> {
        let now = self.clock.now_ms();
        let id = ConversationId::generate();
        let mut conversation = new_group(
            id.clone(),
            (creator.uid.clone(), creator.profile()),
            members.iter().map(|m| (m.uid.clone(), m.profile())).collect(),
            name,
            settings,
            now,
        )?;

        let mut notice = Message::new_system(
            id.clone(),
            format!("{} created the group", creator.display_name),
            now,
        );
        notice.id = MessageId::generate();
        record_incoming_message(&mut conversation, &notice);

        transact(&*self.store, &id, |tx: &mut Transaction| {
            tx.create_conversation(conversation.clone())?;
            tx.insert_message(notice.clone())
        })
        .await?;

        tracing::info!(
            conversation_id = %id,
            participants = conversation.participants.len(),
            "group created"
        );
        record_analytics(
            self.analytics.as_deref(),
            AnalyticsEvent::ConversationCreated {
                conversation_id: id,
                is_group: true,
                participant_count: conversation.participants.len(),
            },
        );
        Ok(conversation)
    }

    /// Read one conversation as seen by `viewer`.
    pub async fn get(
        &self,
        id: &ConversationId,
        viewer: &UserId,
    ) -> Result<Conversation, ChatError> {
        let conversation = self
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| ChatError::not_found("Conversation"))?;
        check_participant(&conversation, viewer)?;
        Ok(conversation)
    }

    /// One-shot read of `user`'s conversation list (non-archived, newest first).
    pub async fn list(&self, user: &UserId) -> Result<Vec<Conversation>, ChatError> {
        let all = self.store.list_conversations(user).await?;
        Ok(conversation_view(all, user))
    }

    /// One-shot read of `user`'s archived conversations.
    pub async fn list_archived(&self, user: &UserId) -> Result<Vec<Conversation>, ChatError> {
        let all = self.store.list_conversations(user).await?;
        Ok(archived_view(all, user))
    }

    /// Unread messages across every non-muted conversation of `user`.
    pub async fn total_unread(&self, user: &UserId) -> Result<u32, ChatError> {
        let all = self.store.list_conversations(user).await?;
        Ok(total_unread(&all, user))
    }

    /// Zero `user`'s unread count and move messages from others to `Read`.
    ///
    /// Returns how many messages changed status.
    pub async fn mark_read(&self, id: &ConversationId, user: &UserId) -> Result<usize, ChatError> {
        let now = self.clock.now_ms();
        let changed = transact(&*self.store, id, |tx: &mut Transaction| {
            aggregate::mark_read(tx.conversation_mut()?, user, now)?;
            Ok(tx.update_messages(|m| mark_messages_read(std::iter::once(m), user) > 0))
        })
        .await?;
        tracing::debug!(conversation_id = %id, user = %user, changed, "conversation marked read");
        Ok(changed)
    }

    /// Partial per-user settings update. Unspecified fields are untouched.
    pub async fn update_settings(
        &self,
        id: &ConversationId,
        user: &UserId,
        update: SettingsUpdate,
    ) -> Result<(), ChatError> {
        let now = self.clock.now_ms();
        transact(&*self.store, id, |tx: &mut Transaction| {
            aggregate::apply_settings(tx.conversation_mut()?, user, &update, now)
        })
        .await
    }

    /// Set or clear `user`'s typing indicator.
    pub async fn set_typing(
        &self,
        id: &ConversationId,
        user: &UserId,
        typing: bool,
    ) -> Result<(), ChatError> {
        let now = self.clock.now_ms();
        transact(&*self.store, id, |tx: &mut Transaction| {
            aggregate::set_typing(tx.conversation_mut()?, user, typing, now)
        })
        .await
    }

    /// Users other than `viewer` who typed recently.
    pub async fn typing_users(
        &self,
        id: &ConversationId,
        viewer: &UserId,
    ) -> Result<Vec<UserId>, ChatError> {
        let conversation = self.get(id, viewer).await?;
        let ttl_ms = TYPING_TTL.as_millis() as i64;
        Ok(active_typers(&conversation, viewer, self.clock.now_ms(), ttl_ms))
    }

    /// Add members to a group. Returns the system notice that was posted.
    pub async fn add_participants(
        &self,
        id: &ConversationId,
        actor: &UserId,
        members: &[Identity],
    ) -> Result<Message, ChatError> {
        let members: Vec<_> = members.iter().map(|m| (m.uid.clone(), m.profile())).collect();
        self.group_change(id, "members added", |conv, now| {
            aggregate::add_participants(conv, actor, members.clone(), now)
        })
        .await
    }

    /// Remove `target` from a group; `actor == target` means leaving.
    pub async fn remove_participant(
        &self,
        id: &ConversationId,
        actor: &UserId,
        target: &UserId,
    ) -> Result<Message, ChatError> {
        self.group_change(id, "member removed", |conv, now| {
            aggregate::remove_participant(conv, actor, target, now)
        })
        .await
    }

    /// Update group name, description, avatar or settings.
    pub async fn update_group_info(
        &self,
        id: &ConversationId,
        actor: &UserId,
        update: GroupInfoUpdate,
    ) -> Result<Message, ChatError> {
        self.group_change(id, "group info updated", |conv, now| {
            aggregate::update_group_info(conv, actor, update.clone(), now)
        })
        .await
    }

    /// Turn body encryption on or off. In groups only admins may do this.
    pub async fn set_encryption(
        &self,
        id: &ConversationId,
        actor: &UserId,
        enabled: bool,
    ) -> Result<(), ChatError> {
        let now = self.clock.now_ms();
        transact(&*self.store, id, |tx: &mut Transaction| {
            let conv = tx.conversation_mut()?;
            check_participant(conv, actor)?;
            if conv.is_group() && !conv.is_admin(actor) {
                return Err(ChatError::permission(
                    "Only admins can change encryption for this group",
                ));
            }
            conv.encryption_enabled = enabled;
            conv.updated_at = conv.updated_at.max(now);
            Ok(())
        })
        .await?;
        tracing::info!(conversation_id = %id, enabled, "encryption setting changed");
        Ok(())
    }

    /// One page of history, newest first, older than `before`.
    pub async fn load_history(
        &self,
        id: &ConversationId,
        viewer: &UserId,
        before: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<HistoryPage, ChatError> {
        self.get(id, viewer).await?;
        let messages = self.store.list_messages(id).await?;
        let mut page = paginate(messages, viewer, before, limit);
        let encryptor = self.encryptor.as_deref();
        page.messages = page
            .messages
            .into_iter()
            .map(|m| decrypt_for_display(encryptor, m))
            .collect();
        Ok(page)
    }

    /// Apply a group rule and post its notice in the same transaction.
    async fn group_change<F>(
        &self,
        id: &ConversationId,
        what: &str,
        mut change: F,
    ) -> Result<Message, ChatError>
    where
        F: FnMut(&mut Conversation, Timestamp) -> Result<String, ChatError> + Send,
    {
        let now = self.clock.now_ms();
        let notice_id = MessageId::generate();
        let notice = transact(&*self.store, id, |tx: &mut Transaction| {
            let text = change(tx.conversation_mut()?, now)?;
            let mut notice = Message::new_system(id.clone(), text, now);
            notice.id = notice_id.clone();
            record_incoming_message(tx.conversation_mut()?, &notice);
            tx.insert_message(notice.clone())?;
            Ok(notice)
        })
        .await?;
        tracing::info!(conversation_id = %id, notice = %notice.text, "{}", what);
        Ok(notice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use parley_types::{ErrorKind, MessageKind, MessageStatus};
    use std::sync::Mutex;

    fn identity(id: &str) -> Identity {
        Identity {
            uid: UserId::new(id),
            display_name: id.to_uppercase(),
            avatar: None,
        }
    }

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    struct Fixture {
        store: MemoryStore,
        clock: Arc<ManualClock>,
        conversations: ConversationStore<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let conversations = ConversationStore::new(
            Arc::new(store.clone()),
            clock.clone(),
            None,
            None,
        );
        Fixture {
            store,
            clock,
            conversations,
        }
    }

    async fn group(f: &Fixture) -> Conversation {
        f.conversations
            .create_group(
                &identity("alice"),
                &[identity("bob"), identity("carol")],
                "Hikers",
                GroupSettings::default(),
            )
            .await
            .unwrap()
    }

    // ===========================================
    // Creation Tests
    // ===========================================

    #[tokio::test]
    async fn direct_conversation_is_created_once() {
        let f = fixture();
        let first = f
            .conversations
            .create_direct(&identity("alice"), &identity("bob"))
            .await
            .unwrap();
        let second = f
            .conversations
            .create_direct(&identity("bob"), &identity("alice"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.id.as_str(), "alice_bob");
        assert_eq!(f.store.commit_count(), 1);
    }

    #[tokio::test]
    async fn group_creation_posts_notice_without_unread() {
        let f = fixture();
        let conv = group(&f).await;

        let stored = f.store.conversation(&conv.id).unwrap();
        assert!(stored.is_admin(&user("alice")));
        assert_eq!(stored.unread_for(&user("bob")), 0);
        assert_eq!(
            stored.last_message.as_ref().unwrap().text,
            "ALICE created the group"
        );

        let messages = f.store.messages(&conv.id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::System);
    }

    struct Recording(Mutex<Vec<AnalyticsEvent>>);

    impl AnalyticsSink for Recording {
        fn record(&self, event: AnalyticsEvent) -> Result<(), ChatError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn creation_reports_analytics() {
        let store = MemoryStore::new();
        let sink = Arc::new(Recording(Mutex::new(Vec::new())));
        let conversations = ConversationStore::new(
            Arc::new(store),
            Arc::new(ManualClock::new(0)),
            None,
            Some(sink.clone() as Arc<dyn AnalyticsSink>),
        );
        conversations
            .create_direct(&identity("a"), &identity("b"))
            .await
            .unwrap();
        conversations
            .create_direct(&identity("a"), &identity("b"))
            .await
            .unwrap();

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            AnalyticsEvent::ConversationCreated {
                is_group: false,
                participant_count: 2,
                ..
            }
        ));
    }

    // ===========================================
    // Read State Tests
    // ===========================================

    #[tokio::test]
    async fn mark_read_zeroes_unread_and_marks_messages() {
        let f = fixture();
        let conv = f
            .conversations
            .create_direct(&identity("alice"), &identity("bob"))
            .await
            .unwrap();

        for (i, sender) in ["alice", "alice", "bob"].iter().enumerate() {
            let msg = Message::new_text(
                MessageId::new(format!("m{}", i)),
                conv.id.clone(),
                user(sender),
                *sender,
                "hi",
                2_000 + i as i64,
            );
            transact(&f.store, &conv.id, |tx: &mut Transaction| {
                record_incoming_message(tx.conversation_mut()?, &msg);
                tx.insert_message(msg.clone())
            })
            .await
            .unwrap();
        }
        assert_eq!(f.store.conversation(&conv.id).unwrap().unread_for(&user("bob")), 2);

        f.clock.set(5_000);
        let changed = f.conversations.mark_read(&conv.id, &user("bob")).await.unwrap();

        assert_eq!(changed, 2);
        let stored = f.store.conversation(&conv.id).unwrap();
        assert_eq!(stored.unread_for(&user("bob")), 0);
        assert_eq!(stored.unread_for(&user("alice")), 1);
        assert_eq!(stored.last_read_timestamp[&user("bob")], 5_000);
        let statuses: Vec<MessageStatus> =
            f.store.messages(&conv.id).iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            vec![MessageStatus::Read, MessageStatus::Read, MessageStatus::Sent]
        );
    }

    #[tokio::test]
    async fn mark_read_by_outsider_is_rejected() {
        let f = fixture();
        let conv = group(&f).await;
        let err = f
            .conversations
            .mark_read(&conv.id, &user("mallory"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    // ===========================================
    // Settings Tests
    // ===========================================

    #[tokio::test]
    async fn settings_update_is_partial() {
        let f = fixture();
        let conv = group(&f).await;
        f.conversations
            .update_settings(
                &conv.id,
                &user("bob"),
                SettingsUpdate {
                    is_muted: Some(true),
                    ..SettingsUpdate::default()
                },
            )
            .await
            .unwrap();
        f.conversations
            .update_settings(
                &conv.id,
                &user("bob"),
                SettingsUpdate {
                    is_pinned: Some(true),
                    ..SettingsUpdate::default()
                },
            )
            .await
            .unwrap();

        let stored = f.store.conversation(&conv.id).unwrap();
        assert!(stored.muted_for(&user("bob")));
        assert!(stored.is_pinned[&user("bob")]);
        assert!(!stored.muted_for(&user("alice")));
    }

    #[tokio::test]
    async fn archived_conversations_leave_the_main_list() {
        let f = fixture();
        let conv = group(&f).await;
        f.conversations
            .update_settings(
                &conv.id,
                &user("bob"),
                SettingsUpdate {
                    is_archived: Some(true),
                    ..SettingsUpdate::default()
                },
            )
            .await
            .unwrap();

        assert!(f.conversations.list(&user("bob")).await.unwrap().is_empty());
        assert_eq!(f.conversations.list_archived(&user("bob")).await.unwrap().len(), 1);
        assert_eq!(f.conversations.list(&user("alice")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn typing_indicators_expire() {
        let f = fixture();
        let conv = group(&f).await;
        f.conversations
            .set_typing(&conv.id, &user("bob"), true)
            .await
            .unwrap();

        let typing = f
            .conversations
            .typing_users(&conv.id, &user("alice"))
            .await
            .unwrap();
        assert_eq!(typing, vec![user("bob")]);

        f.clock.advance(Duration::from_secs(11));
        let typing = f
            .conversations
            .typing_users(&conv.id, &user("alice"))
            .await
            .unwrap();
        assert!(typing.is_empty());
    }

    // ===========================================
    // Group Tests
    // ===========================================

    #[tokio::test]
    async fn adding_members_initializes_maps_and_posts_notice() {
        let f = fixture();
        let conv = group(&f).await;
        let notice = f
            .conversations
            .add_participants(&conv.id, &user("alice"), &[identity("dave")])
            .await
            .unwrap();

        assert_eq!(notice.text, "ALICE added DAVE");
        let stored = f.store.conversation(&conv.id).unwrap();
        assert!(stored.is_participant(&user("dave")));
        assert_eq!(stored.unread_count.get(&user("dave")), Some(&0));
        assert!(aggregate::check_invariants(&stored));
        assert_eq!(f.store.messages(&conv.id).len(), 2);
    }

    #[tokio::test]
    async fn removing_members_cleans_maps() {
        let f = fixture();
        let conv = group(&f).await;
        f.conversations
            .update_settings(
                &conv.id,
                &user("carol"),
                SettingsUpdate {
                    is_muted: Some(true),
                    ..SettingsUpdate::default()
                },
            )
            .await
            .unwrap();

        let notice = f
            .conversations
            .remove_participant(&conv.id, &user("alice"), &user("carol"))
            .await
            .unwrap();

        assert_eq!(notice.text, "ALICE removed CAROL");
        let stored = f.store.conversation(&conv.id).unwrap();
        assert!(!stored.is_participant(&user("carol")));
        assert!(!stored.is_muted.contains_key(&user("carol")));
        assert!(aggregate::check_invariants(&stored));
    }

    #[tokio::test]
    async fn non_admin_cannot_remove_others() {
        let f = fixture();
        let conv = group(&f).await;
        let err = f
            .conversations
            .remove_participant(&conv.id, &user("bob"), &user("carol"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
        // Failed rule leaves no notice behind
        assert_eq!(f.store.messages(&conv.id).len(), 1);
    }

    #[tokio::test]
    async fn group_operations_rejected_on_direct_conversations() {
        let f = fixture();
        let conv = f
            .conversations
            .create_direct(&identity("alice"), &identity("bob"))
            .await
            .unwrap();
        let err = f
            .conversations
            .add_participants(&conv.id, &user("alice"), &[identity("carol")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn rename_posts_notice() {
        let f = fixture();
        let conv = group(&f).await;
        let notice = f
            .conversations
            .update_group_info(
                &conv.id,
                &user("bob"),
                GroupInfoUpdate {
                    name: Some("Climbers".into()),
                    ..GroupInfoUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(notice.text, "BOB changed the group name to \"Climbers\"");
        let stored = f.store.conversation(&conv.id).unwrap();
        assert_eq!(stored.group().unwrap().name, "Climbers");
    }

    #[tokio::test]
    async fn only_admins_toggle_group_encryption() {
        let f = fixture();
        let conv = group(&f).await;
        let err = f
            .conversations
            .set_encryption(&conv.id, &user("bob"), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);

        f.conversations
            .set_encryption(&conv.id, &user("alice"), true)
            .await
            .unwrap();
        assert!(f.store.conversation(&conv.id).unwrap().encryption_enabled);
    }

    // ===========================================
    // History Tests
    // ===========================================

    #[tokio::test]
    async fn history_pages_backwards() {
        let f = fixture();
        let conv = f
            .conversations
            .create_direct(&identity("alice"), &identity("bob"))
            .await
            .unwrap();
        for i in 0..5 {
            f.store.insert_message(Message::new_text(
                MessageId::new(format!("m{}", i)),
                conv.id.clone(),
                user("alice"),
                "ALICE",
                format!("msg {}", i),
                2_000 + i,
            ));
        }

        let first = f
            .conversations
            .load_history(&conv.id, &user("bob"), None, 3)
            .await
            .unwrap();
        let texts: Vec<&str> = first.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg 4", "msg 3", "msg 2"]);
        assert!(first.has_more());

        let second = f
            .conversations
            .load_history(&conv.id, &user("bob"), first.next_cursor.as_ref(), 3)
            .await
            .unwrap();
        let texts: Vec<&str> = second.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg 1", "msg 0"]);
        assert!(!second.has_more());
    }

    #[tokio::test]
    async fn history_requires_participation() {
        let f = fixture();
        let conv = group(&f).await;
        let err = f
            .conversations
            .load_history(&conv.id, &user("mallory"), None, 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);

        let missing = f
            .conversations
            .load_history(&ConversationId::new("nope"), &user("alice"), None, 10)
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }
}
