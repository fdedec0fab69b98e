//! ChatEngine - the interface the UI layer talks to.
//!
//! The engine wires the listener pool, conversation store, mutation layer
//! and offline outbox over one remote store, and owns their lifecycle.
//!
//! ```text
//! UI → ChatEngine ┬→ ListenerPool ──────→ RemoteStore (watch)
//!                 ├→ ConversationStore ─→ RemoteStore (transactions)
//!                 ├→ MutationLayer ─────→ RemoteStore (transactions)
//!                 └→ OfflineOutbox ─────→ MutationLayer + LocalStorage
//! ```
//!
//! # Example
//!
//! ```ignore
//! use parley_engine::{ChatEngine, MemoryStore, EngineConfig};
//!
//! let engine = ChatEngine::builder(Arc::new(MemoryStore::new()))
//!     .config(EngineConfig::default())
//!     .build()?;
//! engine.init().await?;
//!
//! let handle = engine.subscribe_conversations(&me, |snapshot| render(snapshot));
//! engine.queue_offline(&conv, &me, "Me", "hello", SendOptions::default()).await?;
//! ```

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{AnalyticsSink, Encryptor, PushNotifier};
use crate::config::{ConfigError, EngineConfig};
use crate::conversations::ConversationStore;
use crate::local::{LocalStorage, MemoryStorage};
use crate::mutations::{ForwardReport, MutationLayer, SendOptions};
use crate::outbox::{OfflineOutbox, SyncListenerId, SyncStats};
use crate::pool::{ListenerHandle, ListenerPool, PoolStats, Snapshot};
use crate::store::RemoteStore;
use parley_core::{GroupInfoUpdate, HistoryCursor, HistoryPage, ReactionChange, SettingsUpdate};
use parley_core::OfflineOutboxEntry;
use parley_types::{
    ChatError, Conversation, ConversationId, GroupSettings, Identity, Message, MessageId,
    OutboxId, UserId,
};
use std::sync::Arc;
use tokio::sync::watch;

/// Builder for [`ChatEngine`].
pub struct ChatEngineBuilder<S: RemoteStore> {
    store: Arc<S>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    encryptor: Option<Arc<dyn Encryptor>>,
    push: Option<Arc<dyn PushNotifier>>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    storage: Option<Arc<dyn LocalStorage>>,
    online: bool,
}

impl<S: RemoteStore> ChatEngineBuilder<S> {
    /// Use this configuration instead of the defaults.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this clock for timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Encrypt messages in conversations that enable encryption.
    pub fn encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Send push notifications for new messages.
    pub fn push(mut self, push: Arc<dyn PushNotifier>) -> Self {
        self.push = Some(push);
        self
    }

    /// Report creation events.
    pub fn analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    /// Durable storage for the outbox. Defaults to in-memory.
    pub fn local_storage(mut self, storage: Arc<dyn LocalStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Initial connectivity. Defaults to online.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> Result<ChatEngine<S>, ConfigError> {
        self.config.validate()?;

        let mutations = Arc::new(
            MutationLayer::new(Arc::clone(&self.store), Arc::clone(&self.clock), self.config.messages.policy())
                .with_encryptor(self.encryptor.clone())
                .with_push(self.push)
                .with_analytics(self.analytics.clone()),
        );
        let conversations = ConversationStore::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.encryptor.clone(),
            self.analytics,
        );
        let pool = ListenerPool::new(
            Arc::clone(&self.store),
            self.config.pool.clone(),
            self.encryptor,
        );
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let outbox = OfflineOutbox::new(
            Arc::clone(&mutations),
            storage,
            Arc::clone(&self.clock),
            self.config.outbox.clone(),
            self.online,
        );

        Ok(ChatEngine {
            config: self.config,
            pool,
            conversations,
            mutations,
            outbox,
        })
    }
}

/// The messaging sync core.
pub struct ChatEngine<S: RemoteStore> {
    config: EngineConfig,
    pool: ListenerPool<S>,
    conversations: ConversationStore<S>,
    mutations: Arc<MutationLayer<S>>,
    outbox: OfflineOutbox<S>,
}

impl<S: RemoteStore> ChatEngine<S> {
    /// Start building an engine over `store`.
    pub fn builder(store: Arc<S>) -> ChatEngineBuilder<S> {
        ChatEngineBuilder {
            store,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            encryptor: None,
            push: None,
            analytics: None,
            storage: None,
            online: true,
        }
    }

    /// Engine with the given config and no collaborators.
    pub fn new(store: Arc<S>, config: EngineConfig) -> Result<Self, ConfigError> {
        Self::builder(store).config(config).build()
    }

    /// Start the eviction sweeper and load the outbox.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn init(&self) -> Result<(), ChatError> {
        self.pool.start_sweeper();
        let loaded = self.outbox.init().await?;
        tracing::info!(outbox_entries = loaded, "chat engine started");
        Ok(())
    }

    /// Stop background work and tear down every live subscription.
    pub fn shutdown(&self) {
        self.outbox.shutdown();
        self.pool.shutdown();
        tracing::info!("chat engine stopped");
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The listener pool.
    pub fn pool(&self) -> &ListenerPool<S> {
        &self.pool
    }

    /// The conversation store.
    pub fn conversations(&self) -> &ConversationStore<S> {
        &self.conversations
    }

    /// The mutation layer.
    pub fn mutations(&self) -> &MutationLayer<S> {
        &self.mutations
    }

    /// The offline outbox.
    pub fn outbox(&self) -> &OfflineOutbox<S> {
        &self.outbox
    }

    // ===========================================
    // Sending
    // ===========================================

    /// Send directly, without the outbox. Transport errors are returned to
    /// the caller.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        sender_name: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageId, ChatError> {
        let message = self
            .mutations
            .append_message(conversation_id, sender, sender_name, text, options)
            .await?;
        Ok(message.id)
    }

    /// Queue a message in the durable outbox.
    pub async fn queue_offline(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        sender_name: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<OutboxId, ChatError> {
        let entry = self
            .outbox
            .enqueue(conversation_id, sender, sender_name, text, options)
            .await?;
        Ok(entry.id)
    }

    /// Entries still held by the outbox.
    pub async fn pending_messages(&self) -> Vec<OfflineOutboxEntry> {
        self.outbox.pending_messages().await
    }

    /// Outbox counts and connectivity flags.
    pub async fn sync_stats(&self) -> SyncStats {
        self.outbox.stats().await
    }

    /// Run a sync pass now.
    pub async fn force_sync(&self) -> Result<SyncStats, ChatError> {
        self.outbox.force_sync().await
    }

    /// Be told about outbox status changes.
    pub async fn add_sync_listener(
        &self,
        listener: impl Fn(&SyncStats) + Send + Sync + 'static,
    ) -> SyncListenerId {
        self.outbox.add_sync_listener(listener).await
    }

    /// Stop a sync listener.
    pub fn remove_sync_listener(&self, id: SyncListenerId) -> bool {
        self.outbox.remove_sync_listener(id)
    }

    /// Report a connectivity change.
    pub async fn set_online(&self, online: bool) {
        self.outbox.set_online(online).await;
    }

    /// Follow a connectivity feed.
    pub fn observe_connectivity(&self, feed: watch::Receiver<bool>) {
        self.outbox.spawn_connectivity_observer(feed);
    }

    /// Drop an outbox entry.
    pub async fn discard_pending(&self, id: &OutboxId) -> Result<(), ChatError> {
        self.outbox.discard(id).await
    }

    /// Resend a failed outbox entry.
    pub async fn retry_pending(&self, id: &OutboxId) -> Result<(), ChatError> {
        self.outbox.retry(id).await
    }

    // ===========================================
    // Subscriptions
    // ===========================================

    /// Live conversation list for `user`.
    pub fn subscribe_conversations(
        &self,
        user: &UserId,
        on_change: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.pool.subscribe_conversations(user, on_change)
    }

    /// Live messages of one conversation as `viewer` sees them.
    pub fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
        viewer: &UserId,
        on_change: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.pool.subscribe_messages(conversation_id, viewer, on_change)
    }

    /// Listener pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // ===========================================
    // Message mutations
    // ===========================================

    /// Edit a message's body.
    pub async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
        new_text: &str,
    ) -> Result<Message, ChatError> {
        self.mutations
            .edit_message(conversation_id, message_id, actor, new_text)
            .await
    }

    /// Delete a message for every participant.
    pub async fn delete_for_everyone(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<(), ChatError> {
        self.mutations
            .delete_for_everyone(conversation_id, message_id, actor)
            .await
    }

    /// Hide a message from `actor` only.
    pub async fn delete_for_me(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<(), ChatError> {
        self.mutations
            .delete_for_me(conversation_id, message_id, actor)
            .await
    }

    /// Add or remove `actor`'s reaction.
    pub async fn toggle_reaction(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
        emoji: &str,
    ) -> Result<ReactionChange, ChatError> {
        self.mutations
            .toggle_reaction(conversation_id, message_id, actor, emoji)
            .await
    }

    /// Pin a message.
    pub async fn pin_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<(), ChatError> {
        self.mutations
            .pin_message(conversation_id, message_id, actor)
            .await
    }

    /// Unpin a message.
    pub async fn unpin_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<(), ChatError> {
        self.mutations
            .unpin_message(conversation_id, message_id, actor)
            .await
    }

    /// Pinned messages of a conversation.
    pub async fn pinned_messages(
        &self,
        conversation_id: &ConversationId,
        viewer: &UserId,
    ) -> Result<Vec<Message>, ChatError> {
        self.mutations.pinned_messages(conversation_id, viewer).await
    }

    /// Forward one message to several conversations.
    pub async fn forward_message(
        &self,
        actor: &UserId,
        actor_name: &str,
        source: (ConversationId, MessageId),
        targets: &[ConversationId],
        comment: Option<&str>,
    ) -> Result<ForwardReport, ChatError> {
        self.forward_messages(actor, actor_name, &[source], targets, comment)
            .await
    }

    /// Forward every source message to every target conversation.
    pub async fn forward_messages(
        &self,
        actor: &UserId,
        actor_name: &str,
        sources: &[(ConversationId, MessageId)],
        targets: &[ConversationId],
        comment: Option<&str>,
    ) -> Result<ForwardReport, ChatError> {
        self.mutations
            .forward_messages(actor, actor_name, sources, targets, comment)
            .await
    }

    // ===========================================
    // Conversations
    // ===========================================

    /// Open (or reuse) the direct conversation between two users.
    pub async fn create_direct(
        &self,
        me: &Identity,
        other: &Identity,
    ) -> Result<Conversation, ChatError> {
        self.conversations.create_direct(me, other).await
    }

    /// Create a group.
    pub async fn create_group(
        &self,
        creator: &Identity,
        members: &[Identity],
        name: &str,
        settings: GroupSettings,
    ) -> Result<Conversation, ChatError> {
        self.conversations
            .create_group(creator, members, name, settings)
            .await
    }

    /// One conversation, if `viewer` takes part in it.
    pub async fn conversation(
        &self,
        id: &ConversationId,
        viewer: &UserId,
    ) -> Result<Conversation, ChatError> {
        self.conversations.get(id, viewer).await
    }

    /// Non-archived conversations of `user`, most recent first.
    pub async fn list_conversations(&self, user: &UserId) -> Result<Vec<Conversation>, ChatError> {
        self.conversations.list(user).await
    }

    /// Archived conversations of `user`.
    pub async fn list_archived(&self, user: &UserId) -> Result<Vec<Conversation>, ChatError> {
        self.conversations.list_archived(user).await
    }

    /// Unread messages across every conversation of `user`.
    pub async fn total_unread(&self, user: &UserId) -> Result<u32, ChatError> {
        self.conversations.total_unread(user).await
    }

    /// Mark a conversation read for `user`.
    pub async fn mark_read(&self, id: &ConversationId, user: &UserId) -> Result<usize, ChatError> {
        self.conversations.mark_read(id, user).await
    }

    /// Change `user`'s per-conversation flags.
    pub async fn update_settings(
        &self,
        id: &ConversationId,
        user: &UserId,
        update: SettingsUpdate,
    ) -> Result<(), ChatError> {
        self.conversations.update_settings(id, user, update).await
    }

    /// Set or clear `user`'s typing indicator.
    pub async fn set_typing(
        &self,
        id: &ConversationId,
        user: &UserId,
        typing: bool,
    ) -> Result<(), ChatError> {
        self.conversations.set_typing(id, user, typing).await
    }

    /// Users currently typing, other than `viewer`.
    pub async fn typing_users(
        &self,
        id: &ConversationId,
        viewer: &UserId,
    ) -> Result<Vec<UserId>, ChatError> {
        self.conversations.typing_users(id, viewer).await
    }

    /// Add members to a group.
    pub async fn add_participants(
        &self,
        id: &ConversationId,
        actor: &UserId,
        members: &[Identity],
    ) -> Result<Message, ChatError> {
        self.conversations.add_participants(id, actor, members).await
    }

    /// Remove a member from a group (or leave it).
    pub async fn remove_participant(
        &self,
        id: &ConversationId,
        actor: &UserId,
        target: &UserId,
    ) -> Result<Message, ChatError> {
        self.conversations
            .remove_participant(id, actor, target)
            .await
    }

    /// Change a group's name, description or avatar.
    pub async fn update_group_info(
        &self,
        id: &ConversationId,
        actor: &UserId,
        update: GroupInfoUpdate,
    ) -> Result<Message, ChatError> {
        self.conversations
            .update_group_info(id, actor, update)
            .await
    }

    /// Turn per-conversation encryption on or off.
    pub async fn set_encryption(
        &self,
        id: &ConversationId,
        actor: &UserId,
        enabled: bool,
    ) -> Result<(), ChatError> {
        self.conversations.set_encryption(id, actor, enabled).await
    }

    /// A page of history, newest first.
    pub async fn load_history(
        &self,
        id: &ConversationId,
        viewer: &UserId,
        before: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<HistoryPage, ChatError> {
        self.conversations
            .load_history(id, viewer, before, limit)
            .await
    }
}

impl<S: RemoteStore> Drop for ChatEngine<S> {
    fn drop(&mut self) {
        self.outbox.shutdown();
    }
}
