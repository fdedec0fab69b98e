//! In-memory remote store for testing and demos.
//!
//! Holds every conversation scope in a `DashMap`; a transaction holds the
//! scope's shard lock while its closure runs, so transactions on one
//! conversation serialize. Watchers get a fresh snapshot after every commit
//! that touches what they observe.
//!
//! Faults can be injected to exercise the engine's failure paths.

use super::{
    RawSnapshot, RemoteStore, StoreError, Transaction, TxFn, WatchEvent, WatchQuery, WatchStream,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parley_types::{ChatError, Conversation, ConversationId, Message, MessageId, UserId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// In-memory [`RemoteStore`].
///
/// Clones share the same documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    scopes: DashMap<ConversationId, ScopeDoc>,
    watchers: Mutex<Vec<Watcher>>,
    faults: Mutex<Faults>,
    commits: AtomicU64,
    watches_opened: AtomicU64,
}

#[derive(Debug, Clone, Default)]
struct ScopeDoc {
    conversation: Option<Conversation>,
    messages: BTreeMap<MessageId, Message>,
}

#[derive(Debug)]
struct Watcher {
    query: WatchQuery,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    fail_next_transaction: Option<String>,
    fail_next_watch: Option<String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn watchers(&self) -> std::sync::MutexGuard<'_, Vec<Watcher>> {
        self.inner
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ===========================================
    // Fault injection
    // ===========================================

    /// Make every operation fail as unreachable until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults().unreachable = unreachable;
    }

    /// Cause the next transaction to abort with the given reason.
    pub fn fail_next_transaction(&self, reason: &str) {
        self.faults().fail_next_transaction = Some(reason.to_string());
    }

    /// Cause the next `watch()` to fail with the given reason.
    pub fn fail_next_watch(&self, reason: &str) {
        self.faults().fail_next_watch = Some(reason.to_string());
    }

    /// Break every open subscription: each receives an error and is closed.
    pub fn fail_watches(&self, reason: &str) {
        let mut watchers = self.watchers();
        for watcher in watchers.drain(..) {
            let _ = watcher
                .tx
                .send(WatchEvent::Error(StoreError::WatchFailed(reason.to_string())));
        }
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.faults().unreachable {
            Err(StoreError::Unreachable)
        } else {
            Ok(())
        }
    }

    // ===========================================
    // Direct access (seeding and assertions)
    // ===========================================

    /// Write a conversation without a transaction or notifications.
    pub fn insert_conversation(&self, conversation: Conversation) {
        let id = conversation.id.clone();
        self.inner.scopes.entry(id).or_default().conversation = Some(conversation);
    }

    /// Write a message without a transaction or notifications.
    pub fn insert_message(&self, message: Message) {
        self.inner
            .scopes
            .entry(message.conversation_id.clone())
            .or_default()
            .messages
            .insert(message.id.clone(), message);
    }

    /// Current conversation document.
    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.inner.scopes.get(id)?.conversation.clone()
    }

    /// Current message document.
    pub fn message(&self, conversation: &ConversationId, id: &MessageId) -> Option<Message> {
        self.inner.scopes.get(conversation)?.messages.get(id).cloned()
    }

    /// Messages of a conversation in id order.
    pub fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.inner
            .scopes
            .get(conversation)
            .map(|s| s.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of committed transactions that changed something.
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    /// Number of subscriptions ever opened.
    pub fn watches_opened(&self) -> u64 {
        self.inner.watches_opened.load(Ordering::Relaxed)
    }

    /// Number of subscriptions whose receiver is still alive.
    pub fn active_watch_count(&self) -> usize {
        let mut watchers = self.watchers();
        watchers.retain(|w| !w.tx.is_closed());
        watchers.len()
    }

    fn conversations_for(&self, user: &UserId) -> Vec<Conversation> {
        self.inner
            .scopes
            .iter()
            .filter_map(|scope| scope.conversation.clone())
            .filter(|c| c.is_participant(user))
            .collect()
    }

    fn snapshot(&self, query: &WatchQuery) -> RawSnapshot {
        match query {
            WatchQuery::ConversationsFor(user) => {
                RawSnapshot::Conversations(self.conversations_for(user))
            }
            WatchQuery::MessagesIn(id) => RawSnapshot::Messages(self.messages(id)),
        }
    }

    fn notify(&self, scope: &ConversationId, affected_users: &BTreeSet<UserId>) {
        let mut watchers = self.watchers();
        watchers.retain(|w| !w.tx.is_closed());
        for watcher in watchers.iter() {
            let interested = match &watcher.query {
                WatchQuery::ConversationsFor(user) => affected_users.contains(user),
                WatchQuery::MessagesIn(id) => id == scope,
            };
            if interested {
                let _ = watcher
                    .tx
                    .send(WatchEvent::Snapshot(self.snapshot(&watcher.query)));
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        self.check_reachable()?;
        Ok(self.conversation(id))
    }

    async fn get_message(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<Option<Message>, StoreError> {
        self.check_reachable()?;
        Ok(self.message(conversation, id))
    }

    async fn list_messages(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<Message>, StoreError> {
        self.check_reachable()?;
        Ok(self.messages(conversation))
    }

    async fn list_conversations(&self, user: &UserId) -> Result<Vec<Conversation>, StoreError> {
        self.check_reachable()?;
        Ok(self.conversations_for(user))
    }

    async fn run_transaction(
        &self,
        scope: &ConversationId,
        mut f: TxFn<'_>,
    ) -> Result<(), ChatError> {
        {
            let mut faults = self.faults();
            if faults.unreachable {
                return Err(StoreError::Unreachable.into());
            }
            if let Some(reason) = faults.fail_next_transaction.take() {
                return Err(StoreError::Aborted(reason).into());
            }
        }

        let affected = {
            let mut doc = self.inner.scopes.entry(scope.clone()).or_default();
            let mut tx =
                Transaction::begin(scope.clone(), doc.conversation.clone(), doc.messages.clone());
            f(&mut tx)?;

            let writes = tx.into_writes();
            if writes.is_empty() {
                return Ok(());
            }

            let mut affected: BTreeSet<UserId> = doc
                .conversation
                .as_ref()
                .map(|c| c.participants.clone())
                .unwrap_or_default();
            if let Some(conversation) = writes.conversation {
                affected.extend(conversation.participants.iter().cloned());
                doc.conversation = Some(conversation);
            }
            for message in writes.messages {
                doc.messages.insert(message.id.clone(), message);
            }
            affected
        };

        self.inner.commits.fetch_add(1, Ordering::Relaxed);
        self.notify(scope, &affected);
        Ok(())
    }

    fn watch(&self, query: WatchQuery) -> Result<WatchStream, StoreError> {
        {
            let mut faults = self.faults();
            if faults.unreachable {
                return Err(StoreError::Unreachable);
            }
            if let Some(reason) = faults.fail_next_watch.take() {
                return Err(StoreError::WatchFailed(reason));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(WatchEvent::Snapshot(self.snapshot(&query)));
        self.watchers().push(Watcher { query, tx });
        self.inner.watches_opened.fetch_add(1, Ordering::Relaxed);
        Ok(WatchStream::new(rx))
    }
}
