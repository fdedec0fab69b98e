//! Remote document store abstraction.
//!
//! The engine assumes a generic document store with two capabilities:
//! - per-conversation atomic read-modify-write transactions
//! - realtime change subscriptions
//!
//! # Design
//!
//! A transaction scope is one conversation: its document plus all of its
//! messages. The closure passed to [`RemoteStore::run_transaction`] gets a
//! [`Transaction`] holding a working copy; returning `Ok` commits the
//! changed documents, returning `Err` discards them. Backends with
//! optimistic concurrency may call the closure again against fresher state,
//! so it must not have side effects outside the transaction.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let unread = transact(&store, &conversation_id, |tx| {
//!     let conv = tx.conversation_mut()?;
//!     conv.unread_count.insert(user.clone(), 0);
//!     Ok(conv.unread_for(&other))
//! })
//! .await?;
//! ```

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use parley_types::{ChatError, Conversation, ConversationId, Message, MessageId, UserId};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::sync::mpsc;

/// Remote store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("remote store unreachable")]
    Unreachable,

    /// The store aborted the transaction.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// A realtime subscription failed.
    #[error("watch failed: {0}")]
    WatchFailed(String),
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        ChatError::transport(e.to_string())
    }
}

/// What a realtime subscription observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchQuery {
    /// Every conversation `user` participates in.
    ConversationsFor(UserId),
    /// Every message of one conversation.
    MessagesIn(ConversationId),
}

/// Raw documents pushed by a subscription, before any domain shaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSnapshot {
    /// Conversation documents.
    Conversations(Vec<Conversation>),
    /// Message documents.
    Messages(Vec<Message>),
}

/// One item of a realtime subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Full current result set.
    Snapshot(RawSnapshot),
    /// The subscription broke; no further events follow.
    Error(StoreError),
}

/// Receiving half of a realtime subscription.
///
/// Dropping the stream cancels the subscription.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    /// Wrap a channel fed by a store backend.
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the backend closed the subscription.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Transaction body.
pub type TxFn<'a> = Box<dyn FnMut(&mut Transaction) -> Result<(), ChatError> + Send + 'a>;

/// Generic remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Read one conversation (snapshot read, no transaction).
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Read one message (snapshot read).
    async fn get_message(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<Option<Message>, StoreError>;

    /// Read every message of a conversation (snapshot read).
    async fn list_messages(&self, conversation: &ConversationId)
        -> Result<Vec<Message>, StoreError>;

    /// Read every conversation `user` participates in (snapshot read).
    async fn list_conversations(&self, user: &UserId) -> Result<Vec<Conversation>, StoreError>;

    /// Run `f` atomically against the conversation `scope`.
    ///
    /// Errors from `f` are returned unchanged; store failures surface as
    /// transport errors.
    async fn run_transaction(&self, scope: &ConversationId, f: TxFn<'_>) -> Result<(), ChatError>;

    /// Open a realtime subscription. The current result set is pushed
    /// immediately, then again after every change.
    fn watch(&self, query: WatchQuery) -> Result<WatchStream, StoreError>;
}

/// Run a transaction that produces a value.
pub async fn transact<S, T, F>(store: &S, scope: &ConversationId, mut f: F) -> Result<T, ChatError>
where
    S: RemoteStore + ?Sized,
    T: Send,
    F: FnMut(&mut Transaction) -> Result<T, ChatError> + Send,
{
    let mut output = None;
    store
        .run_transaction(
            scope,
            Box::new(|tx: &mut Transaction| {
                output = Some(f(tx)?);
                Ok(())
            }),
        )
        .await?;
    output.ok_or_else(|| ChatError::transport("transaction finished without a result"))
}

/// Working copy of one conversation scope.
#[derive(Debug, Clone)]
pub struct Transaction {
    scope: ConversationId,
    conversation: Option<Conversation>,
    messages: BTreeMap<MessageId, Message>,
    conversation_dirty: bool,
    dirty_messages: BTreeSet<MessageId>,
}

/// Documents a committed transaction changed.
#[derive(Debug, Clone, Default)]
pub struct TransactionWrites {
    /// New conversation document, if it changed.
    pub conversation: Option<Conversation>,
    /// Changed or inserted messages.
    pub messages: Vec<Message>,
}

impl TransactionWrites {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.conversation.is_none() && self.messages.is_empty()
    }
}

impl Transaction {
    /// Start a transaction over freshly read documents.
    pub fn begin(
        scope: ConversationId,
        conversation: Option<Conversation>,
        messages: BTreeMap<MessageId, Message>,
    ) -> Self {
        Self {
            scope,
            conversation,
            messages,
            conversation_dirty: false,
            dirty_messages: BTreeSet::new(),
        }
    }

    /// Conversation this transaction covers.
    pub fn scope(&self) -> &ConversationId {
        &self.scope
    }

    /// The conversation document.
    pub fn conversation(&self) -> Result<&Conversation, ChatError> {
        self.conversation
            .as_ref()
            .ok_or_else(|| ChatError::not_found("Conversation"))
    }

    /// The conversation document, for writing.
    pub fn conversation_mut(&mut self) -> Result<&mut Conversation, ChatError> {
        let conv = self
            .conversation
            .as_mut()
            .ok_or_else(|| ChatError::not_found("Conversation"))?;
        self.conversation_dirty = true;
        Ok(conv)
    }

    /// Whether the conversation document exists.
    pub fn conversation_exists(&self) -> bool {
        self.conversation.is_some()
    }

    /// Create the conversation document.
    pub fn create_conversation(&mut self, conversation: Conversation) -> Result<(), ChatError> {
        if self.conversation.is_some() {
            return Err(ChatError::conflict("Conversation already exists"));
        }
        if conversation.id != self.scope {
            return Err(ChatError::validation(
                "Conversation id does not match the transaction scope",
            ));
        }
        self.conversation = Some(conversation);
        self.conversation_dirty = true;
        Ok(())
    }

    /// Whether a message exists.
    pub fn has_message(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    /// One message.
    pub fn message(&self, id: &MessageId) -> Result<&Message, ChatError> {
        self.messages
            .get(id)
            .ok_or_else(|| ChatError::not_found("Message"))
    }

    /// One message, for writing.
    pub fn message_mut(&mut self, id: &MessageId) -> Result<&mut Message, ChatError> {
        let message = self
            .messages
            .get_mut(id)
            .ok_or_else(|| ChatError::not_found("Message"))?;
        self.dirty_messages.insert(id.clone());
        Ok(message)
    }

    /// Add a new message.
    pub fn insert_message(&mut self, message: Message) -> Result<(), ChatError> {
        if message.conversation_id != self.scope {
            return Err(ChatError::validation(
                "Message belongs to a different conversation",
            ));
        }
        if self.messages.contains_key(&message.id) {
            return Err(ChatError::conflict("Message already exists"));
        }
        self.dirty_messages.insert(message.id.clone());
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    /// Apply `f` to every message; those for which it returns `true` are written.
    pub fn update_messages(&mut self, mut f: impl FnMut(&mut Message) -> bool) -> usize {
        let mut changed = 0;
        for (id, message) in self.messages.iter_mut() {
            if f(message) {
                self.dirty_messages.insert(id.clone());
                changed += 1;
            }
        }
        changed
    }

    /// Consume the transaction, keeping only changed documents.
    pub fn into_writes(mut self) -> TransactionWrites {
        let conversation = if self.conversation_dirty {
            self.conversation.take()
        } else {
            None
        };
        let messages = self
            .dirty_messages
            .iter()
            .filter_map(|id| self.messages.remove(id))
            .collect();
        TransactionWrites {
            conversation,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::{ConversationKind, UserId};

    fn conversation(id: &str) -> Conversation {
        Conversation {
            id: ConversationId::new(id),
            kind: ConversationKind::Direct,
            participants: [UserId::new("a"), UserId::new("b")].into_iter().collect(),
            participant_details: BTreeMap::new(),
            last_message: None,
            last_message_time: None,
            unread_count: BTreeMap::new(),
            last_read_timestamp: BTreeMap::new(),
            is_archived: BTreeMap::new(),
            is_muted: BTreeMap::new(),
            is_pinned: BTreeMap::new(),
            is_close_friend: BTreeMap::new(),
            typing_users: BTreeMap::new(),
            encryption_enabled: false,
            created_by: UserId::new("a"),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn message(id: &str, conv: &str) -> Message {
        Message::new_text(
            MessageId::new(id),
            ConversationId::new(conv),
            UserId::new("a"),
            "A",
            "hi",
            1,
        )
    }

    #[test]
    fn reads_do_not_produce_writes() {
        let mut messages = BTreeMap::new();
        messages.insert(MessageId::new("m1"), message("m1", "c1"));
        let tx = Transaction::begin(ConversationId::new("c1"), Some(conversation("c1")), messages);

        assert!(tx.conversation().is_ok());
        assert!(tx.message(&MessageId::new("m1")).is_ok());
        assert!(tx.into_writes().is_empty());
    }

    #[test]
    fn only_touched_documents_are_written() {
        let mut messages = BTreeMap::new();
        messages.insert(MessageId::new("m1"), message("m1", "c1"));
        messages.insert(MessageId::new("m2"), message("m2", "c1"));
        let mut tx =
            Transaction::begin(ConversationId::new("c1"), Some(conversation("c1")), messages);

        tx.message_mut(&MessageId::new("m2")).unwrap().text = "edited".into();
        let writes = tx.into_writes();

        assert!(writes.conversation.is_none());
        assert_eq!(writes.messages.len(), 1);
        assert_eq!(writes.messages[0].text, "edited");
    }

    #[test]
    fn missing_documents_are_not_found() {
        let mut tx = Transaction::begin(ConversationId::new("c1"), None, BTreeMap::new());
        assert!(matches!(
            tx.conversation_mut().unwrap_err(),
            ChatError::NotFound { .. }
        ));
        assert!(matches!(
            tx.message(&MessageId::new("x")).unwrap_err(),
            ChatError::NotFound { .. }
        ));
    }

    #[test]
    fn insert_rejects_duplicates_and_foreign_messages() {
        let mut tx = Transaction::begin(ConversationId::new("c1"), None, BTreeMap::new());
        tx.insert_message(message("m1", "c1")).unwrap();
        assert!(matches!(
            tx.insert_message(message("m1", "c1")).unwrap_err(),
            ChatError::StateConflict { .. }
        ));
        assert!(tx.insert_message(message("m2", "other")).is_err());
    }

    #[test]
    fn create_conversation_once() {
        let mut tx = Transaction::begin(ConversationId::new("c1"), None, BTreeMap::new());
        tx.create_conversation(conversation("c1")).unwrap();
        assert!(tx.create_conversation(conversation("c1")).is_err());
        assert!(tx.into_writes().conversation.is_some());
    }

    #[test]
    fn update_messages_marks_changed_only() {
        let mut messages = BTreeMap::new();
        messages.insert(MessageId::new("m1"), message("m1", "c1"));
        messages.insert(MessageId::new("m2"), message("m2", "c1"));
        let mut tx = Transaction::begin(ConversationId::new("c1"), None, messages);

        let changed = tx.update_messages(|m| {
            if m.id.as_str() == "m1" {
                m.text = "x".into();
                true
            } else {
                false
            }
        });
        assert_eq!(changed, 1);
        assert_eq!(tx.into_writes().messages.len(), 1);
    }

    #[test]
    fn store_errors_map_to_transport() {
        let err: ChatError = StoreError::Unreachable.into();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "transport error: remote store unreachable");
    }
}
