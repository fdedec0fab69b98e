//! Listener pool.
//!
//! Multiplexes any number of logical subscriptions onto at most one live
//! remote subscription per [`ListenerKey`]:
//! - the first subscriber opens the remote stream, later ones share it and
//!   immediately receive the latest cached snapshot
//! - when the last subscriber detaches, teardown is scheduled after a grace
//!   delay; a new subscriber arriving in time cancels it
//! - a periodic sweep evicts idle entries, and a hard cap evicts the least
//!   recently used entry (subscriber-less ones first)
//! - a failed remote stream delivers an empty snapshot to every subscriber
//!   and drops the entry; the next `subscribe` opens a fresh stream
//!
//! The arena lives behind a synchronous mutex because detach runs from
//! `Drop`. Callbacks are always invoked with the lock released.

use crate::collaborators::{decrypt_for_display, Encryptor};
use crate::config::PoolConfig;
use crate::store::{RawSnapshot, RemoteStore, WatchEvent, WatchQuery, WatchStream};
use parley_core::listing::{conversation_view, message_view, visible_to};
use parley_types::{Conversation, ConversationId, Message, UserId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Identity of a pooled listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKey {
    /// Conversation list of one user.
    Conversations(UserId),
    /// Messages of one conversation as one viewer sees them.
    Messages(ConversationId, UserId),
}

impl ListenerKey {
    fn query(&self) -> WatchQuery {
        match self {
            Self::Conversations(user) => WatchQuery::ConversationsFor(user.clone()),
            Self::Messages(id, _) => WatchQuery::MessagesIn(id.clone()),
        }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversations(user) => write!(f, "conversations-{}", user),
            Self::Messages(id, viewer) => write!(f, "messages-{}-{}", id, viewer),
        }
    }
}

/// Domain snapshot delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    /// Conversation list: non-archived, newest activity first.
    Conversations(Vec<Conversation>),
    /// Messages oldest first, bodies decrypted.
    Messages(Vec<Message>),
}

impl Snapshot {
    fn empty_for(key: &ListenerKey) -> Self {
        match key {
            ListenerKey::Conversations(_) => Self::Conversations(Vec::new()),
            ListenerKey::Messages(..) => Self::Messages(Vec::new()),
        }
    }

    /// Conversations, or an empty slice for a message snapshot.
    pub fn conversations(&self) -> &[Conversation] {
        match self {
            Self::Conversations(c) => c,
            Self::Messages(_) => &[],
        }
    }

    /// Messages, or an empty slice for a conversation snapshot.
    pub fn messages(&self) -> &[Message] {
        match self {
            Self::Messages(m) => m,
            Self::Conversations(_) => &[],
        }
    }

    /// Whether the snapshot holds no documents.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Conversations(c) => c.is_empty(),
            Self::Messages(m) => m.is_empty(),
        }
    }
}

type SnapshotCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Counters for pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Remote subscriptions opened.
    pub opened: u64,
    /// Entries torn down after the grace delay.
    pub torn_down: u64,
    /// Entries evicted by the sweep or the size cap.
    pub evicted: u64,
    /// Subscriptions that failed to open or broke.
    pub failed: u64,
    /// Live entries right now.
    pub active: usize,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    opened: AtomicU64,
    torn_down: AtomicU64,
    evicted: AtomicU64,
    failed: AtomicU64,
}

struct Entry {
    id: u64,
    subscribers: BTreeMap<u64, SnapshotCallback>,
    latest: Option<Arc<Snapshot>>,
    last_used: Instant,
    teardown: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Entry {
    fn stop(&mut self) {
        if let Some(task) = self.pump.take() {
            task.abort();
        }
        if let Some(task) = self.teardown.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<ListenerKey, Entry>,
    next_id: u64,
}

impl PoolState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct PoolShared<S> {
    me: Weak<PoolShared<S>>,
    store: Arc<S>,
    config: PoolConfig,
    encryptor: Option<Arc<dyn Encryptor>>,
    state: Mutex<PoolState>,
    metrics: PoolMetrics,
}

trait Detach: Send + Sync {
    fn detach(&self, key: &ListenerKey, entry_id: u64, token: u64);
}

/// A subscriber's attachment to a pooled listener.
///
/// Dropping the handle detaches, same as calling [`ListenerHandle::detach`].
pub struct ListenerHandle {
    pool: Option<Weak<dyn Detach>>,
    key: ListenerKey,
    entry_id: u64,
    token: u64,
}

impl ListenerHandle {
    fn inert(key: ListenerKey) -> Self {
        Self {
            pool: None,
            key,
            entry_id: 0,
            token: 0,
        }
    }

    /// Key this handle is attached to.
    pub fn key(&self) -> &ListenerKey {
        &self.key
    }

    /// Stop receiving snapshots.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|weak| weak.upgrade()) {
            pool.detach(&self.key, self.entry_id, self.token);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("key", &self.key)
            .field("attached", &self.pool.is_some())
            .finish()
    }
}

impl<S: RemoteStore> PoolShared<S> {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shape(&self, key: &ListenerKey, raw: RawSnapshot) -> Snapshot {
        match (key, raw) {
            (ListenerKey::Conversations(user), RawSnapshot::Conversations(convs)) => {
                Snapshot::Conversations(conversation_view(convs, user))
            }
            (ListenerKey::Messages(_, viewer), RawSnapshot::Messages(msgs)) => {
                let encryptor = self.encryptor.as_deref();
                Snapshot::Messages(message_view(
                    visible_to(msgs, viewer)
                        .into_iter()
                        .map(|m| decrypt_for_display(encryptor, m)),
                ))
            }
            (key, _) => Snapshot::empty_for(key),
        }
    }

    fn deliver(&self, key: &ListenerKey, entry_id: u64, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        let callbacks: Vec<SnapshotCallback> = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(key).filter(|e| e.id == entry_id) else {
                return;
            };
            entry.latest = Some(Arc::clone(&snapshot));
            entry.last_used = Instant::now();
            entry.subscribers.values().cloned().collect()
        };
        for callback in callbacks {
            callback(&snapshot);
        }
    }

    fn fail(&self, key: &ListenerKey, entry_id: u64) {
        let callbacks: Vec<SnapshotCallback> = {
            let mut state = self.lock();
            if !state.entries.get(key).is_some_and(|e| e.id == entry_id) {
                return;
            }
            match state.entries.remove(key) {
                Some(mut entry) => {
                    if let Some(task) = entry.teardown.take() {
                        task.abort();
                    }
                    entry.subscribers.into_values().collect()
                }
                None => return,
            }
        };
        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        let empty = Snapshot::empty_for(key);
        for callback in callbacks {
            callback(&empty);
        }
    }

    fn teardown_if_idle(&self, key: &ListenerKey, entry_id: u64) {
        let mut state = self.lock();
        let idle = state
            .entries
            .get(key)
            .is_some_and(|e| e.id == entry_id && e.subscribers.is_empty());
        if !idle {
            return;
        }
        if let Some(mut entry) = state.entries.remove(key) {
            // Our own task: let it finish instead of aborting it
            entry.teardown.take();
            entry.stop();
        }
        self.metrics.torn_down.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(listener = %key, "listener torn down");
    }

    /// Evict the least recently used entry, preferring ones without subscribers.
    fn evict_lru(&self, state: &mut PoolState) -> Option<(ListenerKey, Vec<SnapshotCallback>)> {
        let victim = state
            .entries
            .iter()
            .min_by_key(|(_, e)| (!e.subscribers.is_empty(), e.last_used))
            .map(|(k, _)| k.clone())?;
        let mut entry = state.entries.remove(&victim)?;
        entry.stop();
        self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(listener = %victim, subscribers = entry.subscribers.len(), "listener evicted (pool full)");
        Some((victim, entry.subscribers.into_values().collect()))
    }

    fn sweep(&self) -> usize {
        let max_idle = self.config.max_idle();
        let mut state = self.lock();
        let stale: Vec<ListenerKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.subscribers.is_empty() && e.last_used.elapsed() >= max_idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(mut entry) = state.entries.remove(key) {
                entry.stop();
            }
            tracing::debug!(listener = %key, "idle listener swept");
        }
        self.metrics
            .evicted
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        stale.len()
    }
}

impl<S: RemoteStore> Detach for PoolShared<S> {
    fn detach(&self, key: &ListenerKey, entry_id: u64, token: u64) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key).filter(|e| e.id == entry_id) else {
            return;
        };
        if entry.subscribers.remove(&token).is_none() || !entry.subscribers.is_empty() {
            return;
        }
        entry.last_used = Instant::now();

        let grace = self.config.teardown_grace();
        let runtime = tokio::runtime::Handle::try_current();
        match runtime {
            Ok(runtime) if !grace.is_zero() => {
                let weak = self.me.clone();
                let pending = key.clone();
                entry.teardown = Some(runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.teardown_if_idle(&pending, entry_id);
                    }
                }));
                tracing::debug!(listener = %key, grace_secs = grace.as_secs(), "teardown scheduled");
            }
            _ => {
                if let Some(mut entry) = state.entries.remove(key) {
                    entry.stop();
                }
                self.metrics.torn_down.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(listener = %key, "listener torn down");
            }
        }
    }
}

async fn pump<S: RemoteStore>(
    shared: Weak<PoolShared<S>>,
    key: ListenerKey,
    entry_id: u64,
    mut stream: WatchStream,
) {
    while let Some(event) = stream.next().await {
        let Some(pool) = shared.upgrade() else {
            return;
        };
        match event {
            WatchEvent::Snapshot(raw) => {
                let snapshot = pool.shape(&key, raw);
                pool.deliver(&key, entry_id, snapshot);
            }
            WatchEvent::Error(e) => {
                tracing::warn!(listener = %key, error = %e, "subscription failed, dropping listener");
                pool.fail(&key, entry_id);
                return;
            }
        }
    }
    if let Some(pool) = shared.upgrade() {
        tracing::warn!(listener = %key, "subscription closed by store, dropping listener");
        pool.fail(&key, entry_id);
    }
}

/// Pool of shared realtime listeners.
pub struct ListenerPool<S: RemoteStore> {
    shared: Arc<PoolShared<S>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<S: RemoteStore> ListenerPool<S> {
    /// Create an empty pool. Message bodies are decrypted with `encryptor`.
    pub fn new(store: Arc<S>, config: PoolConfig, encryptor: Option<Arc<dyn Encryptor>>) -> Self {
        let shared = Arc::new_cyclic(|me| PoolShared {
            me: me.clone(),
            store,
            config,
            encryptor,
            state: Mutex::new(PoolState::default()),
            metrics: PoolMetrics::default(),
        });
        Self {
            shared,
            sweeper: Mutex::new(None),
        }
    }

    /// Subscribe to `key`. `on_data` receives every snapshot until the
    /// handle is detached or dropped.
    ///
    /// Must be called from within a tokio runtime; outside one the
    /// subscriber receives a single empty snapshot.
    pub fn subscribe(
        &self,
        key: ListenerKey,
        on_data: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let callback: SnapshotCallback = Arc::new(on_data);
        let shared = &self.shared;
        let mut state = shared.lock();
        let token = state.next_id();

        if let Some(entry) = state.entries.get_mut(&key) {
            if let Some(task) = entry.teardown.take() {
                task.abort();
                tracing::debug!(listener = %key, "teardown cancelled by new subscriber");
            }
            entry.subscribers.insert(token, Arc::clone(&callback));
            entry.last_used = Instant::now();
            let entry_id = entry.id;
            let cached = entry.latest.clone();
            drop(state);

            if let Some(snapshot) = cached {
                callback(&snapshot);
            }
            return self.handle(key, entry_id, token);
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            drop(state);
            tracing::warn!(listener = %key, "subscribe called outside a runtime");
            callback(&Snapshot::empty_for(&key));
            return ListenerHandle::inert(key);
        };

        let stream = match shared.store.watch(key.query()) {
            Ok(stream) => stream,
            Err(e) => {
                drop(state);
                shared.metrics.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(listener = %key, error = %e, "failed to open subscription");
                callback(&Snapshot::empty_for(&key));
                return ListenerHandle::inert(key);
            }
        };

        let evicted = if state.entries.len() >= shared.config.max_listeners {
            shared.evict_lru(&mut state)
        } else {
            None
        };

        let entry_id = state.next_id();
        let pump = runtime.spawn(pump(
            Arc::downgrade(shared),
            key.clone(),
            entry_id,
            stream,
        ));
        let mut subscribers = BTreeMap::new();
        subscribers.insert(token, callback);
        state.entries.insert(
            key.clone(),
            Entry {
                id: entry_id,
                subscribers,
                latest: None,
                last_used: Instant::now(),
                teardown: None,
                pump: Some(pump),
            },
        );
        drop(state);
        shared.metrics.opened.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(listener = %key, "subscription opened");

        if let Some((victim, callbacks)) = evicted {
            let empty = Snapshot::empty_for(&victim);
            for callback in callbacks {
                callback(&empty);
            }
        }
        self.handle(key, entry_id, token)
    }

    /// Subscribe to `user`'s conversation list.
    pub fn subscribe_conversations(
        &self,
        user: &UserId,
        on_data: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.subscribe(ListenerKey::Conversations(user.clone()), on_data)
    }

    /// Subscribe to the messages of a conversation, minus the ones `viewer`
    /// deleted for themselves.
    pub fn subscribe_messages(
        &self,
        conversation: &ConversationId,
        viewer: &UserId,
        on_data: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.subscribe(
            ListenerKey::Messages(conversation.clone(), viewer.clone()),
            on_data,
        )
    }

    fn handle(&self, key: ListenerKey, entry_id: u64, token: u64) -> ListenerHandle {
        let weak: Weak<PoolShared<S>> = Arc::downgrade(&self.shared);
        let pool: Weak<dyn Detach> = weak;
        ListenerHandle {
            pool: Some(pool),
            key,
            entry_id,
            token,
        }
    }

    /// Number of live pooled listeners.
    pub fn active_listener_count(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Number of subscribers attached to `key`.
    pub fn subscriber_count(&self, key: &ListenerKey) -> usize {
        self.shared
            .lock()
            .entries
            .get(key)
            .map_or(0, |e| e.subscribers.len())
    }

    /// Activity counters.
    pub fn stats(&self) -> PoolStats {
        let m = &self.shared.metrics;
        PoolStats {
            opened: m.opened.load(Ordering::Relaxed),
            torn_down: m.torn_down.load(Ordering::Relaxed),
            evicted: m.evicted.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            active: self.active_listener_count(),
        }
    }

    /// Evict subscriber-less entries idle longer than the configured maximum.
    ///
    /// Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Spawn the periodic eviction sweep.
    pub fn start_sweeper(&self) {
        let weak = Arc::downgrade(&self.shared);
        let every = self.shared.config.sweep_interval();
        let task = tokio::spawn(async move {
            tracing::debug!("listener sweeper started (interval: {}s)", every.as_secs());
            let mut timer = tokio::time::interval(every);
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let swept = shared.sweep();
                if swept > 0 {
                    tracing::info!("Sweep: evicted {} idle listeners", swept);
                }
            }
        });
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = sweeper.replace(task) {
            previous.abort();
        }
    }

    /// Stop the sweeper and close every listener. Subscribers are not notified.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let mut state = self.shared.lock();
        let count = state.entries.len();
        for (_, mut entry) in state.entries.drain() {
            entry.stop();
        }
        tracing::info!("listener pool shut down ({} listeners closed)", count);
    }
}

impl<S: RemoteStore> Drop for ListenerPool<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
