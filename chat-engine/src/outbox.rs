//! Offline outbox and sync engine.
//!
//! Outgoing messages are persisted locally before any network attempt and
//! drained by sync passes:
//! - `enqueue()` persists a pending entry and, when online, sends it at once
//! - coming back online runs a full pass, ignoring retry backoff
//! - a periodic timer runs a pass honoring backoff
//! - a pass sends due entries in fixed-size concurrent batches, sequential
//!   across batches, and stops early if connectivity drops
//!
//! When a pass may start is decided by [`SyncMachine`]; this module only
//! executes its actions. Entries are persisted as one JSON list under the
//! configured storage key after every change.

use crate::clock::Clock;
use crate::config::OutboxConfig;
use crate::local::LocalStorage;
use crate::mutations::{MutationLayer, SendOptions};
use crate::store::RemoteStore;
use futures_util::future::join_all;
use parley_core::mutation::validate_body;
use parley_core::outbox::{OfflineOutboxEntry, OutboxCounts, OutboxStatus, RetryDecision};
use parley_core::sync::{SyncAction, SyncEvent, SyncMachine};
use parley_types::{ChatError, ConversationId, OutboxId, UserId};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Outbox counts plus connectivity flags, as shown in the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Entries waiting for a pass.
    pub pending: usize,
    /// Entries with an append in flight.
    pub sending: usize,
    /// Delivered entries not yet removed.
    pub sent: usize,
    /// Entries that gave up.
    pub failed: usize,
    /// Whether the device is online.
    pub is_online: bool,
    /// Whether a pass is running.
    pub is_syncing: bool,
}

/// Result of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Entries attempted.
    pub attempted: usize,
    /// Entries delivered.
    pub sent: usize,
    /// Entries that failed this attempt (retrying or given up).
    pub failed: usize,
}

/// Handle for removing a sync listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncListenerId(u64);

type SyncListener = Arc<dyn Fn(&SyncStats) + Send + Sync>;

struct OutboxInner<S: RemoteStore> {
    me: Weak<OutboxInner<S>>,
    mutations: Arc<MutationLayer<S>>,
    storage: Arc<dyn LocalStorage>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    entries: tokio::sync::Mutex<Vec<OfflineOutboxEntry>>,
    machine: Mutex<SyncMachine>,
    listeners: Mutex<Vec<(u64, SyncListener)>>,
    next_listener: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Durable queue of outgoing messages.
///
/// Clones share the same queue.
pub struct OfflineOutbox<S: RemoteStore> {
    inner: Arc<OutboxInner<S>>,
}

impl<S: RemoteStore> Clone for OfflineOutbox<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: RemoteStore> OutboxInner<S> {
    fn is_online(&self) -> bool {
        lock(&self.machine).is_online()
    }

    fn apply(&self, event: SyncEvent) -> Vec<SyncAction> {
        let mut machine = lock(&self.machine);
        let (next, actions) = machine.on_event(event);
        *machine = next;
        actions
    }

    /// Feed an event to the machine and execute what it decides, including
    /// any follow-up pass it asks for when the current one finishes.
    async fn drive(&self, event: SyncEvent) -> Option<PassReport> {
        let mut report: Option<PassReport> = None;
        let mut queue: VecDeque<SyncAction> = self.apply(event).into();
        while let Some(action) = queue.pop_front() {
            match action {
                SyncAction::EmitStatus => self.emit().await,
                SyncAction::StartPass { respect_backoff } => {
                    let pass = self.run_pass(respect_backoff).await;
                    let total = report.get_or_insert_with(PassReport::default);
                    total.attempted += pass.attempted;
                    total.sent += pass.sent;
                    total.failed += pass.failed;
                    queue.extend(self.apply(SyncEvent::PassFinished));
                }
            }
        }
        report
    }

    async fn run_pass(&self, respect_backoff: bool) -> PassReport {
        let now = self.clock.now_ms();
        let due: Vec<OutboxId> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.is_due(now, respect_backoff))
            .map(|e| e.id.clone())
            .collect();

        let mut report = PassReport::default();
        if due.is_empty() {
            return report;
        }
        tracing::info!("Sync pass started: {} due entries", due.len());

        for batch in due.chunks(self.config.batch_size.max(1)) {
            if !self.is_online() {
                tracing::info!("went offline, stopping sync pass");
                break;
            }
            let results = join_all(batch.iter().map(|id| self.send_entry(id))).await;
            for sent in results.into_iter().flatten() {
                report.attempted += 1;
                if sent {
                    report.sent += 1;
                } else {
                    report.failed += 1;
                }
            }
            self.emit().await;
        }
        tracing::info!(
            "Sync pass finished: {} sent, {} failed",
            report.sent,
            report.failed
        );
        report
    }

    /// Attempt one entry. `None` if it was not pending (already claimed,
    /// sent, failed or gone).
    async fn send_entry(&self, id: &OutboxId) -> Option<bool> {
        let entry = {
            let mut entries = self.entries.lock().await;
            let entry = entries.iter_mut().find(|e| &e.id == id)?;
            if !entry.begin_send() {
                return None;
            }
            entry.clone()
        };
        self.persist_logged().await;

        let options = SendOptions {
            reply_to: entry.reply_to.clone(),
            attachments: entry.attachments.clone(),
            message_id: Some(entry.message_id()),
        };
        let result = self
            .mutations
            .append_message(
                &entry.conversation_id,
                &entry.sender_id,
                &entry.sender_name,
                &entry.text,
                options,
            )
            .await;

        let now = self.clock.now_ms();
        let sent = {
            let mut entries = self.entries.lock().await;
            let current = entries.iter_mut().find(|e| &e.id == id)?;
            match result {
                Ok(_) => {
                    current.mark_sent(now);
                    tracing::info!(outbox_id = %id, conversation_id = %entry.conversation_id, "outbox entry sent");
                    true
                }
                Err(e) => {
                    match current.record_failure(&e, self.config.max_retries, now) {
                        RetryDecision::Retry { delay, .. } => tracing::warn!(
                            outbox_id = %id,
                            attempt = current.retry_count,
                            error = %e,
                            "send failed, retrying in {}ms",
                            delay.as_millis()
                        ),
                        RetryDecision::GiveUp => tracing::error!(
                            outbox_id = %id,
                            attempts = current.retry_count,
                            error = %e,
                            "send failed permanently"
                        ),
                    }
                    false
                }
            }
        };
        self.persist_logged().await;
        if sent {
            self.schedule_removal(id.clone());
        }
        Some(sent)
    }

    fn spawn_send(&self, id: OutboxId) {
        let weak = self.me.clone();
        self.track(tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.send_entry(&id).await;
                inner.emit().await;
            }
        }));
    }

    fn schedule_removal(&self, id: OutboxId) {
        let weak = self.me.clone();
        let delay = self.config.sent_removal_delay();
        self.track(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let removed = {
                let mut entries = inner.entries.lock().await;
                let before = entries.len();
                entries.retain(|e| !(e.id == id && e.status == OutboxStatus::Sent));
                before != entries.len()
            };
            if removed {
                tracing::debug!(outbox_id = %id, "sent entry removed");
                inner.persist_logged().await;
                inner.emit().await;
            }
        }));
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn persist(&self) -> Result<(), ChatError> {
        // Held across the write so snapshots land in order
        let entries = self.entries.lock().await;
        let json = serde_json::to_string(&*entries)
            .map_err(|e| ChatError::storage(format!("failed to encode outbox: {}", e)))?;
        self.storage.set(&self.config.storage_key, &json).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "failed to persist outbox");
        }
    }

    async fn stats(&self) -> SyncStats {
        let counts = OutboxCounts::of(self.entries.lock().await.iter());
        let machine = *lock(&self.machine);
        SyncStats {
            pending: counts.pending,
            sending: counts.sending,
            sent: counts.sent,
            failed: counts.failed,
            is_online: machine.is_online(),
            is_syncing: machine.is_syncing(),
        }
    }

    async fn emit(&self) {
        let stats = self.stats().await;
        let listeners: Vec<SyncListener> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&stats);
        }
    }
}

impl<S: RemoteStore> OfflineOutbox<S> {
    /// Create an outbox. Nothing is loaded until [`OfflineOutbox::init`].
    pub fn new(
        mutations: Arc<MutationLayer<S>>,
        storage: Arc<dyn LocalStorage>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
        online: bool,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| OutboxInner {
            me: me.clone(),
            mutations,
            storage,
            clock,
            config,
            entries: tokio::sync::Mutex::new(Vec::new()),
            machine: Mutex::new(SyncMachine::new(online)),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    /// Load persisted entries, start the periodic sync timer and, when
    /// online, run a first pass.
    ///
    /// Entries persisted mid-send are reset to pending; entries already
    /// sent are dropped. Returns how many entries were loaded.
    pub async fn init(&self) -> Result<usize, ChatError> {
        let key = &self.inner.config.storage_key;
        let mut loaded: Vec<OfflineOutboxEntry> = match self.inner.storage.get(key).await? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unreadable outbox");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let mut recovered = 0;
        for entry in &mut loaded {
            if entry.recover_interrupted() {
                recovered += 1;
            }
        }
        loaded.retain(|e| e.status != OutboxStatus::Sent);
        let count = loaded.len();
        *self.inner.entries.lock().await = loaded;
        self.inner.persist().await?;
        tracing::info!(
            "Outbox loaded: {} entries ({} recovered from interrupted sends)",
            count,
            recovered
        );

        self.start_periodic_sync();
        self.inner.emit().await;
        if self.inner.is_online() {
            self.inner.drive(SyncEvent::SyncRequested).await;
        }
        Ok(count)
    }

    fn start_periodic_sync(&self) {
        let weak = Arc::downgrade(&self.inner);
        let every = self.inner.config.sync_interval();
        self.inner.track(tokio::spawn(async move {
            tracing::debug!("periodic sync started (interval: {}s)", every.as_secs());
            let mut timer = tokio::time::interval(every);
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.drive(SyncEvent::TimerTick).await;
            }
        }));
    }

    /// Persist a new outgoing message and try to send it right away when
    /// online. The entry id is also the id of the remote message.
    pub async fn enqueue(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        sender_name: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<OfflineOutboxEntry, ChatError> {
        let body = validate_body(
            self.inner.mutations.policy(),
            text,
            !options.attachments.is_empty(),
        )?;
        let now = self.inner.clock.now_ms();
        let entry = OfflineOutboxEntry::new(
            conversation_id.clone(),
            sender.clone(),
            sender_name,
            body,
            now,
        )
        .with_reply_to(options.reply_to)
        .with_attachments(options.attachments);

        self.inner.entries.lock().await.push(entry.clone());
        if let Err(e) = self.inner.persist().await {
            self.inner.entries.lock().await.retain(|x| x.id != entry.id);
            return Err(e);
        }
        tracing::info!(outbox_id = %entry.id, conversation_id = %conversation_id, "message queued");

        self.inner.emit().await;
        if self.inner.is_online() {
            self.inner.spawn_send(entry.id.clone());
        }
        Ok(entry)
    }

    /// Report a connectivity change. Coming online runs a full pass before
    /// this returns.
    pub async fn set_online(&self, online: bool) -> Option<PassReport> {
        tracing::info!(online, "connectivity changed");
        self.inner
            .drive(SyncEvent::ConnectivityChanged { online })
            .await
    }

    /// Follow a connectivity feed until it closes.
    pub fn spawn_connectivity_observer(&self, mut feed: watch::Receiver<bool>) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.track(tokio::spawn(async move {
            loop {
                let online = *feed.borrow_and_update();
                match weak.upgrade() {
                    Some(inner) => {
                        inner
                            .drive(SyncEvent::ConnectivityChanged { online })
                            .await;
                    }
                    None => break,
                }
                if feed.changed().await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Run a pass now, ignoring retry backoff. Fails when offline.
    ///
    /// If a pass is already running, returns without starting another.
    pub async fn force_sync(&self) -> Result<SyncStats, ChatError> {
        if !self.inner.is_online() {
            return Err(ChatError::transport("Cannot sync while offline"));
        }
        self.inner.drive(SyncEvent::SyncRequested).await;
        Ok(self.inner.stats().await)
    }

    /// Every entry still held locally, oldest first.
    pub async fn pending_messages(&self) -> Vec<OfflineOutboxEntry> {
        self.inner.entries.lock().await.clone()
    }

    /// Entries for one conversation, oldest first.
    pub async fn pending_for(&self, conversation_id: &ConversationId) -> Vec<OfflineOutboxEntry> {
        self.inner
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| &e.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Current counts and flags.
    pub async fn stats(&self) -> SyncStats {
        self.inner.stats().await
    }

    /// Call `listener` now and after every status change.
    pub async fn add_sync_listener(
        &self,
        listener: impl Fn(&SyncStats) + Send + Sync + 'static,
    ) -> SyncListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener: SyncListener = Arc::new(listener);
        lock(&self.inner.listeners).push((id, Arc::clone(&listener)));
        listener(&self.inner.stats().await);
        SyncListenerId(id)
    }

    /// Stop notifying a listener. Returns whether it was registered.
    pub fn remove_sync_listener(&self, id: SyncListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id.0);
        before != listeners.len()
    }

    /// Drop an entry the user gave up on. Entries being sent cannot be
    /// discarded.
    pub async fn discard(&self, id: &OutboxId) -> Result<(), ChatError> {
        {
            let mut entries = self.inner.entries.lock().await;
            let pos = entries
                .iter()
                .position(|e| &e.id == id)
                .ok_or_else(|| ChatError::not_found("Outbox entry"))?;
            if entries[pos].status == OutboxStatus::Sending {
                return Err(ChatError::conflict(
                    "This message is being sent and cannot be discarded",
                ));
            }
            entries.remove(pos);
        }
        self.inner.persist().await?;
        tracing::info!(outbox_id = %id, "outbox entry discarded");
        self.inner.emit().await;
        Ok(())
    }

    /// Resend a failed entry with a fresh retry budget.
    pub async fn retry(&self, id: &OutboxId) -> Result<(), ChatError> {
        {
            let mut entries = self.inner.entries.lock().await;
            let entry = entries
                .iter_mut()
                .find(|e| &e.id == id)
                .ok_or_else(|| ChatError::not_found("Outbox entry"))?;
            if !entry.reset_for_retry() {
                return Err(ChatError::conflict(
                    "Only pending or failed messages can be retried",
                ));
            }
        }
        self.inner.persist().await?;
        self.inner.emit().await;
        if self.inner.is_online() {
            self.inner.spawn_send(id.clone());
        }
        Ok(())
    }

    /// Stop timers, observers and pending removals.
    pub fn shutdown(&self) {
        let mut tasks = lock(&self.inner.tasks);
        for task in tasks.drain(..) {
            task.abort();
        }
        tracing::info!("outbox shut down");
    }
}
