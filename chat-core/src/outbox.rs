//! Offline outbox entries.
//!
//! An entry is a locally persisted request to append one message. It moves
//! through `Pending -> Sending -> {Sent | Pending (retry) | Failed}`:
//! - `begin_send()` claims a pending entry so two passes never send it twice
//! - `mark_sent()` records delivery; the engine removes the entry later
//! - `record_failure()` counts the attempt and decides retry vs give up
//!
//! The entry id doubles as the remote message id, so a retry after a lost
//! acknowledgement appends nothing new.

use parley_types::{
    Attachment, ChatError, ConversationId, MessageId, OutboxId, ReplyRef, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for the next sync pass.
    Pending,
    /// Claimed by a pass, append in flight.
    Sending,
    /// Delivered; removed after a grace delay.
    Sent,
    /// Gave up; kept until the user retries or discards it.
    Failed,
}

/// A message creation request that survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineOutboxEntry {
    /// Locally generated id, reused as the message id.
    pub id: OutboxId,
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Sender.
    pub sender_id: UserId,
    /// Sender display name.
    pub sender_name: String,
    /// Body text.
    pub text: String,
    /// When the user hit send.
    pub created_at: Timestamp,
    /// Lifecycle status.
    pub status: OutboxStatus,
    /// Failed attempts so far (never above the configured maximum).
    pub retry_count: u32,
    /// Correlates the entry with the placeholder the UI shows.
    pub optimistic_id: String,
    /// Reply back-reference.
    #[serde(default)]
    pub reply_to: Option<ReplyRef>,
    /// Attachments.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Reason of the latest failure.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time a periodic pass may try again.
    #[serde(default)]
    pub next_attempt_at: Option<Timestamp>,
    /// When delivery succeeded.
    #[serde(default)]
    pub sent_at: Option<Timestamp>,
}

/// What happens after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending; eligible again at `at`.
    Retry {
        /// Backoff applied.
        delay: Duration,
        /// Wall-clock time the entry becomes due.
        at: Timestamp,
    },
    /// Moved to failed; no automatic retries.
    GiveUp,
}

impl OfflineOutboxEntry {
    /// Create a pending entry with a fresh id.
    pub fn new(
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: impl Into<String>,
        text: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        let id = OutboxId::generate();
        Self {
            optimistic_id: format!("optimistic-{}", id),
            id,
            conversation_id,
            sender_id,
            sender_name: sender_name.into(),
            text: text.into(),
            created_at: now,
            status: OutboxStatus::Pending,
            retry_count: 0,
            reply_to: None,
            attachments: Vec::new(),
            last_error: None,
            next_attempt_at: None,
            sent_at: None,
        }
    }

    /// Attach a reply reference.
    pub fn with_reply_to(mut self, reply_to: Option<ReplyRef>) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// Attach files.
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Remote message id this entry appends.
    pub fn message_id(&self) -> MessageId {
        self.id.message_id()
    }

    /// Whether a pass should pick this entry up now.
    ///
    /// Only pending entries are due. Periodic passes also wait out the
    /// retry backoff; forced passes ignore it.
    pub fn is_due(&self, now: Timestamp, respect_backoff: bool) -> bool {
        if self.status != OutboxStatus::Pending {
            return false;
        }
        !respect_backoff || self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Claim a pending entry for sending. Returns false if it was not pending.
    pub fn begin_send(&mut self) -> bool {
        if self.status != OutboxStatus::Pending {
            return false;
        }
        self.status = OutboxStatus::Sending;
        true
    }

    /// Record a successful append.
    pub fn mark_sent(&mut self, now: Timestamp) {
        self.status = OutboxStatus::Sent;
        self.sent_at = Some(now);
        self.last_error = None;
        self.next_attempt_at = None;
    }

    /// Record a failed attempt.
    ///
    /// Transport errors go back to pending until `max_retries` attempts have
    /// failed. Any other error cannot succeed on retry and fails the entry
    /// immediately.
    pub fn record_failure(
        &mut self,
        error: &ChatError,
        max_retries: u32,
        now: Timestamp,
    ) -> RetryDecision {
        self.retry_count = self.retry_count.saturating_add(1).min(max_retries);
        self.last_error = Some(error.to_string());

        if !error.is_retryable() || self.retry_count >= max_retries {
            self.status = OutboxStatus::Failed;
            self.next_attempt_at = None;
            return RetryDecision::GiveUp;
        }

        let delay = retry_delay(self.retry_count);
        let at = now.saturating_add(delay.as_millis() as i64);
        self.status = OutboxStatus::Pending;
        self.next_attempt_at = Some(at);
        RetryDecision::Retry { delay, at }
    }

    /// User-initiated resend. Returns false for sending or sent entries.
    pub fn reset_for_retry(&mut self) -> bool {
        match self.status {
            OutboxStatus::Pending | OutboxStatus::Failed => {
                self.status = OutboxStatus::Pending;
                self.retry_count = 0;
                self.last_error = None;
                self.next_attempt_at = None;
                true
            }
            OutboxStatus::Sending | OutboxStatus::Sent => false,
        }
    }

    /// Entries persisted mid-send did not finish; make them pending again.
    pub fn recover_interrupted(&mut self) -> bool {
        if self.status == OutboxStatus::Sending {
            self.status = OutboxStatus::Pending;
            true
        } else {
            false
        }
    }
}

/// Per-status counts over a set of entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    /// Pending entries.
    pub pending: usize,
    /// Entries being sent.
    pub sending: usize,
    /// Sent entries not yet removed.
    pub sent: usize,
    /// Failed entries.
    pub failed: usize,
}

impl OutboxCounts {
    /// Count `entries` by status.
    pub fn of<'a>(entries: impl IntoIterator<Item = &'a OfflineOutboxEntry>) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match entry.status {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Sending => counts.sending += 1,
                OutboxStatus::Sent => counts.sent += 1,
                OutboxStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// Backoff before retry `attempt` (1-based).
///
/// Formula: min(30s, 2^attempt seconds) + random(0..=1000ms)
pub fn retry_delay(attempt: u32) -> Duration {
    base_delay(attempt) + Duration::from_millis(random_jitter_ms())
}

fn base_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt.min(5)).min(30))
}

/// Random jitter between 0 and 1000 milliseconds; 0 if the OS RNG fails.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % 1001,
        Err(_) => 0,
    }
}
