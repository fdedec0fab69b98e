//! Message history pagination.
//!
//! History pages walk backwards in time from a cursor. The cursor is the
//! `(timestamp, id)` pair of the last message returned, so pages stay stable
//! when several messages share a timestamp or new ones arrive meanwhile.
//! Deleted messages never appear: neither tombstones nor messages the
//! viewer hid for themselves.

use parley_types::{Message, MessageId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Position just after the oldest message of a page.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryCursor {
    /// Timestamp of the boundary message.
    pub timestamp: Timestamp,
    /// Id of the boundary message.
    pub message_id: MessageId,
}

impl HistoryCursor {
    /// Cursor positioned at `message`.
    pub fn at(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp,
            message_id: message.id.clone(),
        }
    }

    fn is_after(&self, message: &Message) -> bool {
        (message.timestamp, &message.id) < (self.timestamp, &self.message_id)
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    /// Messages in this page.
    pub messages: Vec<Message>,
    /// Cursor for the next (older) page; `None` when there is none.
    pub next_cursor: Option<HistoryCursor>,
}

impl HistoryPage {
    /// Whether older messages remain.
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

/// Build one page of up to `limit` messages older than `before`.
pub fn paginate(
    messages: impl IntoIterator<Item = Message>,
    viewer: &UserId,
    before: Option<&HistoryCursor>,
    limit: usize,
) -> HistoryPage {
    let limit = limit.max(1);
    let mut candidates: Vec<Message> = messages
        .into_iter()
        .filter(|m| !m.is_deleted && m.is_visible_to(viewer))
        .filter(|m| before.map_or(true, |c| c.is_after(m)))
        .collect();
    candidates.sort_by(|a, b| (b.timestamp, &b.id).cmp(&(a.timestamp, &a.id)));

    let has_more = candidates.len() > limit;
    candidates.truncate(limit);
    let next_cursor = if has_more {
        candidates.last().map(HistoryCursor::at)
    } else {
        None
    };
    HistoryPage {
        messages: candidates,
        next_cursor,
    }
}
