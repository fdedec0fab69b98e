//! # parley-core
//!
//! Pure logic for Parley (no I/O, instant tests).
//!
//! This crate implements the rules and state machines of the messaging
//! sync core without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! Every function here takes documents and a `now` timestamp and returns a
//! result or a new state. Nothing reads a clock, touches storage or logs.
//! This enables:
//! - Instant unit tests (no mocks, no async)
//! - The same rule running unchanged inside a remote transaction, where it
//!   may be re-executed against fresher state
//!
//! The I/O (remote store, local storage, timers) lives in `parley-engine`,
//! which interprets the results and actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod history;
pub mod listing;
pub mod mutation;
pub mod outbox;
pub mod reactions;
pub mod sync;

pub use aggregate::{GroupInfoUpdate, SettingsUpdate};
pub use history::{HistoryCursor, HistoryPage};
pub use mutation::MessagePolicy;
pub use outbox::{OfflineOutboxEntry, OutboxCounts, OutboxStatus, RetryDecision};
pub use reactions::ReactionChange;
pub use sync::{SyncAction, SyncEvent, SyncMachine};
