//! # parley-engine
//!
//! Async sync engine for Parley.
//!
//! This crate runs the pure rules of `parley-core` against a remote store
//! and local durable storage.
//!
//! ## Features
//!
//! - **Listener Pool**: one live stream per subscription key, shared by any
//!   number of UI consumers, torn down after a grace delay
//! - **Offline Outbox**: messages persisted locally before sending, drained
//!   in batches with exponential backoff
//! - **Atomic Mutations**: every edit, delete, reaction and pin re-validated
//!   inside a remote transaction
//! - **Store Abstraction**: pluggable remote store (in-memory, backend)
//!
//! ## Example
//!
//! ```ignore
//! use parley_engine::{ChatEngine, MemoryStore};
//!
//! let engine = ChatEngine::builder(Arc::new(MemoryStore::new())).build()?;
//! engine.init().await?;
//!
//! let id = engine.send(&conv, &me, "Me", "hello", Default::default()).await?;
//! engine.toggle_reaction(&conv, &id, &me, "👍").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod conversations;
pub mod engine;
pub mod local;
pub mod mutations;
pub mod outbox;
pub mod pool;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    AnalyticsEvent, AnalyticsSink, Encryptor, PushNotifier, PushSummary,
    UNDECRYPTABLE_PLACEHOLDER,
};
pub use config::{ConfigError, EngineConfig, MessagesConfig, OutboxConfig, PoolConfig};
pub use conversations::{ConversationStore, TYPING_TTL};
pub use engine::{ChatEngine, ChatEngineBuilder};
pub use local::{FileStorage, LocalStorage, MemoryStorage};
pub use mutations::{ForwardFailure, ForwardReport, MutationLayer, SendOptions};
pub use outbox::{OfflineOutbox, PassReport, SyncListenerId, SyncStats};
pub use pool::{ListenerHandle, ListenerKey, ListenerPool, PoolStats, Snapshot};
pub use store::{MemoryStore, RemoteStore, StoreError, Transaction, WatchEvent, WatchQuery};
