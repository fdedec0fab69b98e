//! Offline-send demo against the in-memory store.
//!
//! Queues a message while offline, persists it under the data directory,
//! reconnects and prints each status change as the outbox drains.

use anyhow::{Context, Result};
use parley_engine::{ChatEngine, EngineConfig, FileStorage, MemoryStore, SendOptions, SyncStats};
use parley_types::{Identity, UserId};
use std::path::Path;
use std::sync::Arc;

fn identity(uid: &str, name: &str) -> Identity {
    Identity {
        uid: UserId::new(uid),
        display_name: name.to_string(),
        avatar: None,
    }
}

fn describe(stats: &SyncStats) -> String {
    format!(
        "{} | {} pending, {} sending, {} sent, {} failed{}",
        if stats.is_online { "online " } else { "offline" },
        stats.pending,
        stats.sending,
        stats.sent,
        stats.failed,
        if stats.is_syncing { " (syncing)" } else { "" }
    )
}

/// Run the demo. Returns the final outbox stats.
pub async fn run(data_dir: &Path, config: EngineConfig, text: &str) -> Result<SyncStats> {
    let removal_delay = config.outbox.sent_removal_delay();
    let store = Arc::new(MemoryStore::new());
    let engine = ChatEngine::builder(Arc::clone(&store))
        .config(config)
        .local_storage(Arc::new(FileStorage::new(data_dir)))
        .online(false)
        .build()?;
    engine.init().await?;

    let alice = identity("alice", "Alice");
    let bob = identity("bob", "Bob");
    let conversation = engine.create_direct(&alice, &bob).await?;
    println!("Conversation {} created", conversation.id);

    engine
        .add_sync_listener(|stats| println!("  [sync] {}", describe(stats)))
        .await;

    println!("Queueing \"{}\" while offline", text);
    let id = engine
        .queue_offline(&conversation.id, &alice.uid, &alice.display_name, text, SendOptions::default())
        .await?;
    println!("Queued as {}", id);

    println!("Reconnecting");
    engine.set_online(true).await;

    let updated = store
        .conversation(&conversation.id)
        .context("Conversation disappeared")?;
    match &updated.last_message {
        Some(last) => println!("Last message: \"{}\" from {}", last.text, last.sender_id),
        None => println!("Last message: (none)"),
    }
    println!("Unread for {}: {}", bob.display_name, updated.unread_for(&bob.uid));

    // Let the delivered entry leave the outbox
    tokio::time::sleep(removal_delay + std::time::Duration::from_millis(50)).await;
    let stats = engine.sync_stats().await;
    println!("Final: {}", describe(&stats));

    engine.shutdown();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::outbox;
    use tempfile::tempdir;

    fn quick_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.outbox.sent_removal_delay_ms = 10;
        config
    }

    #[tokio::test]
    async fn demo_drains_the_outbox() {
        let dir = tempdir().unwrap();

        let stats = run(dir.path(), quick_config(), "hello").await.unwrap();

        assert_eq!(stats.pending, 0);
        assert_eq!(stats.sent, 0);
        assert!(stats.is_online);
        let left = outbox::load(dir.path(), &quick_config()).await.unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn demo_rejects_empty_text() {
        let dir = tempdir().unwrap();
        assert!(run(dir.path(), quick_config(), "   ").await.is_err());
    }

    #[test]
    fn describe_shows_flags() {
        let stats = SyncStats {
            pending: 2,
            is_syncing: true,
            ..SyncStats::default()
        };
        let line = describe(&stats);
        assert!(line.starts_with("offline"));
        assert!(line.contains("2 pending"));
        assert!(line.ends_with("(syncing)"));
    }
}
