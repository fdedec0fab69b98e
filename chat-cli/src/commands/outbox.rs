//! List persisted outbox entries.

use anyhow::{Context, Result};
use parley_core::{OfflineOutboxEntry, OutboxCounts};
use parley_engine::{EngineConfig, FileStorage, LocalStorage};
use std::path::Path;

/// Read the outbox persisted under `data_dir`.
pub async fn load(data_dir: &Path, config: &EngineConfig) -> Result<Vec<OfflineOutboxEntry>> {
    let storage = FileStorage::new(data_dir);
    let Some(json) = storage.get(&config.outbox.storage_key).await? else {
        return Ok(Vec::new());
    };
    serde_json::from_str(&json).context("Invalid outbox file")
}

/// Run the outbox command.
pub async fn run(data_dir: &Path, config: &EngineConfig) -> Result<()> {
    let entries = load(data_dir, config).await?;
    let counts = OutboxCounts::of(&entries);

    println!("Outbox ({})", data_dir.display());
    println!(
        "  {} pending, {} sending, {} sent, {} failed",
        counts.pending, counts.sending, counts.sent, counts.failed
    );
    if entries.is_empty() {
        println!("  (empty)");
        return Ok(());
    }
    println!();
    for entry in &entries {
        println!(
            "  {:<8} {}  to {}  retries {}  \"{}\"",
            format!("{:?}", entry.status).to_lowercase(),
            entry.id,
            entry.conversation_id,
            entry.retry_count,
            entry.text
        );
        if let Some(error) = &entry.last_error {
            println!("           last error: {}", error);
        }
    }
    Ok(())
}
