//! Watch one record and set a field on it.
//!
//! ```text
//! cargo run --example record_watch -- ws://127.0.0.1:3000/socket tbl1 rec1 status done
//! ```

use otsync::{EngineConfig, JsonFileHistoryStore, SyncEngine};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| EngineConfig::default().url);
    let table_id = args.next().unwrap_or_else(|| "tbl1".to_string());
    let record_id = args.next().unwrap_or_else(|| "rec1".to_string());
    let field = args.next();
    let value = args.next();

    let engine = SyncEngine::connect(EngineConfig::new(url))?;
    engine.wait_ready(Duration::from_secs(10)).await?;

    let store = JsonFileHistoryStore::new("otsync-history.json");
    if engine.restore_history(&store).await? {
        let restored = engine.history().lock().map(|history| history.len()).unwrap_or(0);
        info!("Restored {} history entries", restored);
    }

    let records = engine.records(&table_id);
    let mut updates = records.subscribe(&record_id);
    let record = records.fetch(&record_id).await?;
    info!("Record {} at version {}: {}", record_id, record.version(), record.data());

    let presence = engine.presence(&table_id, None);
    presence.initialize().await?;

    if let (Some(field), Some(value)) = (field, value) {
        let value = serde_json::from_str(&value).unwrap_or(JsonValue::String(value));
        presence.update_active_cell(&record_id, &field).await;
        let outcome = records.update_field(&record_id, &field, value).await?;
        info!("Update of {} finished: {:?}", field, outcome);
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                for (path, value) in &update.changes {
                    info!("v{} {} = {}", update.version, path, value);
                }
                let others = presence.get_active_users();
                if !others.is_empty() {
                    info!("{} other users here", others.len());
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    presence.destroy().await;
    if let Err(e) = engine.persist_history(&store).await {
        warn!("Could not save history: {}", e);
    }
    engine.shutdown();
    Ok(())
}
