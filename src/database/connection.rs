use mongodb::{bson::doc, Client, Database};
use std::sync::Arc;
use tracing::{info, warn};

use super::ledger::TransactionLedger;
use super::memory_ledger::MemoryLedger;
use super::mongo_ledger::MongoLedger;
use crate::config::AppConfig;
use crate::errors::Result;

pub async fn get_db_client(database_url: &str, db_name: &str) -> Result<Database> {
    let client = Client::with_uri_str(database_url).await?;
    let db = client.database(db_name);

    db.run_command(doc! { "ping": 1 }).await?;
    info!(database = db_name, "✅ Connected to MongoDB");

    Ok(db)
}

/// MongoDB when `DATABASE_URL` is set, otherwise a process-local ledger.
pub async fn open_ledger(config: &AppConfig) -> Result<Arc<dyn TransactionLedger>> {
    match &config.database_url {
        Some(url) => {
            let db = get_db_client(url, &config.database_name).await?;
            let ledger = MongoLedger::new(db);
            ledger.ensure_indexes().await?;
            Ok(Arc::new(ledger))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory ledger; transactions will not survive a restart");
            Ok(Arc::new(MemoryLedger::new()))
        }
    }
}
