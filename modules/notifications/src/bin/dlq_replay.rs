//! Republish dead-lettered notification events
//!
//! ```text
//! dlq_replay                 # replay up to DLQ_REPLAY_LIMIT pending letters
//! dlq_replay <event-id>      # replay a single letter
//! ```

use event_bus::config::{env_parse, BusConfig};
use event_bus::BrokerClient;
use event_consumer::{DeadLetterReplayer, PgDeadLetterStore};
use notifications_rs::{config::CONSUMER_NAME, db};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let database_url = std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?;
    let limit: i64 = env_parse("DLQ_REPLAY_LIMIT", 100)?;
    let target = std::env::args().nth(1).map(|raw| Uuid::parse_str(&raw)).transpose()?;

    let pool = db::init_pool(&database_url).await?;
    let broker = BrokerClient::connect(&BusConfig::from_env()?).await?;
    let replayer = DeadLetterReplayer::new(Arc::new(PgDeadLetterStore::new(pool.clone())), broker.clone());

    match target {
        Some(event_id) => {
            replayer.replay(event_id, CONSUMER_NAME).await?;
            tracing::info!(event_id = %event_id, "Replayed dead letter");
        }
        None => {
            let replayed = replayer.replay_pending(CONSUMER_NAME, limit).await?;
            tracing::info!(replayed, "Replayed pending dead letters");
        }
    }

    broker.close().await?;
    pool.close().await;
    Ok(())
}
