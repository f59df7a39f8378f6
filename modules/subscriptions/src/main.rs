use event_bus::{BrokerClient, OutboxStatus, PgOutboxStore, Relay};
use subscriptions_rs::{config::Config, db};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        bus_type = ?config.bus.bus_type,
        relay_owner = %config.relay.owner,
        "Configuration loaded"
    );

    let pool = db::init_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations completed");

    let broker = BrokerClient::connect(&config.bus).await?;

    let outbox = PgOutboxStore::new(pool.clone());
    let failed = outbox.count_by_status(OutboxStatus::Failed).await?;
    if failed > 0 {
        tracing::warn!(failed, "Outbox has failed records awaiting operator requeue");
    }

    let relay = Relay::new(outbox, broker.clone(), config.relay.clone()).spawn();
    tracing::info!("Outbox relay started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    relay.shutdown().await;
    broker.close().await?;
    pool.close().await;

    tracing::info!("Subscriptions service stopped");
    Ok(())
}
