use event_bus::BrokerClient;
use event_consumer::{
    BusDeadLetterSink, DeadLetterSink, FanoutDeadLetterSink, PgDeadLetterStore, PgLedger,
};
use notifications_rs::{
    build_runtime, config::Config, config::CONSUMER_NAME, db, PgNotificationRepository,
};
use std::sync::Arc;
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
        partitions = config.consumer.partitions,
        max_attempts = config.consumer.max_attempts,
        "Configuration loaded"
    );

    let pool = db::init_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations completed");

    let broker = BrokerClient::connect(&config.bus).await?;

    let store: Arc<dyn DeadLetterSink> = Arc::new(PgDeadLetterStore::new(pool.clone()));
    let dlq: Arc<dyn DeadLetterSink> = if config.publish_dead_letters {
        Arc::new(FanoutDeadLetterSink::new(vec![
            store,
            Arc::new(BusDeadLetterSink::new(broker.clone())),
        ]))
    } else {
        store
    };

    let runtime = build_runtime(
        &config,
        broker.clone(),
        Arc::new(PgLedger::new(pool.clone())),
        dlq,
        Arc::new(PgNotificationRepository::new(pool.clone(), CONSUMER_NAME)),
    );
    let handle = runtime.start().await?;
    tracing::info!("Notification consumers started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    handle.shutdown().await;
    broker.close().await?;
    pool.close().await;

    tracing::info!("Notifications service stopped");
    Ok(())
}
