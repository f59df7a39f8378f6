use event_bus::config::{env_millis, BusConfig};
use event_consumer::ConsumerConfig;
use std::env;
use std::time::Duration;

pub const CONSUMER_NAME: &str = "notifications";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus: BusConfig,
    pub consumer: ConsumerConfig,
    /// Upper bound on one handler attempt before it counts as a transient failure
    pub handler_timeout: Duration,
    /// Mirror dead letters onto `dlq.notifications.<kind>` as well as the table
    pub publish_dead_letters: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        Ok(Self {
            database_url,
            bus: BusConfig::from_env()?,
            consumer: ConsumerConfig::from_env(CONSUMER_NAME).map_err(|e| e.to_string())?,
            handler_timeout: env_millis("NOTIFICATIONS_HANDLER_TIMEOUT_MS", 10_000)?,
            publish_dead_letters: env::var("DLQ_PUBLISH")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }
}
