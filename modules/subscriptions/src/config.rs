use event_bus::config::BusConfig;
use event_bus::RelayConfig;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus: BusConfig,
    pub relay: RelayConfig,
    /// Name stamped as `producer` on every envelope
    pub producer: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let bus = BusConfig::from_env()?;
        let mut relay = RelayConfig::from_env()?;
        // One prefix for the whole deployment
        relay.subject_prefix = bus.subject_prefix.clone();

        Ok(Self {
            database_url,
            bus,
            relay,
            producer: env::var("SERVICE_NAME").unwrap_or_else(|_| "subscriptions".to_string()),
        })
    }
}
