//! Environment-driven configuration for the broker client and relay

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub bus_type: BusType,
    pub nats_url: Option<String>,
    /// Upper bound on waiting for a broker publish ack
    pub publish_timeout: Duration,
    /// First subject token, events land on `<prefix>.<routing_key>`
    pub subject_prefix: String,
    /// Broker-side ordering partitions; must match across producers and consumers
    pub partitions: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_type: BusType::InMemory,
            nats_url: None,
            publish_timeout: Duration::from_secs(5),
            subject_prefix: "events".to_string(),
            partitions: 8,
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();

        let nats_url = match bus_type {
            BusType::Nats => Some(
                env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            ),
            BusType::InMemory => None,
        };

        let partitions = env_parse("EVENT_PARTITIONS", 8u32)?;
        if partitions == 0 {
            return Err("EVENT_PARTITIONS must be > 0".to_string());
        }

        Ok(Self {
            bus_type,
            nats_url,
            publish_timeout: env_millis("BUS_PUBLISH_TIMEOUT_MS", 5_000)?,
            subject_prefix: env::var("EVENT_SUBJECT_PREFIX")
                .unwrap_or_else(|_| "events".to_string()),
            partitions,
        })
    }
}

/// Parse an env var, falling back to `default` when unset
pub fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

/// Read a millisecond duration from an env var
pub fn env_millis(name: &str, default_ms: u64) -> Result<Duration, String> {
    env_parse(name, default_ms).map(Duration::from_millis)
}
