//! `billing.subscription.*` payloads, produced by the subscriptions service

use chrono::{DateTime, Utc};
use event_bus::EventPayload;
use serde::{Deserialize, Serialize};

pub const SUBSCRIPTION_AGGREGATE: &str = "subscription";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionCreatedV1 {
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    #[serde(rename = "coachID")]
    pub coach_id: String,
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "planID", default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Recurring price in minor units
    #[serde(rename = "priceMinor", default, skip_serializing_if = "Option::is_none")]
    pub price_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl EventPayload for SubscriptionCreatedV1 {
    const EVENT_TYPE: &'static str = "billing.subscription.created";
    const SCHEMA_VERSION: u32 = 1;
    const AGGREGATE_TYPE: &'static str = SUBSCRIPTION_AGGREGATE;

    fn aggregate_id(&self) -> String {
        self.subscription_id.clone()
    }

    fn validate(&self) -> Result<(), String> {
        if self.subscription_id.trim().is_empty() {
            return Err("subscriptionID cannot be empty".to_string());
        }
        if self.coach_id.trim().is_empty() {
            return Err("coachID cannot be empty".to_string());
        }
        if matches!(self.price_minor, Some(p) if p < 0) {
            return Err("priceMinor cannot be negative".to_string());
        }
        if let Some(currency) = &self.currency {
            if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(format!("currency '{}' is not an ISO 4217 code", currency));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionCancelledV1 {
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    #[serde(rename = "coachID")]
    pub coach_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(rename = "cancelledAt")]
    pub cancelled_at: DateTime<Utc>,
}

impl EventPayload for SubscriptionCancelledV1 {
    const EVENT_TYPE: &'static str = "billing.subscription.cancelled";
    const SCHEMA_VERSION: u32 = 1;
    const AGGREGATE_TYPE: &'static str = SUBSCRIPTION_AGGREGATE;

    fn aggregate_id(&self) -> String {
        self.subscription_id.clone()
    }

    fn validate(&self) -> Result<(), String> {
        if self.subscription_id.trim().is_empty() {
            return Err("subscriptionID cannot be empty".to_string());
        }
        Ok(())
    }
}
