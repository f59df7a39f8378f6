//! `identity.*` payloads

use chrono::{DateTime, Utc};
use event_bus::EventPayload;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminLoggedInV1 {
    #[serde(rename = "adminID")]
    pub admin_id: String,
    #[serde(rename = "loggedInAt")]
    pub logged_in_at: DateTime<Utc>,
    #[serde(rename = "ipAddress", default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(rename = "userAgent", default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl EventPayload for AdminLoggedInV1 {
    const EVENT_TYPE: &'static str = "identity.admin.logged_in";
    const SCHEMA_VERSION: u32 = 1;
    const AGGREGATE_TYPE: &'static str = "admin";

    fn aggregate_id(&self) -> String {
        self.admin_id.clone()
    }

    fn validate(&self) -> Result<(), String> {
        if self.admin_id.trim().is_empty() {
            return Err("adminID cannot be empty".to_string());
        }
        Ok(())
    }
}
