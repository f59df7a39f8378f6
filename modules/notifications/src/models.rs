use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    /// Event that caused this notification; unique per template
    pub source_event_id: Uuid,
    pub template: String,
    pub channel: String,
    pub recipient_id: String,
    /// Business entity the notification is about, e.g. a subscription ID
    pub reference_id: String,
    pub body: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn queued(
        source_event_id: Uuid,
        template: &str,
        recipient_id: impl Into<String>,
        reference_id: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: None,
            source_event_id,
            template: template.to_string(),
            channel: "email".to_string(),
            recipient_id: recipient_id.into(),
            reference_id: reference_id.into(),
            body,
            status: "queued".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}
