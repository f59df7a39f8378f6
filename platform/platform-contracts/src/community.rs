//! `community.*` payloads

use event_bus::EventPayload;
use serde::{Deserialize, Serialize};

/// A message posted to a coaching thread; ordered per thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSentV1 {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "threadID")]
    pub thread_id: String,
    #[serde(rename = "senderID")]
    pub sender_id: String,
    #[serde(rename = "bodyPreview", default, skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
}

impl EventPayload for MessageSentV1 {
    const EVENT_TYPE: &'static str = "community.message.sent";
    const SCHEMA_VERSION: u32 = 1;
    const AGGREGATE_TYPE: &'static str = "thread";

    fn aggregate_id(&self) -> String {
        self.thread_id.clone()
    }

    fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("messageID", &self.message_id),
            ("threadID", &self.thread_id),
            ("senderID", &self.sender_id),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} cannot be empty", field));
            }
        }
        if matches!(&self.body_preview, Some(p) if p.chars().count() > 280) {
            return Err("bodyPreview exceeds 280 characters".to_string());
        }
        Ok(())
    }
}
