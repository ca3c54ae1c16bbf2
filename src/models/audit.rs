use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::status::DeliveryStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailLog {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub event_type: String,
    pub to_email: String,
    pub template_id: Option<String>,
    pub status: DeliveryStatus,
    pub attempt: i32,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateEmailLog {
    pub queue_id: Uuid,
    pub event_type: String,
    pub to_email: String,
    pub template_id: Option<String>,
    pub status: DeliveryStatus,
    pub attempt: i32,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub metadata: JsonValue,
}

impl CreateEmailLog {
    pub fn new(
        queue_id: Uuid,
        event_type: String,
        to_email: String,
        template_id: Option<String>,
        status: DeliveryStatus,
        attempt: i32,
    ) -> Self {
        Self {
            queue_id,
            event_type,
            to_email,
            template_id,
            status,
            attempt,
            provider_message_id: None,
            error_message: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_provider_id(mut self, provider_message_id: String) -> Self {
        self.provider_message_id = Some(provider_message_id);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error_message = Some(error);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}
