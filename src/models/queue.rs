use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::status::QueueStatus;

pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// One obligation to send a single email to a single recipient for a single event.
///
/// `event_payload` is a snapshot taken at enqueue time; nothing is re-joined at
/// send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailQueueItem {
    pub id: Uuid,
    pub event_type: String,
    pub event_id: Option<String>,
    pub template_id: Option<String>,
    pub to_email: String,
    pub to_user_id: Option<Uuid>,
    pub event_payload: JsonValue,
    pub status: QueueStatus,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_for: DateTime<Utc>,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub batch_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailQueueItem {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Row as built by the enqueuer, before the store assigns identity and timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct NewQueueItem {
    pub event_type: String,
    pub event_id: Option<String>,
    pub template_id: Option<String>,
    pub to_email: String,
    pub to_user_id: Option<Uuid>,
    pub event_payload: JsonValue,
    pub priority: i32,
    pub max_attempts: i32,
    pub scheduled_for: DateTime<Utc>,
    pub tags: Vec<String>,
}

impl NewQueueItem {
    pub fn new(event_type: impl Into<String>, to_email: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: None,
            template_id: None,
            to_email: to_email.into(),
            to_user_id: None,
            event_payload: serde_json::json!({}),
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_for: Utc::now(),
            tags: Vec::new(),
        }
    }

    pub fn with_event_id(mut self, event_id: Option<String>) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_template(mut self, template_id: Option<String>) -> Self {
        self.template_id = template_id;
        self
    }

    pub fn with_user(mut self, user_id: Option<Uuid>) -> Self {
        self.to_user_id = user_id;
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.event_payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn scheduled_at(mut self, scheduled_for: DateTime<Utc>) -> Self {
        self.scheduled_for = scheduled_for;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Key used to skip a second row for the same event, recipient and template.
    pub fn dedupe_key(&self) -> Option<(String, String, String, String)> {
        self.event_id.as_ref().map(|event_id| {
            (
                self.event_type.clone(),
                event_id.clone(),
                self.to_email.to_lowercase(),
                self.template_id.clone().unwrap_or_default(),
            )
        })
    }
}
