use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Binding of an event type to a template and a recipient list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: Uuid,
    pub event_type: String,
    pub template_id: String,
    pub recipient_list_id: Uuid,
    pub enabled: bool,
    /// Overrides the priority derived from the event type.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRule {
    pub fn new(
        event_type: impl Into<String>,
        template_id: impl Into<String>,
        recipient_list_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            template_id: template_id.into(),
            recipient_list_id,
            enabled: true,
            priority: None,
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Body of the rule endpoint. Supplying `id` replaces an existing rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleRequest {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub event_type: String,
    pub template_id: String,
    pub recipient_list_id: Uuid,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl RuleRequest {
    pub fn into_rule(self) -> NotificationRule {
        let mut rule = NotificationRule::new(self.event_type, self.template_id, self.recipient_list_id);
        if let Some(id) = self.id {
            rule.id = id;
        }
        rule.enabled = self.enabled;
        rule.priority = self.priority;
        rule.tags = self.tags;
        rule
    }
}
