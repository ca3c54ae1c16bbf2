use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};

use crate::{
    models::{
        batch::NewEmailBatch,
        message::EnqueueResult,
        queue::{DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, NewQueueItem},
        recipient::{RecipientListKind, RecipientPreview},
        rule::NotificationRule,
        template::DEFAULT_CATEGORY,
    },
    services::{resolver::RecipientResolver, rules::RuleEngine},
    store::{QueueStore, RecipientListStore, TemplateStore},
};

pub const URGENT_PRIORITY: i32 = 1;
pub const ELEVATED_PRIORITY: i32 = 3;

/// Priority for rows of `event_type` when the rule does not pin one.
/// Lower numbers are claimed first.
pub fn derive_priority(event_type: &str, payload: &JsonValue) -> i32 {
    let compulsory = payload
        .get("compulsory")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let urgent = payload
        .get("priority")
        .and_then(JsonValue::as_str)
        .is_some_and(|p| p.eq_ignore_ascii_case("urgent") || p.eq_ignore_ascii_case("high"));

    if compulsory || urgent || event_type == "password_reset" || event_type.starts_with("account_")
    {
        return URGENT_PRIORITY;
    }

    if event_type.starts_with("referral_")
        || event_type.ends_with("_registration")
        || event_type == "user_registered"
    {
        return ELEVATED_PRIORITY;
    }

    DEFAULT_PRIORITY
}

fn row_tags(event_type: &str, rule: &NotificationRule) -> Vec<String> {
    let mut tags = vec![event_type.to_string()];
    for tag in &rule.tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    tags
}

/// Turns one publish transition into queue rows.
pub struct Enqueuer {
    rules: Arc<RuleEngine>,
    lists: Arc<dyn RecipientListStore>,
    templates: Arc<dyn TemplateStore>,
    resolver: Arc<RecipientResolver>,
    queue: Arc<dyn QueueStore>,
    max_attempts: i32,
}

impl Enqueuer {
    pub fn new(
        rules: Arc<RuleEngine>,
        lists: Arc<dyn RecipientListStore>,
        templates: Arc<dyn TemplateStore>,
        resolver: Arc<RecipientResolver>,
        queue: Arc<dyn QueueStore>,
    ) -> Self {
        Self {
            rules,
            lists,
            templates,
            resolver,
            queue,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1) as i32;
        self
    }

    /// Queue one row per resolved recipient of the rule bound to `event_type`.
    ///
    /// Missing configuration (no rule, unknown list, nobody to send to) yields
    /// a zero count. Rows are written in one unit: the call either queues all
    /// of them or fails as a whole.
    pub async fn enqueue(
        &self,
        event_type: &str,
        event_id: Option<&str>,
        payload: JsonValue,
    ) -> Result<EnqueueResult> {
        let Some(rule) = self.rules.rule_for(event_type).await? else {
            debug!(event_type, "No enabled notification rule, nothing to enqueue");
            return Ok(EnqueueResult::default());
        };

        let Some(list) = self.lists.get_list(rule.recipient_list_id).await? else {
            warn!(
                event_type,
                list_id = %rule.recipient_list_id,
                "Rule points at a missing recipient list"
            );
            return Ok(EnqueueResult::default());
        };

        let category = self.category_of(&rule.template_id).await?;
        let payload = if payload.is_null() { json!({}) } else { payload };

        let recipients = self
            .resolver
            .resolve(&list, &payload, &category)
            .await
            .map_err(|e| anyhow!("Failed to resolve recipients for '{}': {}", event_type, e))?;

        if recipients.is_empty() {
            info!(event_type, event_id, list = %list.code, "No recipients resolved");
            return Ok(EnqueueResult::default());
        }

        let priority = rule
            .priority
            .unwrap_or_else(|| derive_priority(event_type, &payload));
        let tags = row_tags(event_type, &rule);
        let now = Utc::now();

        let items: Vec<NewQueueItem> = recipients
            .into_iter()
            .map(|recipient| {
                NewQueueItem::new(event_type, recipient.email)
                    .with_event_id(event_id.map(str::to_string))
                    .with_template(Some(rule.template_id.clone()))
                    .with_user(recipient.user_id)
                    .with_payload(payload.clone())
                    .with_priority(priority)
                    .with_max_attempts(self.max_attempts)
                    .scheduled_at(now)
                    .with_tags(tags.clone())
            })
            .collect();

        let resolved = items.len();
        let inserted = self
            .queue
            .insert_batch(
                NewEmailBatch {
                    notification_type: event_type.to_string(),
                    event_id: event_id.map(str::to_string),
                },
                items,
            )
            .await?;

        if inserted.inserted < resolved {
            warn!(
                event_type,
                event_id,
                skipped = resolved - inserted.inserted,
                "Skipped recipients already queued for this event"
            );
        }

        info!(
            event_type,
            event_id,
            batch_id = %inserted.batch_id,
            queued = inserted.inserted,
            priority,
            "Emails enqueued"
        );

        Ok(EnqueueResult {
            queued_count: inserted.inserted,
            batch_id: Some(inserted.batch_id),
        })
    }

    /// Who the rule for `event_type` would address right now, without a payload.
    pub async fn preview(&self, event_type: &str) -> Result<RecipientPreview> {
        let empty = RecipientPreview {
            list_code: None,
            kind: None,
            accurate: true,
            recipients: Vec::new(),
        };

        let Some(rule) = self.rules.rule_for(event_type).await? else {
            return Ok(empty);
        };
        let Some(list) = self.lists.get_list(rule.recipient_list_id).await? else {
            return Ok(empty);
        };

        if list.kind == RecipientListKind::Dynamic {
            return Ok(RecipientPreview {
                list_code: Some(list.code),
                kind: Some(list.kind),
                accurate: false,
                recipients: Vec::new(),
            });
        }

        let category = self.category_of(&rule.template_id).await?;
        let recipients = self.resolver.resolve(&list, &json!({}), &category).await?;

        Ok(RecipientPreview {
            list_code: Some(list.code),
            kind: Some(list.kind),
            accurate: list.kind != RecipientListKind::Custom,
            recipients,
        })
    }

    async fn category_of(&self, template_id: &str) -> Result<String> {
        Ok(self
            .templates
            .get_template(template_id)
            .await?
            .map(|template| template.category)
            .filter(|category| !category.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()))
    }
}
