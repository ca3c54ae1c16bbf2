use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    models::rule::NotificationRule,
    store::{RuleStore, TemplateStore},
};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Rule event type cannot be empty")]
    MissingEventType,

    #[error("Template '{0}' does not exist")]
    UnknownTemplate(String),

    #[error("Template '{0}' is inactive and cannot be bound to a rule")]
    InactiveTemplate(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// The single point of configuration for "what gets sent to whom".
pub struct RuleEngine {
    rules: Arc<dyn RuleStore>,
    templates: Arc<dyn TemplateStore>,
}

impl RuleEngine {
    pub fn new(rules: Arc<dyn RuleStore>, templates: Arc<dyn TemplateStore>) -> Self {
        Self { rules, templates }
    }

    /// The enabled rule for `event_type`, if any.
    ///
    /// Several enabled rules for one event type is a configuration error; the
    /// most recently created one wins so the event is never sent twice.
    pub async fn rule_for(&self, event_type: &str) -> Result<Option<NotificationRule>> {
        let mut rules = self.rules.enabled_rules(event_type).await?;
        rules.retain(|rule| rule.enabled);

        if rules.len() > 1 {
            warn!(
                event_type,
                enabled_rules = rules.len(),
                "Multiple enabled notification rules, using the most recently created"
            );
        }

        // Ties on created_at fall back to the id so the pick is stable.
        Ok(rules
            .into_iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))))
    }

    /// Store a rule. An enabled rule must point at an active template and
    /// becomes the only enabled rule for its event type.
    pub async fn save_rule(&self, rule: NotificationRule) -> Result<NotificationRule, RuleError> {
        if rule.event_type.trim().is_empty() {
            return Err(RuleError::MissingEventType);
        }

        if rule.enabled {
            let template = self
                .templates
                .get_template(&rule.template_id)
                .await?
                .ok_or_else(|| RuleError::UnknownTemplate(rule.template_id.clone()))?;

            if !template.is_active {
                return Err(RuleError::InactiveTemplate(rule.template_id.clone()));
            }
        }

        let rule = self.rules.save_rule(rule).await?;

        if rule.enabled {
            let disabled = self
                .rules
                .disable_other_rules(&rule.event_type, rule.id)
                .await?;
            if disabled > 0 {
                info!(
                    event_type = %rule.event_type,
                    disabled,
                    "Disabled previously enabled rules for event type"
                );
            }
        }

        Ok(rule)
    }
}
