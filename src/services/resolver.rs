//! Turns a recipient list definition plus an event payload into addresses.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    models::{
        recipient::{
            ActorSelector, CustomConfig, DynamicConfig, Profile, Recipient, RecipientList,
            RecipientListKind, RoleBasedConfig, StaticConfig,
        },
        validation::validate_email,
    },
    store::ProfileStore,
};

/// Operator-selectable strategy behind `custom` recipient lists.
#[async_trait]
pub trait CustomRecipientStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(
        &self,
        params: &JsonValue,
        payload: &JsonValue,
        profiles: &dyn ProfileStore,
    ) -> Result<Vec<Recipient>>;
}

/// Active profiles whose `attributes[attribute]` equals `payload[payload_key]`.
///
/// Params: `{"attribute": "dsp_code", "payload_key": "dsp_code", "roles": [..]?}`.
pub struct AttributeMatchStrategy;

#[async_trait]
impl CustomRecipientStrategy for AttributeMatchStrategy {
    fn name(&self) -> &'static str {
        "attribute_match"
    }

    async fn resolve(
        &self,
        params: &JsonValue,
        payload: &JsonValue,
        profiles: &dyn ProfileStore,
    ) -> Result<Vec<Recipient>> {
        let attribute = params
            .get("attribute")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| anyhow!("attribute_match requires an 'attribute' parameter"))?;
        let payload_key = params
            .get("payload_key")
            .and_then(JsonValue::as_str)
            .unwrap_or(attribute);

        let Some(expected) = payload.get(payload_key).filter(|v| !v.is_null()) else {
            return Ok(Vec::new());
        };

        let roles: Option<Vec<String>> = params
            .get("roles")
            .and_then(|roles| serde_json::from_value(roles.clone()).ok());

        let candidates = match roles {
            Some(roles) if !roles.is_empty() => profiles.active_profiles_with_roles(&roles).await?,
            _ => profiles.active_profiles().await?,
        };

        Ok(candidates
            .iter()
            .filter(|profile| profile.attributes.get(attribute) == Some(expected))
            .filter_map(|profile| {
                profile
                    .email
                    .as_ref()
                    .map(|email| Recipient::from_profile(email.clone(), profile))
            })
            .collect())
    }
}

/// Payload field names for each well-known actor: (email field, user id field).
fn actor_fields(selector: &ActorSelector) -> (Option<&str>, Option<&str>) {
    match selector {
        ActorSelector::Referee => (Some("referee_email"), Some("referee_id")),
        ActorSelector::Referrer => (Some("referrer_email"), Some("referrer_id")),
        ActorSelector::TriggeredBy => (Some("triggered_by_email"), Some("triggered_by")),
        ActorSelector::Submitter => (Some("user_email"), Some("user_id")),
        ActorSelector::Field {
            email_field,
            user_id_field,
        } => (email_field.as_deref(), user_id_field.as_deref()),
    }
}

fn non_empty_str<'a>(payload: &'a JsonValue, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Keep the first occurrence of each address, compared case-insensitively.
pub fn dedupe_by_email(recipients: Vec<Recipient>) -> Vec<Recipient> {
    let mut seen = HashSet::new();
    recipients
        .into_iter()
        .filter(|r| seen.insert(r.email.trim().to_lowercase()))
        .collect()
}

pub struct RecipientResolver {
    profiles: Arc<dyn ProfileStore>,
    strategies: HashMap<&'static str, Arc<dyn CustomRecipientStrategy>>,
}

impl RecipientResolver {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        let mut resolver = Self {
            profiles,
            strategies: HashMap::new(),
        };
        resolver.register(Arc::new(AttributeMatchStrategy));
        resolver
    }

    pub fn register(&mut self, strategy: Arc<dyn CustomRecipientStrategy>) {
        self.strategies.insert(strategy.name(), strategy);
    }

    /// Resolve `list` for one event. `category` is the notification category
    /// checked against profile opt-outs for role-based lists.
    pub async fn resolve(
        &self,
        list: &RecipientList,
        payload: &JsonValue,
        category: &str,
    ) -> Result<Vec<Recipient>> {
        if !list.is_active {
            debug!(list = %list.code, "Recipient list inactive, resolving to nobody");
            return Ok(Vec::new());
        }

        let recipients = match list.kind {
            RecipientListKind::Static => self.resolve_static(list).await?,
            RecipientListKind::RoleBased => self.resolve_role_based(list, category).await?,
            RecipientListKind::Dynamic => self.resolve_dynamic(list, payload).await?,
            RecipientListKind::Custom => self.resolve_custom(list, payload).await?,
        };

        let recipients = dedupe_by_email(recipients);
        debug!(
            list = %list.code,
            kind = %list.kind,
            count = recipients.len(),
            "Recipients resolved"
        );
        Ok(recipients)
    }

    fn config<T: serde::de::DeserializeOwned>(list: &RecipientList) -> Result<T> {
        serde_json::from_value(list.config.clone()).map_err(|e| {
            anyhow!(
                "Invalid {} configuration for recipient list '{}': {}",
                list.kind,
                list.code,
                e
            )
        })
    }

    async fn resolve_static(&self, list: &RecipientList) -> Result<Vec<Recipient>> {
        let config: StaticConfig = Self::config(list)?;
        let mut recipients = Vec::with_capacity(config.emails.len());

        for email in config.emails {
            let email = email.trim().to_string();
            if email.is_empty() {
                continue;
            }

            // Profile metadata is optional decoration; lookup failures fall back to the bare address.
            let recipient = match self.profiles.profile_by_email(&email).await {
                Ok(Some(profile)) => Recipient::from_profile(email, &profile),
                Ok(None) => Recipient::address(email),
                Err(e) => {
                    warn!(error = %e, email = %email, "Profile lookup failed for static recipient");
                    Recipient::address(email)
                }
            };
            recipients.push(recipient);
        }

        Ok(recipients)
    }

    async fn resolve_role_based(
        &self,
        list: &RecipientList,
        category: &str,
    ) -> Result<Vec<Recipient>> {
        let config: RoleBasedConfig = Self::config(list)?;
        if config.roles.is_empty() {
            return Ok(Vec::new());
        }

        let preference = config.preference.as_deref().unwrap_or(category);
        let profiles = self.profiles.active_profiles_with_roles(&config.roles).await?;

        Ok(profiles
            .iter()
            .filter(|profile| profile.is_subscribed(preference))
            .filter_map(|profile| {
                profile
                    .email
                    .as_ref()
                    .map(|email| Recipient::from_profile(email.clone(), profile))
            })
            .collect())
    }

    async fn resolve_dynamic(
        &self,
        list: &RecipientList,
        payload: &JsonValue,
    ) -> Result<Vec<Recipient>> {
        let config: DynamicConfig = Self::config(list)?;
        let (email_field, user_id_field) = actor_fields(&config.actor);

        if let Some(email) = email_field.and_then(|field| non_empty_str(payload, field)) {
            if let Err(e) = validate_email(email) {
                warn!(error = %e, list = %list.code, "Dynamic recipient address rejected");
                return Ok(Vec::new());
            }
            let profile = self.profiles.profile_by_email(email).await.ok().flatten();
            return Ok(vec![match profile {
                Some(profile) => Recipient::from_profile(email, &profile),
                None => Recipient::address(email),
            }]);
        }

        let user_id = user_id_field
            .and_then(|field| non_empty_str(payload, field))
            .and_then(|raw| Uuid::parse_str(raw).ok());

        let Some(user_id) = user_id else {
            debug!(list = %list.code, "Payload does not name the dynamic recipient");
            return Ok(Vec::new());
        };

        Ok(self
            .profiles
            .profile_by_id(user_id)
            .await?
            .filter(|profile| profile.is_active)
            .and_then(|profile: Profile| {
                profile
                    .email
                    .clone()
                    .map(|email| Recipient::from_profile(email, &profile))
            })
            .into_iter()
            .collect())
    }

    async fn resolve_custom(
        &self,
        list: &RecipientList,
        payload: &JsonValue,
    ) -> Result<Vec<Recipient>> {
        let config: CustomConfig = Self::config(list)?;
        let strategy = self
            .strategies
            .get(config.strategy.as_str())
            .ok_or_else(|| anyhow!("Unknown custom recipient strategy '{}'", config.strategy))?;

        strategy
            .resolve(&config.params, payload, self.profiles.as_ref())
            .await
    }
}
