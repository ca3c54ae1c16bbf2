use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientListKind {
    Static,
    RoleBased,
    Dynamic,
    Custom,
}

impl RecipientListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientListKind::Static => "static",
            RecipientListKind::RoleBased => "role_based",
            RecipientListKind::Dynamic => "dynamic",
            RecipientListKind::Custom => "custom",
        }
    }
}

impl fmt::Display for RecipientListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RecipientListKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(RecipientListKind::Static),
            "role_based" => Ok(RecipientListKind::RoleBased),
            "dynamic" => Ok(RecipientListKind::Dynamic),
            "custom" => Ok(RecipientListKind::Custom),
            other => Err(anyhow::anyhow!("Unknown recipient list kind '{}'", other)),
        }
    }
}

/// A named, reusable rule for computing a set of addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientList {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub kind: RecipientListKind,
    /// Kind-specific configuration, see [`StaticConfig`], [`RoleBasedConfig`],
    /// [`DynamicConfig`] and [`CustomConfig`].
    pub config: JsonValue,
    pub is_active: bool,
    pub is_system: bool,
}

impl RecipientList {
    pub fn new(code: impl Into<String>, kind: RecipientListKind, config: JsonValue) -> Self {
        let code = code.into();
        Self {
            id: Uuid::new_v4(),
            name: code.clone(),
            code,
            kind,
            config,
            is_active: true,
            is_system: false,
        }
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub emails: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleBasedConfig {
    #[serde(default)]
    pub roles: Vec<String>,
    /// Preference key checked for opt-out; defaults to the template category.
    #[serde(default)]
    pub preference: Option<String>,
}

/// Well-known actor named by the triggering event's payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorSelector {
    Referee,
    Referrer,
    TriggeredBy,
    Submitter,
    /// Arbitrary payload fields holding the address and/or the user id.
    Field {
        #[serde(default)]
        email_field: Option<String>,
        #[serde(default)]
        user_id_field: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamicConfig {
    pub actor: ActorSelector,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomConfig {
    pub strategy: String,
    #[serde(default)]
    pub params: JsonValue,
}

/// A profile as read from the account store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<String>,
    pub is_active: bool,
    /// Category -> subscribed. A missing key means subscribed.
    #[serde(default)]
    pub preferences: HashMap<String, bool>,
    #[serde(default)]
    pub attributes: JsonValue,
}

impl Profile {
    pub fn new(email: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: Some(email.into()),
            first_name: None,
            last_name: None,
            role: Some(role.into()),
            is_active: true,
            preferences: HashMap::new(),
            attributes: serde_json::json!({}),
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn with_preference(mut self, category: impl Into<String>, subscribed: bool) -> Self {
        self.preferences.insert(category.into(), subscribed);
        self
    }

    pub fn with_attributes(mut self, attributes: JsonValue) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn is_subscribed(&self, category: &str) -> bool {
        self.preferences.get(category).copied().unwrap_or(true)
    }

    pub fn display_name(&self) -> Option<String> {
        let full = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let full = full.trim();
        (!full.is_empty()).then(|| full.to_string())
    }
}

/// A concrete address produced by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub email: String,
    pub user_id: Option<Uuid>,
    pub display_name: Option<String>,
    pub role: Option<String>,
}

impl Recipient {
    pub fn address(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            user_id: None,
            display_name: None,
            role: None,
        }
    }

    pub fn from_profile(email: impl Into<String>, profile: &Profile) -> Self {
        Self {
            email: email.into(),
            user_id: Some(profile.id),
            display_name: profile.display_name(),
            role: profile.role.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientPreview {
    pub list_code: Option<String>,
    pub kind: Option<RecipientListKind>,
    /// False for `dynamic` lists, which depend on the triggering payload.
    pub accurate: bool,
    pub recipients: Vec<Recipient>,
}
