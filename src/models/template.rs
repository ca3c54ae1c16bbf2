use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const DEFAULT_CATEGORY: &str = "general";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    /// Stable text key referenced by notification rules.
    pub id: String,
    pub name: String,
    pub subject: String,
    pub body_html: String,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "default_metadata")]
    pub metadata: JsonValue,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

fn default_active() -> bool {
    true
}

fn default_metadata() -> JsonValue {
    serde_json::json!({})
}

impl EmailTemplate {
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        body_html: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            subject: subject.into(),
            body_html: body_html.into(),
            body_text: None,
            category: default_category(),
            is_active: true,
            metadata: default_metadata(),
            updated_at: None,
        }
    }

    pub fn with_text(mut self, body_text: impl Into<String>) -> Self {
        self.body_text = Some(body_text.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Body of the template upsert endpoint; the key comes from the path.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub subject: String,
    pub body_html: String,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "default_metadata")]
    pub metadata: JsonValue,
}

impl TemplateRequest {
    pub fn into_template(self, key: &str) -> EmailTemplate {
        EmailTemplate {
            id: key.to_string(),
            name: self.name.unwrap_or_else(|| key.to_string()),
            subject: self.subject,
            body_html: self.body_html,
            body_text: self.body_text,
            category: self.category,
            is_active: self.is_active,
            metadata: self.metadata,
            updated_at: None,
        }
    }
}

/// Template body after interpolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

/// What the render step produced for a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The row's template was found and interpolated.
    Rendered(RenderedEmail),
    /// No template (or no template key); a generic message was built from the event type.
    FallbackRendered(RenderedEmail),
}

impl RenderOutcome {
    pub fn email(&self) -> &RenderedEmail {
        match self {
            RenderOutcome::Rendered(email) | RenderOutcome::FallbackRendered(email) => email,
        }
    }

    pub fn into_email(self) -> RenderedEmail {
        match self {
            RenderOutcome::Rendered(email) | RenderOutcome::FallbackRendered(email) => email,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, RenderOutcome::FallbackRendered(_))
    }
}
