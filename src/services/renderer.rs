//! Placeholder interpolation and the per-event variable table.

use std::{collections::HashMap, sync::LazyLock};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use regex::{Captures, Regex};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::models::{
    queue::EmailQueueItem,
    template::{EmailTemplate, RenderOutcome, RenderedEmail},
    validation::check_placeholders,
};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder pattern"));

static LEFTOVER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{.*?\}\}").expect("leftover pattern"));

const DATE_FORMAT: &str = "%m/%d/%Y";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("Malformed template '{template}': {reason}")]
    Malformed { template: String, reason: String },

    #[error("Template '{0}' rendered an empty subject")]
    EmptySubject(String),
}

pub type Variables = HashMap<String, String>;

/// Replace every `{{ key }}` with its variable, matching keys case- and
/// whitespace-insensitively. Unknown placeholders are removed, and the
/// output never contains `{{`.
pub fn interpolate(text: &str, variables: &Variables) -> String {
    let mut out = PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            let key = caps[1].trim().to_lowercase();
            variables.get(&key).cloned().unwrap_or_default()
        })
        .into_owned();

    // Each pass shortens the text, so this terminates.
    while out.contains("{{") {
        let stripped = LEFTOVER.replace_all(&out, "").into_owned();
        out = if stripped.len() < out.len() {
            stripped
        } else {
            out.replace("{{", "")
        };
    }

    out
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// `"survey_published"` -> `"Survey Published"`.
pub fn humanize_event_type(event_type: &str) -> String {
    event_type
        .split(['_', '-', '.'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Where a template variable takes its value from.
#[derive(Debug, Clone, Copy)]
enum Source {
    /// Payload string (or number) field, empty when absent.
    Field(&'static str),
    /// Payload field with a default when absent or empty.
    FieldOr(&'static str, &'static str),
    /// First non-empty of two payload fields.
    EitherField(&'static str, &'static str),
    /// Payload date field formatted for display.
    Date(&'static str),
    /// `first last`, trimmed, with a default when both are empty.
    FullName(&'static str, &'static str, &'static str),
    /// `payload.portal_url`, else the portal base + path + `payload.id`.
    PortalLink(&'static str),
    /// Portal base + fixed path.
    PortalPath(&'static str),
    Fixed(&'static str),
}

const UPDATE_PUBLISHED: &[(&str, Source)] = &[
    ("title", Source::FieldOr("title", "Update")),
    ("content", Source::Field("content")),
    ("description", Source::EitherField("description", "summary")),
    ("update_type", Source::FieldOr("update_type", "General Update")),
    ("portal_url", Source::PortalLink("/updates/")),
    ("update_date", Source::Date("created_at")),
];

const SURVEY_PUBLISHED: &[(&str, Source)] = &[
    ("title", Source::FieldOr("title", "Survey")),
    ("description", Source::Field("description")),
    ("survey_title", Source::FieldOr("title", "Survey")),
    ("survey_description", Source::Field("description")),
    ("survey_type", Source::FieldOr("survey_type", "General Survey")),
    ("due_date", Source::Date("due_date")),
    ("survey_due_date", Source::Date("due_date")),
    ("portal_url", Source::PortalLink("/surveys/")),
];

const EVENT_PUBLISHED: &[(&str, Source)] = &[
    ("title", Source::FieldOr("title", "Event")),
    ("description", Source::Field("description")),
    ("event_title", Source::FieldOr("title", "Event")),
    ("event_description", Source::Field("description")),
    ("event_type", Source::FieldOr("event_type", "General Event")),
    ("event_date", Source::Date("event_date")),
    ("date", Source::Date("event_date")),
    ("time", Source::Field("event_time")),
    ("location", Source::Field("location")),
    ("event_location", Source::Field("location")),
    ("portal_url", Source::PortalLink("/events/")),
];

const USER_REGISTERED: &[(&str, Source)] = &[
    ("welcome_message", Source::Fixed("Welcome to the portal!")),
    ("login_url", Source::PortalPath("")),
    ("portal_url", Source::PortalPath("")),
];

const REFERRAL: &[(&str, Source)] = &[
    ("referee_first_name", Source::Field("referee_first_name")),
    ("referee_last_name", Source::Field("referee_last_name")),
    ("referee_email", Source::Field("referee_email")),
    ("referee_phone", Source::Field("referee_phone")),
    (
        "referee_name",
        Source::FullName("referee_first_name", "referee_last_name", "Referee"),
    ),
    ("referrer_first_name", Source::Field("referrer_first_name")),
    ("referrer_last_name", Source::Field("referrer_last_name")),
    ("referrer_email", Source::Field("referrer_email")),
    (
        "referrer_name",
        Source::FullName("referrer_first_name", "referrer_last_name", "Referrer"),
    ),
    ("referral_code", Source::Field("referral_code")),
    ("dsp_name", Source::Field("dsp_name")),
    ("dsp_code", Source::Field("dsp_code")),
    ("company", Source::Field("dsp_name")),
    ("created_date", Source::Date("created_at")),
    ("status", Source::FieldOr("status", "pending")),
    (
        "title",
        Source::FullName("referee_first_name", "referee_last_name", "Referral"),
    ),
    (
        "referral_name",
        Source::FullName("referee_first_name", "referee_last_name", ""),
    ),
    ("referral_email", Source::Field("referee_email")),
    ("portal_url", Source::PortalLink("/referrals")),
];

const CONTACT_FORM_SUBMITTED: &[(&str, Source)] = &[
    ("name", Source::Field("name")),
    ("email", Source::Field("email")),
    ("message", Source::Field("message")),
    ("portal_url", Source::PortalPath("/admin/contacts")),
];

const EVENT_REGISTRATION: &[(&str, Source)] = &[
    ("event_title", Source::FieldOr("event_title", "Event")),
    ("registrant_name", Source::Field("registrant_name")),
    ("portal_url", Source::PortalPath("/events")),
];

fn mapping_for(event_type: &str) -> &'static [(&'static str, Source)] {
    match event_type {
        "update_published" => UPDATE_PUBLISHED,
        "survey_published" => SURVEY_PUBLISHED,
        "event_published" => EVENT_PUBLISHED,
        "user_registered" => USER_REGISTERED,
        "referral_submitted" | "referral_created" => REFERRAL,
        "contact_form_submitted" => CONTACT_FORM_SUBMITTED,
        "event_registration" => EVENT_REGISTRATION,
        _ => &[],
    }
}

fn payload_str(payload: &JsonValue, key: &str) -> String {
    match payload.get(key) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn format_date(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.format(DATE_FORMAT).to_string();
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d") {
        return parsed.format(DATE_FORMAT).to_string();
    }
    raw.to_string()
}

#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    portal_url: String,
}

impl TemplateRenderer {
    pub fn new(portal_url: impl Into<String>) -> Self {
        Self {
            portal_url: portal_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, source: Source, payload: &JsonValue) -> String {
        match source {
            Source::Field(key) => payload_str(payload, key),
            Source::FieldOr(key, default) => {
                let value = payload_str(payload, key);
                if value.is_empty() {
                    default.to_string()
                } else {
                    value
                }
            }
            Source::EitherField(first, second) => {
                let value = payload_str(payload, first);
                if value.is_empty() {
                    payload_str(payload, second)
                } else {
                    value
                }
            }
            Source::Date(key) => format_date(&payload_str(payload, key)),
            Source::FullName(first, last, default) => {
                let full = format!("{} {}", payload_str(payload, first), payload_str(payload, last));
                let full = full.trim();
                if full.is_empty() {
                    default.to_string()
                } else {
                    full.to_string()
                }
            }
            Source::PortalLink(path) => {
                let explicit = payload_str(payload, "portal_url");
                if explicit.is_empty() {
                    format!("{}{}{}", self.portal_url, path, payload_str(payload, "id"))
                } else {
                    explicit
                }
            }
            Source::PortalPath(path) => format!("{}{}", self.portal_url, path),
            Source::Fixed(value) => value.to_string(),
        }
    }

    /// Base variables for every row, overlaid with the event type's mapping.
    pub fn variables(
        &self,
        item: &EmailQueueItem,
        recipient_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Variables {
        let mut variables = Variables::new();
        let user_name = recipient_name
            .filter(|name| !name.is_empty())
            .unwrap_or("User");

        variables.insert("user_name".to_string(), user_name.to_string());
        variables.insert("user_email".to_string(), item.to_email.clone());
        variables.insert(
            "current_date".to_string(),
            now.format(DATE_FORMAT).to_string(),
        );
        variables.insert("current_year".to_string(), now.year().to_string());
        variables.insert("portal_url".to_string(), self.portal_url.clone());

        for (name, source) in mapping_for(&item.event_type) {
            variables.insert(name.to_string(), self.resolve(*source, &item.event_payload));
        }

        variables
    }

    pub fn render(
        &self,
        template: Option<&EmailTemplate>,
        event_type: &str,
        variables: &Variables,
    ) -> Result<RenderOutcome, RenderError> {
        let Some(template) = template else {
            return Ok(RenderOutcome::FallbackRendered(self.fallback(event_type)));
        };

        let malformed = |e: anyhow::Error| RenderError::Malformed {
            template: template.id.clone(),
            reason: e.to_string(),
        };
        check_placeholders("subject", &template.subject).map_err(malformed)?;
        check_placeholders("body_html", &template.body_html).map_err(malformed)?;
        if let Some(text) = &template.body_text {
            check_placeholders("body_text", text).map_err(malformed)?;
        }

        let subject = interpolate(&template.subject, variables);
        if subject.trim().is_empty() {
            return Err(RenderError::EmptySubject(template.id.clone()));
        }

        let escaped: Variables = variables
            .iter()
            .map(|(key, value)| (key.clone(), escape_html(value)))
            .collect();

        Ok(RenderOutcome::Rendered(RenderedEmail {
            subject,
            html: interpolate(&template.body_html, &escaped),
            text: template
                .body_text
                .as_ref()
                .map(|text| interpolate(text, variables)),
        }))
    }

    /// Generic message used when a row has no template to render.
    pub fn fallback(&self, event_type: &str) -> RenderedEmail {
        let subject = humanize_event_type(event_type);
        let subject = if subject.is_empty() {
            "Notification".to_string()
        } else {
            subject
        };

        let html = format!(
            "<div style=\"font-family: Arial, sans-serif; padding: 20px;\">\
             <h2>{}</h2>\
             <p>You have a new notification.</p>\
             <p>Please log in to the <a href=\"{}\">portal</a> to view more details.</p>\
             </div>",
            escape_html(&subject),
            escape_html(&self.portal_url)
        );
        let text = format!(
            "{}\n\nYou have a new notification.\nPlease log in to the portal to view more details: {}",
            subject, self.portal_url
        );

        RenderedEmail {
            subject,
            html,
            text: Some(text),
        }
    }
}
