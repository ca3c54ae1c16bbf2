use anyhow::{Result, anyhow};

use crate::models::template::EmailTemplate;

pub fn validate_email(address: &str) -> Result<()> {
    let address = address.trim();

    if address.is_empty() {
        return Err(anyhow!("Email address cannot be empty"));
    }

    if address.len() > 254 {
        return Err(anyhow!("Email address too long (maximum 254 characters)"));
    }

    let (local, domain) = address
        .rsplit_once('@')
        .ok_or_else(|| anyhow!("Email address must contain '@'"))?;

    if local.is_empty() || domain.is_empty() {
        return Err(anyhow!("Email address is missing its local part or domain"));
    }

    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(anyhow!("Email domain '{}' is not valid", domain));
    }

    if address.chars().any(char::is_whitespace) {
        return Err(anyhow!("Email address contains whitespace"));
    }

    Ok(())
}

/// Template keys are referenced by name from rules, so they must be stable slugs.
pub fn validate_template_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(anyhow!("Template key cannot be empty"));
    }

    if key.len() > 100 {
        return Err(anyhow!("Template key too long (maximum 100 characters)"));
    }

    let valid_chars = key
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

    if !valid_chars {
        return Err(anyhow!(
            "Template key may only contain lowercase letters, digits, '_' and '-'"
        ));
    }

    Ok(())
}

pub fn validate_template(template: &EmailTemplate) -> Result<()> {
    validate_template_key(&template.id)?;

    if template.subject.trim().is_empty() {
        return Err(anyhow!("Template subject cannot be empty"));
    }

    if template.body_html.trim().is_empty() {
        return Err(anyhow!("Template HTML body cannot be empty"));
    }

    check_placeholders("subject", &template.subject)?;
    check_placeholders("body_html", &template.body_html)?;
    if let Some(text) = &template.body_text {
        check_placeholders("body_text", text)?;
    }

    Ok(())
}

/// Every `{{` must be closed by a `}}` before the next `{{`, with no
/// single braces in between.
pub fn check_placeholders(field: &str, text: &str) -> Result<()> {
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| anyhow!("Unterminated placeholder in {}", field))?;

        if after_open[..close].contains("{{") {
            return Err(anyhow!("Nested placeholder in {}", field));
        }

        if after_open[..close].contains(['{', '}']) {
            return Err(anyhow!("Stray brace inside placeholder in {}", field));
        }

        rest = &after_open[close + 2..];
    }

    Ok(())
}
